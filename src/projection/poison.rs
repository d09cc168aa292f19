//! Dead-letter and poison-event quarantine for the projection engine. Two
//! distinct stores: a dead-letter row per dropped workpool task, and a
//! poison record per `(projection, eventId)` pair that halts further
//! attempts once a single event has repeatedly failed a handler.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonStatus {
    Quarantined,
    Replayed,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct PoisonRecord {
    pub projection_name: String,
    pub event_id: String,
    pub global_position: i64,
    pub reason: String,
    pub status: PoisonStatus,
}

#[async_trait]
pub trait PoisonStore: Send + Sync {
    /// `true` if this `(projection, eventId)` pair is already quarantined
    /// and further attempts must be skipped.
    async fn is_quarantined(&self, projection_name: &str, event_id: &str) -> bool;

    async fn quarantine(&self, record: PoisonRecord);

    async fn list_quarantined(&self, projection_name: Option<&str>) -> Vec<PoisonRecord>;

    /// `quarantined -> replayed`.
    async fn mark_replayed(&self, projection_name: &str, event_id: &str) -> bool;

    /// `quarantined -> ignored`.
    async fn mark_ignored(&self, projection_name: &str, event_id: &str) -> bool;
}

#[derive(Default)]
pub struct InMemoryPoisonStore {
    records: RwLock<HashMap<(String, String), PoisonRecord>>,
}

impl InMemoryPoisonStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoisonStore for InMemoryPoisonStore {
    async fn is_quarantined(&self, projection_name: &str, event_id: &str) -> bool {
        self.records
            .read()
            .await
            .get(&(projection_name.to_string(), event_id.to_string()))
            .map(|r| r.status == PoisonStatus::Quarantined)
            .unwrap_or(false)
    }

    async fn quarantine(&self, record: PoisonRecord) {
        #[cfg(feature = "otel")]
        {
            use crate::metrics::{self, PROJECTION_POISON_TOTAL};
            PROJECTION_POISON_TOTAL.add(1, &[metrics::component_attr(&record.projection_name)]);
        }
        self.records.write().await.insert(
            (record.projection_name.clone(), record.event_id.clone()),
            record,
        );
    }

    async fn list_quarantined(&self, projection_name: Option<&str>) -> Vec<PoisonRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.status == PoisonStatus::Quarantined)
            .filter(|r| projection_name.map_or(true, |name| name == r.projection_name))
            .cloned()
            .collect()
    }

    async fn mark_replayed(&self, projection_name: &str, event_id: &str) -> bool {
        self.transition(projection_name, event_id, PoisonStatus::Replayed)
            .await
    }

    async fn mark_ignored(&self, projection_name: &str, event_id: &str) -> bool {
        self.transition(projection_name, event_id, PoisonStatus::Ignored)
            .await
    }
}

impl InMemoryPoisonStore {
    async fn transition(&self, projection_name: &str, event_id: &str, to: PoisonStatus) -> bool {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&(projection_name.to_string(), event_id.to_string())) {
            if record.status == PoisonStatus::Quarantined {
                record.status = to;
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    Pending,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub projection_name: String,
    pub task_id: String,
    pub last_error: String,
    pub status: DeadLetterStatus,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, record: DeadLetterRecord);

    async fn list(&self, projection_name: Option<&str>) -> Vec<DeadLetterRecord>;
}

#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, record: DeadLetterRecord) {
        self.records.write().await.push(record);
    }

    async fn list(&self, projection_name: Option<&str>) -> Vec<DeadLetterRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| projection_name.map_or(true, |name| name == r.projection_name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(projection: &str, event_id: &str) -> PoisonRecord {
        PoisonRecord {
            projection_name: projection.to_string(),
            event_id: event_id.to_string(),
            global_position: 1,
            reason: "handler panicked".to_string(),
            status: PoisonStatus::Quarantined,
        }
    }

    #[tokio::test]
    async fn quarantined_event_halts_further_attempts() {
        let store = InMemoryPoisonStore::new();
        store.quarantine(record("summary", "e1")).await;
        assert!(store.is_quarantined("summary", "e1").await);
    }

    #[tokio::test]
    async fn replay_transitions_out_of_quarantine() {
        let store = InMemoryPoisonStore::new();
        store.quarantine(record("summary", "e1")).await;
        assert!(store.mark_replayed("summary", "e1").await);
        assert!(!store.is_quarantined("summary", "e1").await);
    }

    #[tokio::test]
    async fn transition_on_non_quarantined_record_fails() {
        let store = InMemoryPoisonStore::new();
        assert!(!store.mark_ignored("summary", "missing").await);
    }
}
