//! In-memory event store. Default backend: no external dependencies,
//! suited to local development and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    global_position, resolve_correlation_id, AppendOutcome, Event, EventStore, NewEvent, Result,
};
use crate::ids;

#[derive(Default)]
struct Inner {
    /// All events, in append order (which is also `global_position` order
    /// for this backend, since the clock is monotone-enough in practice).
    events: Vec<Event>,
    /// `(stream_type, stream_id) -> current_version`.
    stream_versions: HashMap<(String, String), u32>,
    /// `idempotency_key -> index into events`.
    by_idempotency_key: HashMap<String, usize>,
}

/// In-memory [`EventStore`], backed by a single `RwLock`-guarded vector.
///
/// Appends to different streams still serialize on this one lock, which is
/// fine at in-process scale and keeps the OCC check and the write atomic
/// by construction: every reader sees a consistent snapshot across the
/// whole mutation, not just its own stream.
pub struct InMemoryEventStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_to_stream(
        &self,
        stream_type: &str,
        stream_id: &str,
        expected_version: u32,
        bounded_context: &str,
        events: Vec<NewEvent>,
    ) -> Result<AppendOutcome> {
        if events.is_empty() {
            let version = *self
                .inner
                .read()
                .await
                .stream_versions
                .get(&(stream_type.to_string(), stream_id.to_string()))
                .unwrap_or(&0);
            return Ok(AppendOutcome::Success {
                event_ids: vec![],
                global_positions: vec![],
                new_version: version,
            });
        }

        // Idempotent no-op replay: if every event in this batch already has
        // a matching idempotency key, return the prior identifiers
        // unchanged. Only a single-event batch carrying a key is
        // special-cased, matching the common "retry one command" shape.
        if events.len() == 1 {
            if let Some(key) = events[0].idempotency_key.as_deref() {
                let inner = self.inner.read().await;
                if let Some(&idx) = inner.by_idempotency_key.get(key) {
                    let existing = &inner.events[idx];
                    return Ok(AppendOutcome::Success {
                        event_ids: vec![existing.event_id.clone()],
                        global_positions: vec![existing.global_position],
                        new_version: existing.version,
                    });
                }
            }
        }

        let mut inner = self.inner.write().await;
        let key = (stream_type.to_string(), stream_id.to_string());
        let current_version = *inner.stream_versions.get(&key).unwrap_or(&0);

        if current_version != expected_version {
            return Ok(AppendOutcome::Conflict {
                current_version,
            });
        }

        let now = chrono::Utc::now();
        let mut event_ids = Vec::with_capacity(events.len());
        let mut global_positions = Vec::with_capacity(events.len());
        let mut version = current_version;

        for mut new_event in events {
            version += 1;
            let correlation_id = resolve_correlation_id(&mut new_event.metadata);
            let causation_id = new_event
                .metadata
                .as_ref()
                .and_then(|m| m.causation_id.clone());
            let event_id = ids::new_id();
            let position = global_position(now.timestamp_millis(), stream_type, stream_id, version);

            let event = Event {
                event_id: event_id.clone(),
                event_type: new_event.event_type,
                stream_type: stream_type.to_string(),
                stream_id: stream_id.to_string(),
                version,
                global_position: position,
                bounded_context: bounded_context.to_string(),
                category: new_event.category,
                schema_version: new_event.schema_version,
                correlation_id,
                causation_id,
                timestamp: now,
                payload: new_event.payload,
                metadata: new_event.metadata,
                idempotency_key: new_event.idempotency_key.clone(),
            };

            let idx = inner.events.len();
            if let Some(idem_key) = new_event.idempotency_key {
                inner.by_idempotency_key.insert(idem_key, idx);
            }
            event_ids.push(event_id);
            global_positions.push(position);
            inner.events.push(event);
        }

        inner.stream_versions.insert(key, version);

        Ok(AppendOutcome::Success {
            event_ids,
            global_positions,
            new_version: version,
        })
    }

    async fn read_stream(&self, stream_type: &str, stream_id: &str) -> Result<Vec<Event>> {
        self.read_stream_from(stream_type, stream_id, 1).await
    }

    async fn read_stream_from(
        &self,
        stream_type: &str,
        stream_id: &str,
        from_version: u32,
    ) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| {
                e.stream_type == stream_type && e.stream_id == stream_id && e.version >= from_version
            })
            .cloned()
            .collect())
    }

    async fn get_stream_version(&self, stream_type: &str, stream_id: &str) -> Result<u32> {
        let inner = self.inner.read().await;
        Ok(*inner
            .stream_versions
            .get(&(stream_type.to_string(), stream_id.to_string()))
            .unwrap_or(&0))
    }

    async fn read_from_position(
        &self,
        from_position: i64,
        limit: usize,
        event_types: Option<&[String]>,
        bounded_context: Option<&str>,
    ) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut matched: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.global_position > from_position)
            .filter(|e| {
                event_types.map_or(true, |types| types.iter().any(|t| t == &e.event_type))
            })
            .filter(|e| bounded_context.map_or(true, |bc| bc == e.bounded_context))
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.global_position);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn get_by_correlation(&self, correlation_id: &str) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut matched: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.global_position);
        Ok(matched)
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Event>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_idempotency_key
            .get(key)
            .map(|&idx| inner.events[idx].clone()))
    }

    async fn max_global_position(&self) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner.events.iter().map(|e| e.global_position).max().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::EventCategory;
    use serde_json::json;

    fn ev(event_type: &str) -> NewEvent {
        NewEvent::new(event_type, json!({}))
    }

    #[tokio::test]
    async fn append_assigns_dense_versions_and_monotone_positions() {
        let store = InMemoryEventStore::new();
        let outcome = store
            .append_to_stream("order", "o1", 0, "orders", vec![ev("OrderCreated")])
            .await
            .unwrap();
        match outcome {
            AppendOutcome::Success { new_version, .. } => assert_eq!(new_version, 1),
            _ => panic!("expected success"),
        }

        let outcome = store
            .append_to_stream("order", "o1", 1, "orders", vec![ev("OrderItemAdded")])
            .await
            .unwrap();
        match outcome {
            AppendOutcome::Success {
                new_version,
                global_positions,
                ..
            } => {
                assert_eq!(new_version, 2);
                let events = store.read_stream("order", "o1").await.unwrap();
                assert!(global_positions[0] > events[0].global_position);
            }
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn occ_conflict_reported_for_two_concurrent_expected_versions() {
        let store = InMemoryEventStore::new();
        store
            .append_to_stream("order", "o1", 0, "orders", vec![ev("OrderCreated")])
            .await
            .unwrap();

        // Two concurrent callers both believe version is 1.
        let first = store
            .append_to_stream("order", "o1", 1, "orders", vec![ev("OrderItemAdded")])
            .await
            .unwrap();
        let second = store
            .append_to_stream("order", "o1", 1, "orders", vec![ev("OrderItemAdded")])
            .await
            .unwrap();

        let successes = [&first, &second]
            .iter()
            .filter(|o| matches!(o, AppendOutcome::Success { .. }))
            .count();
        let conflicts = [&first, &second]
            .iter()
            .filter(|o| matches!(o, AppendOutcome::Conflict { .. }))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);

        let events = store.read_stream("order", "o1").await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn idempotent_append_returns_identical_identifiers_on_retry() {
        let store = InMemoryEventStore::new();
        let event = ev("OrderCreated").with_idempotency_key("cmd-1");

        let first = store
            .append_to_stream("order", "o1", 0, "orders", vec![event.clone()])
            .await
            .unwrap();
        let second = store
            .append_to_stream("order", "o1", 0, "orders", vec![event])
            .await
            .unwrap();

        match (first, second) {
            (
                AppendOutcome::Success {
                    event_ids: a,
                    global_positions: ga,
                    new_version: va,
                },
                AppendOutcome::Success {
                    event_ids: b,
                    global_positions: gb,
                    new_version: vb,
                },
            ) => {
                assert_eq!(a, b);
                assert_eq!(ga, gb);
                assert_eq!(va, vb);
            }
            _ => panic!("expected both appends to succeed"),
        }
    }

    #[tokio::test]
    async fn read_from_position_over_fetches_then_filters_by_event_type() {
        let store = InMemoryEventStore::new();
        store
            .append_to_stream(
                "order",
                "o1",
                0,
                "orders",
                vec![ev("OrderCreated"), ev("OrderItemAdded"), ev("OrderItemAdded")],
            )
            .await
            .unwrap();

        let types = vec!["OrderItemAdded".to_string()];
        let filtered = store
            .read_from_position(-1, 10, Some(&types), None)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|e| e.event_type == "OrderItemAdded"));
    }

    #[tokio::test]
    async fn default_category_and_schema_version_applied() {
        let store = InMemoryEventStore::new();
        store
            .append_to_stream("order", "o1", 0, "orders", vec![ev("OrderCreated")])
            .await
            .unwrap();
        let events = store.read_stream("order", "o1").await.unwrap();
        assert!(matches!(events[0].category, EventCategory::Domain));
        assert_eq!(events[0].schema_version, 1);
    }

    #[tokio::test]
    async fn correlation_id_generated_when_absent() {
        let store = InMemoryEventStore::new();
        store
            .append_to_stream("order", "o1", 0, "orders", vec![ev("OrderCreated")])
            .await
            .unwrap();
        let events = store.read_stream("order", "o1").await.unwrap();
        assert!(!events[0].correlation_id.is_empty());
    }

    #[tokio::test]
    async fn max_global_position_is_minus_one_when_empty() {
        let store = InMemoryEventStore::new();
        assert_eq!(store.max_global_position().await.unwrap(), -1);
    }
}
