//! Per-(projection, partition) checkpoints and the `withCheckpoint` wrapper.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ProjectionHandler, Result};
use crate::event_store::Event;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn last_global_position(&self, projection_name: &str, partition_key: &str) -> i64;

    async fn advance(&self, projection_name: &str, partition_key: &str, global_position: i64);
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    positions: RwLock<HashMap<(String, String), i64>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn last_global_position(&self, projection_name: &str, partition_key: &str) -> i64 {
        *self
            .positions
            .read()
            .await
            .get(&(projection_name.to_string(), partition_key.to_string()))
            .unwrap_or(&-1)
    }

    async fn advance(&self, projection_name: &str, partition_key: &str, global_position: i64) {
        self.positions.write().await.insert(
            (projection_name.to_string(), partition_key.to_string()),
            global_position,
        );
    }
}

/// Runs `handler` for `event` under the projection's checkpoint: skips if
/// `event.global_position <= lastGlobalPosition`, otherwise runs the
/// handler and advances the checkpoint on success.
pub async fn with_checkpoint(
    checkpoints: &dyn CheckpointStore,
    projection_name: &str,
    handler: &Arc<dyn ProjectionHandler>,
    event: &Event,
) -> Result<bool> {
    let partition_key = handler.partition_key(event);
    let last = checkpoints
        .last_global_position(projection_name, &partition_key)
        .await;

    if event.global_position <= last {
        return Ok(false);
    }

    #[cfg(feature = "otel")]
    let start = std::time::Instant::now();

    let result = handler.handle(event).await;

    #[cfg(feature = "otel")]
    {
        use crate::metrics::{self, PROJECTION_DURATION};
        PROJECTION_DURATION.record(start.elapsed().as_secs_f64(), &[metrics::component_attr(projection_name)]);
    }

    result?;
    checkpoints
        .advance(projection_name, &partition_key, event.global_position)
        .await;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ProjectionHandler for CountingHandler {
        async fn handle(&self, _event: &Event) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(global_position: i64) -> Event {
        Event {
            event_id: "e1".to_string(),
            event_type: "OrderCreated".to_string(),
            stream_type: "order".to_string(),
            stream_id: "o1".to_string(),
            version: 1,
            global_position,
            bounded_context: "orders".to_string(),
            category: crate::event_store::EventCategory::Domain,
            schema_version: 1,
            correlation_id: "corr-1".to_string(),
            causation_id: None,
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({}),
            metadata: None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn replayed_event_at_or_below_checkpoint_is_skipped() {
        let checkpoints = InMemoryCheckpointStore::new();
        let calls = Arc::new(AtomicU32::new(0));
        let handler: Arc<dyn ProjectionHandler> = Arc::new(CountingHandler { calls: calls.clone() });

        let applied = with_checkpoint(&checkpoints, "summary", &handler, &event(10))
            .await
            .unwrap();
        assert!(applied);

        let replayed = with_checkpoint(&checkpoints, "summary", &handler, &event(10))
            .await
            .unwrap();
        assert!(!replayed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn checkpoint_advances_only_on_success() {
        let checkpoints = InMemoryCheckpointStore::new();
        let calls = Arc::new(AtomicU32::new(0));
        let handler: Arc<dyn ProjectionHandler> = Arc::new(CountingHandler { calls });

        with_checkpoint(&checkpoints, "summary", &handler, &event(5))
            .await
            .unwrap();
        assert_eq!(
            checkpoints.last_global_position("summary", "o1").await,
            5
        );
    }
}
