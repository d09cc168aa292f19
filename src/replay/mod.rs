//! Event Replay: chunked, checkpointed rebuild-from-position for one
//! projection, dispatched through the workpool so chunks are serialized on
//! `replay:{projectionName}` and never interleave with themselves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::event_store::EventStore;
use crate::ids;
use crate::projection::checkpoint::with_checkpoint;
use crate::projection::{CheckpointStore, ProjectionDefinition};
use crate::workpool::{EnqueueOptions, Workpool};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("a replay is already active for projection '{0}'")]
    AlreadyActive(String),
    #[error("unknown projection '{0}'")]
    UnknownProjection(String),
    #[error("unknown replay id '{0}'")]
    UnknownReplay(String),
    #[error(transparent)]
    Store(#[from] crate::event_store::StoreError),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ReplayCheckpoint {
    pub replay_id: String,
    pub projection_name: String,
    pub from_position: i64,
    pub last_position: i64,
    pub target_position: Option<i64>,
    pub chunk_size: usize,
    pub total_events: u64,
    pub events_processed: u64,
    pub chunks_completed: u64,
    pub status: ReplayStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
}

impl ReplayCheckpoint {
    pub fn percent_complete(&self) -> f64 {
        if self.total_events == 0 {
            return 100.0;
        }
        let pct = (self.events_processed as f64 / self.total_events as f64) * 100.0;
        (pct * 10.0).round() / 10.0
    }

    /// Estimated time to completion, projected from elapsed throughput.
    /// `None` when not running or no progress has been made yet.
    pub fn estimated_remaining_ms(&self) -> Option<i64> {
        if self.status != ReplayStatus::Running || self.events_processed == 0 {
            return None;
        }
        let remaining = self.total_events.saturating_sub(self.events_processed);
        if remaining == 0 {
            return Some(0);
        }
        let elapsed_ms = (self.updated_at - self.started_at).num_milliseconds().max(1) as f64;
        let throughput = self.events_processed as f64 / elapsed_ms;
        if throughput <= 0.0 {
            return None;
        }
        Some((remaining as f64 / throughput).round() as i64)
    }
}

/// Drives chunked replay, reusing the same checkpoint-gated,
/// partition-serialized pattern the projection engine uses for normal
/// processing, so a replay chunk's handler invocation is itself
/// idempotent via `with_checkpoint`.
pub struct ReplayCoordinator {
    event_store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    workpool: Arc<Workpool>,
    replays: RwLock<HashMap<String, ReplayCheckpoint>>,
}

impl ReplayCoordinator {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        workpool: Arc<Workpool>,
    ) -> Self {
        Self {
            event_store,
            checkpoints,
            workpool,
            replays: RwLock::new(HashMap::new()),
        }
    }

    /// Schedules the next chunk for `replay_id` on the `replay:{name}`
    /// partition, so chunks for the same projection never interleave with
    /// each other and a caller's host-supplied `TaskHandler` re-enters
    /// `process_chunk` until the replay is done.
    async fn enqueue_chunk(&self, projection_name: &str, replay_id: &str) {
        let partition_key = format!("replay:{projection_name}");
        self.workpool
            .enqueue(
                partition_key.clone(),
                serde_json::json!({
                    "replay_id": replay_id,
                    "projection_name": projection_name,
                }),
                EnqueueOptions {
                    partition_key: Some(partition_key),
                    ..Default::default()
                },
            )
            .await;
    }

    pub async fn trigger_rebuild(
        &self,
        projection: &ProjectionDefinition,
        from_position: Option<i64>,
        chunk_size: Option<usize>,
    ) -> Result<String> {
        {
            let replays = self.replays.read().await;
            if replays
                .values()
                .any(|r| r.projection_name == projection.name && r.status == ReplayStatus::Running)
            {
                return Err(ReplayError::AlreadyActive(projection.name.clone()));
            }
        }

        let max_position = self.event_store.max_global_position().await?;
        let from_position = from_position.unwrap_or(0).clamp(0, max_position.max(0));
        let chunk_size = chunk_size.unwrap_or(100).max(1);
        let total_events = (max_position - from_position).max(0) as u64;

        let replay_id = ids::new_id();
        let status = if total_events == 0 {
            ReplayStatus::Completed
        } else {
            ReplayStatus::Running
        };

        let now = chrono::Utc::now();
        let checkpoint = ReplayCheckpoint {
            replay_id: replay_id.clone(),
            projection_name: projection.name.clone(),
            from_position,
            last_position: from_position,
            target_position: None,
            chunk_size,
            total_events,
            events_processed: 0,
            chunks_completed: 0,
            status,
            started_at: now,
            updated_at: now,
            completed_at: if status == ReplayStatus::Completed { Some(now) } else { None },
            error: None,
        };

        self.replays
            .write()
            .await
            .insert(replay_id.clone(), checkpoint);

        if total_events > 0 {
            self.enqueue_chunk(&projection.name, &replay_id).await;
        }

        Ok(replay_id)
    }

    /// Process one chunk and, if more remain, enqueue the next one on the
    /// same `replay:{projectionName}` partition. Invoked by a host's
    /// `TaskHandler` for that target, so it re-enters this method until the
    /// replay completes or is cancelled.
    pub async fn process_chunk(
        &self,
        projection: &ProjectionDefinition,
        replay_id: &str,
    ) -> Result<()> {
        let (from_position, chunk_size, status) = {
            let replays = self.replays.read().await;
            let checkpoint = replays
                .get(replay_id)
                .ok_or_else(|| ReplayError::UnknownReplay(replay_id.to_string()))?;
            (
                checkpoint.last_position,
                checkpoint.chunk_size,
                checkpoint.status,
            )
        };

        if status != ReplayStatus::Running {
            return Ok(());
        }

        #[cfg(feature = "otel")]
        let chunk_start = std::time::Instant::now();

        let events = self
            .event_store
            .read_from_position(from_position, chunk_size, None, None)
            .await?;

        for event in &events {
            if let Some(handler) = projection.handler_for(&event.event_type) {
                with_checkpoint(self.checkpoints.as_ref(), &projection.name, &handler, event)
                    .await
                    .map_err(|e| ReplayError::Store(crate::event_store::StoreError::Backend(e.to_string())))?;
            }
        }

        #[cfg(feature = "otel")]
        {
            use crate::metrics::{self, REPLAY_DURATION};
            REPLAY_DURATION.record(chunk_start.elapsed().as_secs_f64(), &[metrics::component_attr(&projection.name)]);
        }

        let more_chunks_remain = {
            let mut replays = self.replays.write().await;
            let checkpoint = replays
                .get_mut(replay_id)
                .ok_or_else(|| ReplayError::UnknownReplay(replay_id.to_string()))?;

            if status != ReplayStatus::Running {
                return Ok(());
            }

            checkpoint.events_processed += events.len() as u64;
            checkpoint.chunks_completed += 1;
            checkpoint.updated_at = chrono::Utc::now();
            if let Some(last) = events.last() {
                checkpoint.last_position = last.global_position;
            }

            if events.len() == chunk_size {
                true
            } else {
                checkpoint.status = ReplayStatus::Completed;
                checkpoint.completed_at = Some(checkpoint.updated_at);
                false
            }
        };

        if more_chunks_remain {
            self.enqueue_chunk(&projection.name, replay_id).await;
        }

        Ok(())
    }

    pub async fn cancel_rebuild(&self, replay_id: &str) -> Result<()> {
        let mut replays = self.replays.write().await;
        let checkpoint = replays
            .get_mut(replay_id)
            .ok_or_else(|| ReplayError::UnknownReplay(replay_id.to_string()))?;
        if checkpoint.status == ReplayStatus::Running {
            checkpoint.status = ReplayStatus::Cancelled;
            checkpoint.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    pub async fn get_status(&self, replay_id: &str) -> Result<ReplayCheckpoint> {
        self.replays
            .read()
            .await
            .get(replay_id)
            .cloned()
            .ok_or_else(|| ReplayError::UnknownReplay(replay_id.to_string()))
    }

    pub async fn list_active(&self) -> Vec<ReplayCheckpoint> {
        self.replays
            .read()
            .await
            .values()
            .filter(|r| r.status == ReplayStatus::Running)
            .cloned()
            .collect()
    }
}

#[async_trait]
trait ChunkDriver {
    async fn drive_to_completion(&self, projection: &ProjectionDefinition, replay_id: &str) -> Result<()>;
}

#[async_trait]
impl ChunkDriver for ReplayCoordinator {
    async fn drive_to_completion(&self, projection: &ProjectionDefinition, replay_id: &str) -> Result<()> {
        loop {
            let status = self.get_status(replay_id).await?.status;
            if status != ReplayStatus::Running {
                return Ok(());
            }
            self.process_chunk(projection, replay_id).await?;
        }
    }
}
