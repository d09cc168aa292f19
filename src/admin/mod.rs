//! Admin surface: internal-only operations for rebuild control,
//! poison/dead-letter review, and circuit breaker management. A plain
//! async trait, with no wire protocol of its own.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::agent::dead_letter::{AgentDeadLetter, AgentDeadLetterStore};
use crate::projection::poison::{PoisonRecord, PoisonStore};
use crate::projection::ProjectionDefinition;
use crate::config::ADMIN_LIST_CAP;
use crate::replay::{ReplayCheckpoint, ReplayCoordinator, ReplayError};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("unknown projection '{0}'")]
    UnknownProjection(String),
}

pub type Result<T> = std::result::Result<T, AdminError>;

#[async_trait]
pub trait AdminOps: Send + Sync {
    async fn trigger_rebuild(
        &self,
        projection: &ProjectionDefinition,
        from_position: Option<i64>,
        chunk_size: Option<usize>,
    ) -> Result<String>;

    async fn cancel_rebuild(&self, replay_id: &str) -> Result<()>;

    async fn get_rebuild_status(&self, replay_id: &str) -> Result<ReplayCheckpoint>;

    async fn list_active_rebuilds(&self) -> Vec<ReplayCheckpoint>;

    async fn replay_poison_event(&self, projection_name: &str, event_id: &str) -> bool;

    async fn ignore_poison_event(&self, projection_name: &str, event_id: &str) -> bool;

    async fn list_quarantined(&self, projection_name: Option<&str>) -> Vec<PoisonRecord>;

    async fn get_agent_dead_letters(&self, agent_id: &str) -> Vec<AgentDeadLetter>;

    async fn reset_circuit(&self, agent_id: &str);

    async fn get_circuit_state(&self, agent_id: &str) -> CircuitState;
}

/// Default admin implementation wiring the runtime's own stores.
pub struct AdminService {
    replay: Arc<ReplayCoordinator>,
    poison: Arc<dyn PoisonStore>,
    agent_dead_letters: Arc<dyn AgentDeadLetterStore>,
    circuit_breaker: Arc<CircuitBreakerRegistry>,
}

impl AdminService {
    pub fn new(
        replay: Arc<ReplayCoordinator>,
        poison: Arc<dyn PoisonStore>,
        agent_dead_letters: Arc<dyn AgentDeadLetterStore>,
        circuit_breaker: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            replay,
            poison,
            agent_dead_letters,
            circuit_breaker,
        }
    }
}

#[async_trait]
impl AdminOps for AdminService {
    async fn trigger_rebuild(
        &self,
        projection: &ProjectionDefinition,
        from_position: Option<i64>,
        chunk_size: Option<usize>,
    ) -> Result<String> {
        Ok(self.replay.trigger_rebuild(projection, from_position, chunk_size).await?)
    }

    async fn cancel_rebuild(&self, replay_id: &str) -> Result<()> {
        Ok(self.replay.cancel_rebuild(replay_id).await?)
    }

    async fn get_rebuild_status(&self, replay_id: &str) -> Result<ReplayCheckpoint> {
        Ok(self.replay.get_status(replay_id).await?)
    }

    async fn list_active_rebuilds(&self) -> Vec<ReplayCheckpoint> {
        let mut active = self.replay.list_active().await;
        active.truncate(ADMIN_LIST_CAP);
        active
    }

    async fn replay_poison_event(&self, projection_name: &str, event_id: &str) -> bool {
        self.poison.mark_replayed(projection_name, event_id).await
    }

    async fn ignore_poison_event(&self, projection_name: &str, event_id: &str) -> bool {
        self.poison.mark_ignored(projection_name, event_id).await
    }

    async fn list_quarantined(&self, projection_name: Option<&str>) -> Vec<PoisonRecord> {
        let mut quarantined = self.poison.list_quarantined(projection_name).await;
        quarantined.truncate(ADMIN_LIST_CAP);
        quarantined
    }

    async fn get_agent_dead_letters(&self, agent_id: &str) -> Vec<AgentDeadLetter> {
        let mut dead_letters = self.agent_dead_letters.list_pending(agent_id).await;
        dead_letters.truncate(ADMIN_LIST_CAP);
        dead_letters
    }

    async fn reset_circuit(&self, agent_id: &str) {
        self.circuit_breaker.reset(agent_id).await;
    }

    async fn get_circuit_state(&self, agent_id: &str) -> CircuitState {
        self.circuit_breaker.state(agent_id).await
    }
}
