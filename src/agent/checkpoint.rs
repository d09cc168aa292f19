//! Agent checkpoints: per-subscription cursor into the event stream,
//! distinct from the projection engine's per-partition checkpoint.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Active,
    Paused,
    Stopped,
    ErrorRecovery,
}

#[derive(Debug, Clone)]
pub struct AgentCheckpoint {
    pub agent_id: String,
    pub subscription_id: String,
    pub last_processed_position: i64,
    pub last_event_id: Option<String>,
    pub status: AgentStatus,
    pub events_processed: u64,
    pub config_overrides: Option<serde_json::Value>,
}

impl AgentCheckpoint {
    pub fn new(agent_id: &str, subscription_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            subscription_id: subscription_id.to_string(),
            last_processed_position: -1,
            last_event_id: None,
            status: AgentStatus::Active,
            events_processed: 0,
            config_overrides: None,
        }
    }
}

#[async_trait]
pub trait AgentCheckpointStore: Send + Sync {
    async fn load(&self, agent_id: &str, subscription_id: &str) -> AgentCheckpoint;

    async fn advance(&self, agent_id: &str, subscription_id: &str, event_id: &str, position: i64);

    async fn set_status(&self, agent_id: &str, subscription_id: &str, status: AgentStatus);
}

#[derive(Default)]
pub struct InMemoryAgentCheckpointStore {
    checkpoints: RwLock<HashMap<(String, String), AgentCheckpoint>>,
}

impl InMemoryAgentCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentCheckpointStore for InMemoryAgentCheckpointStore {
    async fn load(&self, agent_id: &str, subscription_id: &str) -> AgentCheckpoint {
        self.checkpoints
            .read()
            .await
            .get(&(agent_id.to_string(), subscription_id.to_string()))
            .cloned()
            .unwrap_or_else(|| AgentCheckpoint::new(agent_id, subscription_id))
    }

    async fn advance(&self, agent_id: &str, subscription_id: &str, event_id: &str, position: i64) {
        let mut checkpoints = self.checkpoints.write().await;
        let checkpoint = checkpoints
            .entry((agent_id.to_string(), subscription_id.to_string()))
            .or_insert_with(|| AgentCheckpoint::new(agent_id, subscription_id));
        checkpoint.last_event_id = Some(event_id.to_string());
        checkpoint.last_processed_position = position;
        checkpoint.events_processed += 1;
    }

    async fn set_status(&self, agent_id: &str, subscription_id: &str, status: AgentStatus) {
        let mut checkpoints = self.checkpoints.write().await;
        let checkpoint = checkpoints
            .entry((agent_id.to_string(), subscription_id.to_string()))
            .or_insert_with(|| AgentCheckpoint::new(agent_id, subscription_id));
        checkpoint.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_checkpoint_starts_active_at_position_minus_one() {
        let store = InMemoryAgentCheckpointStore::new();
        let checkpoint = store.load("agent-1", "sub-1").await;
        assert_eq!(checkpoint.status, AgentStatus::Active);
        assert_eq!(checkpoint.last_processed_position, -1);
    }

    #[tokio::test]
    async fn advance_increments_events_processed() {
        let store = InMemoryAgentCheckpointStore::new();
        store.advance("agent-1", "sub-1", "e1", 10).await;
        store.advance("agent-1", "sub-1", "e2", 20).await;
        let checkpoint = store.load("agent-1", "sub-1").await;
        assert_eq!(checkpoint.events_processed, 2);
        assert_eq!(checkpoint.last_processed_position, 20);
    }
}
