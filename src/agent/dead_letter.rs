//! Agent dead-letter quarantine: records an event an agent's decider
//! raised on, with the raw error sanitized before it is ever persisted or
//! surfaced to an operator.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

const MAX_MESSAGE_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentDeadLetterStatus {
    Pending,
    Replayed,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct AgentDeadLetter {
    pub agent_id: String,
    pub subscription_id: String,
    pub event_id: String,
    pub global_position: i64,
    pub sanitized_error: String,
    pub attempt_count: u32,
    pub status: AgentDeadLetterStatus,
}

/// Strips stack-trace suffixes (` at ...`), collapses path-looking segments
/// to `[path]`, normalizes whitespace, and truncates to
/// [`MAX_MESSAGE_LEN`] characters with a trailing `...`. A raw backend
/// error never reaches storage unsanitized.
pub fn sanitize_error(raw: &str) -> String {
    let without_trace = raw.split(" at ").next().unwrap_or(raw);

    let path_scrubbed: String = without_trace
        .split_whitespace()
        .map(|token| {
            if looks_like_path(token) {
                "[path]".to_string()
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    let collapsed = path_scrubbed.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() > MAX_MESSAGE_LEN {
        let truncated: String = collapsed.chars().take(MAX_MESSAGE_LEN).collect();
        format!("{truncated}…")
    } else {
        collapsed
    }
}

fn looks_like_path(token: &str) -> bool {
    (token.starts_with('/') || token.contains("\\"))
        && token.len() > 1
        && (token.matches('/').count() >= 2 || token.matches('\\').count() >= 2)
}

#[async_trait]
pub trait AgentDeadLetterStore: Send + Sync {
    async fn quarantine(&self, record: AgentDeadLetter);

    /// Increments `attempt_count` if an entry for `(agent_id, event_id)`
    /// already exists, otherwise inserts at `attempt_count = 1`.
    async fn record_attempt(
        &self,
        agent_id: &str,
        subscription_id: &str,
        event_id: &str,
        global_position: i64,
        raw_error: &str,
    );

    async fn list_pending(&self, agent_id: &str) -> Vec<AgentDeadLetter>;

    async fn mark_replayed(&self, agent_id: &str, event_id: &str) -> bool;

    async fn mark_ignored(&self, agent_id: &str, event_id: &str) -> bool;
}

#[derive(Default)]
pub struct InMemoryAgentDeadLetterStore {
    records: RwLock<HashMap<(String, String), AgentDeadLetter>>,
}

impl InMemoryAgentDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentDeadLetterStore for InMemoryAgentDeadLetterStore {
    async fn quarantine(&self, record: AgentDeadLetter) {
        let key = (record.agent_id.clone(), record.event_id.clone());
        self.records.write().await.insert(key, record);
    }

    async fn record_attempt(
        &self,
        agent_id: &str,
        subscription_id: &str,
        event_id: &str,
        global_position: i64,
        raw_error: &str,
    ) {
        let key = (agent_id.to_string(), event_id.to_string());
        let mut records = self.records.write().await;
        match records.get_mut(&key) {
            Some(existing) => {
                existing.attempt_count += 1;
                existing.sanitized_error = sanitize_error(raw_error);
            }
            None => {
                records.insert(
                    key,
                    AgentDeadLetter {
                        agent_id: agent_id.to_string(),
                        subscription_id: subscription_id.to_string(),
                        event_id: event_id.to_string(),
                        global_position,
                        sanitized_error: sanitize_error(raw_error),
                        attempt_count: 1,
                        status: AgentDeadLetterStatus::Pending,
                    },
                );
            }
        }
    }

    async fn list_pending(&self, agent_id: &str) -> Vec<AgentDeadLetter> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.agent_id == agent_id && r.status == AgentDeadLetterStatus::Pending)
            .cloned()
            .collect()
    }

    async fn mark_replayed(&self, agent_id: &str, event_id: &str) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(&(agent_id.to_string(), event_id.to_string())) {
            Some(record) => {
                record.status = AgentDeadLetterStatus::Replayed;
                true
            }
            None => false,
        }
    }

    async fn mark_ignored(&self, agent_id: &str, event_id: &str) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(&(agent_id.to_string(), event_id.to_string())) {
            Some(record) => {
                record.status = AgentDeadLetterStatus::Ignored;
                true
            }
            None => false,
        }
    }
}
