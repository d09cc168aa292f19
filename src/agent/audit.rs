//! Agent audit trail: an append-only record of every material agent
//! action. The append path is process-global and write-only; there is no
//! update or delete.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ids::new_decision_id;

/// The full set of audit event types tracked for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAuditEventType {
    PatternDetected,
    CommandEmitted,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalRejected,
    ApprovalExpired,
    DeadLetterRecorded,
    CheckpointUpdated,
    AgentCommandRouted,
    AgentCommandRoutingFailed,
    AgentStarted,
    AgentPaused,
    AgentResumed,
    AgentStopped,
    AgentReconfigured,
    AgentErrorRecoveryStarted,
}

impl AgentAuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatternDetected => "PatternDetected",
            Self::CommandEmitted => "CommandEmitted",
            Self::ApprovalRequested => "ApprovalRequested",
            Self::ApprovalGranted => "ApprovalGranted",
            Self::ApprovalRejected => "ApprovalRejected",
            Self::ApprovalExpired => "ApprovalExpired",
            Self::DeadLetterRecorded => "DeadLetterRecorded",
            Self::CheckpointUpdated => "CheckpointUpdated",
            Self::AgentCommandRouted => "AgentCommandRouted",
            Self::AgentCommandRoutingFailed => "AgentCommandRoutingFailed",
            Self::AgentStarted => "AgentStarted",
            Self::AgentPaused => "AgentPaused",
            Self::AgentResumed => "AgentResumed",
            Self::AgentStopped => "AgentStopped",
            Self::AgentReconfigured => "AgentReconfigured",
            Self::AgentErrorRecoveryStarted => "AgentErrorRecoveryStarted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentAuditEvent {
    pub agent_id: String,
    pub decision_id: String,
    pub event_type: AgentAuditEventType,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, event: AgentAuditEvent);

    async fn list_for_agent(&self, agent_id: &str) -> Vec<AgentAuditEvent>;
}

/// In-process append-only log. Process-global state: restart loses history
/// unless a caller wraps this in something durable.
#[derive(Default)]
pub struct InMemoryAuditLog {
    events: RwLock<Vec<AgentAuditEvent>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and appends a new event, minting a fresh decision id.
    pub async fn record(
        &self,
        agent_id: &str,
        event_type: AgentAuditEventType,
        payload: serde_json::Value,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) {
        self.append(AgentAuditEvent {
            agent_id: agent_id.to_string(),
            decision_id: new_decision_id(),
            event_type,
            timestamp,
            payload,
        })
        .await;
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, event: AgentAuditEvent) {
        self.events.write().await.push(event);
    }

    async fn list_for_agent(&self, agent_id: &str) -> Vec<AgentAuditEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect()
    }
}
