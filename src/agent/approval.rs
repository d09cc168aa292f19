//! Pending human-in-the-loop approvals: an agent decision that requires a
//! human to approve or reject before the underlying command is dispatched.
//! Expiration is lazy (checked on read), plus an admin sweep for callers
//! that want eagerly-expired state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::command::{CommandBus, CommandEnvelope};
use crate::fsm::StateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApprovalEvent {
    Approve,
    Reject,
    Expire,
}

pub fn approval_fsm() -> StateMachine<ApprovalState, ApprovalEvent> {
    use ApprovalEvent::*;
    use ApprovalState::*;

    StateMachine::new(
        Pending,
        vec![
            (Pending, Approve, Approved),
            (Pending, Reject, Rejected),
            (Pending, Expire, Expired),
        ],
        vec![Approved, Rejected, Expired],
    )
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("pending approval {0} not found")]
    NotFound(String),
    #[error("approval {0} is no longer pending")]
    NotPending(String),
    #[error(transparent)]
    Command(#[from] crate::command::BusError),
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval_id: String,
    pub agent_id: String,
    pub decision_id: String,
    pub command: CommandEnvelope,
    pub confidence: f64,
    pub reason: String,
    pub state: ApprovalState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub resolved_by: Option<String>,
}

impl PendingApproval {
    /// Applies lazy expiration: a `Pending` approval past `expires_at` reads
    /// back as `Expired` without needing a prior sweep to have run.
    fn observed_state(&self, now: chrono::DateTime<chrono::Utc>) -> ApprovalState {
        if self.state == ApprovalState::Pending && now >= self.expires_at {
            ApprovalState::Expired
        } else {
            self.state
        }
    }
}

#[derive(Default)]
struct Store {
    approvals: HashMap<String, PendingApproval>,
}

pub struct ApprovalRegistry {
    store: RwLock<Store>,
    fsm: StateMachine<ApprovalState, ApprovalEvent>,
    command_bus: Arc<CommandBus>,
}

impl ApprovalRegistry {
    pub fn new(command_bus: Arc<CommandBus>) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            fsm: approval_fsm(),
            command_bus,
        }
    }

    pub async fn create(&self, approval: PendingApproval) {
        self.store.write().await.approvals.insert(approval.approval_id.clone(), approval);
    }

    pub async fn get(&self, approval_id: &str, now: chrono::DateTime<chrono::Utc>) -> Option<PendingApproval> {
        self.store.read().await.approvals.get(approval_id).map(|a| {
            let mut observed = a.clone();
            observed.state = a.observed_state(now);
            observed
        })
    }

    /// Approves a pending approval and dispatches its underlying command.
    /// Rejects (without mutating state) if the approval has lazily expired.
    pub async fn approve(
        &self,
        approval_id: &str,
        resolved_by: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ApprovalError> {
        let command = {
            let mut store = self.store.write().await;
            let approval = store
                .approvals
                .get_mut(approval_id)
                .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;

            if approval.observed_state(now) != ApprovalState::Pending {
                return Err(ApprovalError::NotPending(approval_id.to_string()));
            }

            let next = self
                .fsm
                .assert_transition(&ApprovalState::Pending, &ApprovalEvent::Approve)
                .map_err(|_| ApprovalError::NotPending(approval_id.to_string()))?;
            approval.state = next;
            approval.resolved_by = Some(resolved_by.to_string());
            approval.command.clone()
        };

        self.command_bus.dispatch(command).await?;
        Ok(())
    }

    pub async fn reject(
        &self,
        approval_id: &str,
        resolved_by: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ApprovalError> {
        let mut store = self.store.write().await;
        let approval = store
            .approvals
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;

        if approval.observed_state(now) != ApprovalState::Pending {
            return Err(ApprovalError::NotPending(approval_id.to_string()));
        }

        let next = self
            .fsm
            .assert_transition(&ApprovalState::Pending, &ApprovalEvent::Reject)
            .map_err(|_| ApprovalError::NotPending(approval_id.to_string()))?;
        approval.state = next;
        approval.resolved_by = Some(resolved_by.to_string());
        Ok(())
    }

    /// Eagerly materializes expiry for every still-`Pending` row whose
    /// `expires_at` has passed. Returns the number of rows swept.
    pub async fn sweep_expired(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let mut store = self.store.write().await;
        let mut swept = 0;
        for approval in store.approvals.values_mut() {
            if approval.state == ApprovalState::Pending && now >= approval.expires_at {
                approval.state = ApprovalState::Expired;
                swept += 1;
            }
        }
        swept
    }

    pub async fn list_pending(&self, agent_id: &str, now: chrono::DateTime<chrono::Utc>) -> Vec<PendingApproval> {
        self.store
            .read()
            .await
            .approvals
            .values()
            .filter(|a| a.agent_id == agent_id && a.observed_state(now) == ApprovalState::Pending)
            .cloned()
            .collect()
    }
}
