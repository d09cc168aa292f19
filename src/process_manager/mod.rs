//! Process Managers: event-driven, fire-and-forget command emitters with
//! an explicit FSM, concurrency-serialized by workpool partition key
//! `{pmName}:{instanceId}`. The flow is prepare, handle, persist, execute
//! commands, with no destination-fetch split since this runtime is
//! single-process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::command::{CommandBus, CommandEnvelope};
use crate::event_store::Event;
use crate::fsm::{InvalidTransition, StateMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmState {
    Idle,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmEvent {
    Start,
    Success,
    Fail,
    Reset,
    Retry,
}

/// Builds the PM FSM: `idle -> processing -> {completed, failed}`, with
/// `completed -> idle` (RESET) and `failed -> {processing, idle}`
/// (RETRY/RESET).
pub fn pm_fsm() -> StateMachine<PmState, PmEvent> {
    StateMachine::new(
        PmState::Idle,
        vec![
            (PmState::Idle, PmEvent::Start, PmState::Processing),
            (PmState::Processing, PmEvent::Success, PmState::Completed),
            (PmState::Processing, PmEvent::Fail, PmState::Failed),
            (PmState::Completed, PmEvent::Reset, PmState::Idle),
            (PmState::Failed, PmEvent::Retry, PmState::Processing),
            (PmState::Failed, PmEvent::Reset, PmState::Idle),
        ],
        vec![],
    )
}

#[derive(Debug, Error)]
pub enum PmError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("handler error: {0}")]
    Handler(String),
}

/// Durable state for one `(pmName, instanceId)` pair.
#[derive(Debug, Clone)]
pub struct ProcessManagerState {
    pub pm_name: String,
    pub instance_id: String,
    pub status: PmState,
    pub last_global_position: i64,
    pub commands_emitted: u64,
    pub commands_failed: u64,
    pub custom_state: Option<serde_json::Value>,
    pub state_version: u32,
    pub trigger_event_id: Option<String>,
    pub correlation_id: Option<String>,
    pub error_message: Option<String>,
}

impl ProcessManagerState {
    fn new(pm_name: &str, instance_id: &str) -> Self {
        Self {
            pm_name: pm_name.to_string(),
            instance_id: instance_id.to_string(),
            status: PmState::Idle,
            last_global_position: -1,
            commands_emitted: 0,
            commands_failed: 0,
            custom_state: None,
            state_version: 0,
            trigger_event_id: None,
            correlation_id: None,
            error_message: None,
        }
    }
}

/// A process manager's decision given a triggering event and its own
/// durable state: which commands to emit, and an optional updated custom
/// state blob.
#[async_trait]
pub trait ProcessManagerHandler: Send + Sync {
    fn pm_name(&self) -> &str;

    fn instance_id_for(&self, event: &Event) -> String;

    async fn handle(
        &self,
        event: &Event,
        state: &ProcessManagerState,
    ) -> Result<(Vec<CommandEnvelope>, Option<serde_json::Value>), PmError>;
}

#[derive(Default)]
pub struct InMemoryPmStateStore {
    states: RwLock<HashMap<(String, String), ProcessManagerState>>,
}

impl InMemoryPmStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn load_or_init(&self, pm_name: &str, instance_id: &str) -> ProcessManagerState {
        self.states
            .read()
            .await
            .get(&(pm_name.to_string(), instance_id.to_string()))
            .cloned()
            .unwrap_or_else(|| ProcessManagerState::new(pm_name, instance_id))
    }

    async fn store(&self, state: ProcessManagerState) {
        self.states.write().await.insert(
            (state.pm_name.clone(), state.instance_id.clone()),
            state,
        );
    }
}

/// Drives one process manager's FSM against incoming events and routes
/// emitted commands through the [`CommandBus`].
pub struct ProcessManagerRuntime {
    states: Arc<InMemoryPmStateStore>,
    command_bus: Arc<CommandBus>,
}

impl ProcessManagerRuntime {
    pub fn new(states: Arc<InMemoryPmStateStore>, command_bus: Arc<CommandBus>) -> Self {
        Self {
            states,
            command_bus,
        }
    }

    pub async fn on_event(
        &self,
        handler: &dyn ProcessManagerHandler,
        event: &Event,
    ) -> Result<(), PmError> {
        let instance_id = handler.instance_id_for(event);
        let mut state = self.states.load_or_init(handler.pm_name(), &instance_id).await;

        let fsm = pm_fsm();
        state.status = fsm.assert_transition(&state.status, &PmEvent::Start)?;
        state.trigger_event_id = Some(event.event_id.clone());
        state.correlation_id = Some(event.correlation_id.clone());

        match handler.handle(event, &state).await {
            Ok((commands, custom_state)) => {
                let mut emitted = 0u64;
                let mut failed = 0u64;
                for command in commands {
                    match self.command_bus.dispatch(command).await {
                        Ok(_) => emitted += 1,
                        Err(e) => {
                            warn!(error = %e, "process manager command rejected");
                            failed += 1;
                        }
                    }
                }
                state.commands_emitted += emitted;
                state.commands_failed += failed;
                state.custom_state = custom_state.or(state.custom_state.take());
                state.last_global_position = event.global_position;
                state.state_version += 1;
                state.status = fsm.assert_transition(&state.status, &PmEvent::Success)?;
                info!(pm = handler.pm_name(), %instance_id, emitted, failed, "process manager advanced");
            }
            Err(e) => {
                state.error_message = Some(e.to_string());
                state.status = fsm.assert_transition(&state.status, &PmEvent::Fail)?;
                self.states.store(state).await;
                return Err(e);
            }
        }

        self.states.store(state).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsm_rejects_completing_an_idle_pm() {
        let fsm = pm_fsm();
        assert!(fsm.assert_transition(&PmState::Idle, &PmEvent::Success).is_err());
    }

    #[test]
    fn fsm_allows_retry_from_failed() {
        let fsm = pm_fsm();
        assert_eq!(
            fsm.assert_transition(&PmState::Failed, &PmEvent::Retry).unwrap(),
            PmState::Processing
        );
    }
}
