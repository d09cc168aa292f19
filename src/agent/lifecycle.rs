//! Agent lifecycle state machine, built on the same generic
//! [`crate::fsm::StateMachine`] used by process managers.

use crate::fsm::StateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentLifecycleState {
    Stopped,
    Active,
    Paused,
    ErrorRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentLifecycleEvent {
    Start,
    Pause,
    Stop,
    EnterErrorRecovery,
    Reconfigure,
    Resume,
    Recover,
}

/// Builds the agent lifecycle FSM. No state is terminal: even `stopped`
/// can receive `START` again.
pub fn agent_lifecycle_fsm() -> StateMachine<AgentLifecycleState, AgentLifecycleEvent> {
    use AgentLifecycleEvent::*;
    use AgentLifecycleState::*;

    StateMachine::new(
        Stopped,
        vec![
            (Stopped, Start, Active),
            (Active, Pause, Paused),
            (Active, Stop, Stopped),
            (Active, EnterErrorRecovery, ErrorRecovery),
            (Active, Reconfigure, Active),
            (Paused, Resume, Active),
            (Paused, Stop, Stopped),
            (Paused, Reconfigure, Active),
            (ErrorRecovery, Recover, Active),
            (ErrorRecovery, Stop, Stopped),
        ],
        vec![],
    )
}

/// Maps an admin command name to its lifecycle event. Case-sensitive;
/// unknown command names yield `None`.
pub fn command_to_event(command_type: &str) -> Option<AgentLifecycleEvent> {
    match command_type {
        "StartAgent" => Some(AgentLifecycleEvent::Start),
        "PauseAgent" => Some(AgentLifecycleEvent::Pause),
        "ResumeAgent" => Some(AgentLifecycleEvent::Resume),
        "StopAgent" => Some(AgentLifecycleEvent::Stop),
        "ReconfigureAgent" => Some(AgentLifecycleEvent::Reconfigure),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentLifecycleEvent::*;
    use AgentLifecycleState::*;

    #[test]
    fn stopped_to_active_on_start() {
        let fsm = agent_lifecycle_fsm();
        assert_eq!(fsm.try_transition(&Stopped, &Start), Some(Active));
    }

    #[test]
    fn active_reconfigure_is_a_self_loop() {
        let fsm = agent_lifecycle_fsm();
        assert_eq!(fsm.try_transition(&Active, &Reconfigure), Some(Active));
    }

    #[test]
    fn paused_cannot_recover_directly() {
        let fsm = agent_lifecycle_fsm();
        assert_eq!(fsm.try_transition(&Paused, &Recover), None);
    }

    #[test]
    fn error_recovery_recovers_to_active() {
        let fsm = agent_lifecycle_fsm();
        assert_eq!(fsm.try_transition(&ErrorRecovery, &Recover), Some(Active));
    }

    #[test]
    fn stopped_state_is_not_terminal_and_accepts_start_again() {
        let fsm = agent_lifecycle_fsm();
        assert!(!fsm.is_terminal(&Stopped));
        assert_eq!(fsm.try_transition(&Stopped, &Start), Some(Active));
    }

    #[test]
    fn command_to_event_is_case_sensitive_and_unknown_maps_to_none() {
        assert_eq!(command_to_event("StartAgent"), Some(Start));
        assert_eq!(command_to_event("startagent"), None);
        assert_eq!(command_to_event("DeleteAgent"), None);
    }
}
