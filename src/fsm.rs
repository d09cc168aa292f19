//! Generic finite state machine library.
//!
//! A single table-driven engine backs the process-manager FSM, the agent
//! lifecycle FSM, and the pending-approval FSM, instead of three bespoke
//! `match` ladders. Transition functions are total: for any `(state,
//! event)` pair `try_transition` returns `Some`/`None`, never panics.

use std::collections::HashMap;
use std::hash::Hash;

use thiserror::Error;

/// Error returned by the asserting variant of a transition.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition: no edge for the given event from the current state")]
pub struct InvalidTransition;

/// A table-driven finite state machine over states `S` and events `E`.
///
/// Built once at startup (the transition table is read-only thereafter,
/// matching the "registries are read-only after registration" rule used
/// throughout this runtime) and shared across every instance of the entity
/// it governs.
#[derive(Debug, Clone)]
pub struct StateMachine<S, E> {
    initial: S,
    transitions: HashMap<(S, E), S>,
    terminal: Vec<S>,
}

impl<S, E> StateMachine<S, E>
where
    S: Eq + Hash + Clone,
    E: Eq + Hash + Clone,
{
    /// Build a machine from its initial state and an explicit transition
    /// table. `terminal` lists states with no valid outgoing events.
    pub fn new(initial: S, transitions: Vec<(S, E, S)>, terminal: Vec<S>) -> Self {
        let transitions = transitions
            .into_iter()
            .map(|(from, event, to)| ((from, event), to))
            .collect();
        Self {
            initial,
            transitions,
            terminal,
        }
    }

    /// The machine's initial state.
    pub fn initial(&self) -> &S {
        &self.initial
    }

    /// Whether `event` is valid from `state`.
    pub fn can_transition(&self, state: &S, event: &E) -> bool {
        self.transitions
            .contains_key(&(state.clone(), event.clone()))
    }

    /// Apply `event` to `state`, returning the next state or `None` if the
    /// transition is invalid. Total function: never panics.
    pub fn try_transition(&self, state: &S, event: &E) -> Option<S> {
        self.transitions.get(&(state.clone(), event.clone())).cloned()
    }

    /// Apply `event` to `state`, returning an error on an invalid edge.
    pub fn assert_transition(&self, state: &S, event: &E) -> Result<S, InvalidTransition> {
        self.try_transition(state, event).ok_or(InvalidTransition)
    }

    /// All events valid from `state`.
    pub fn valid_events(&self, state: &S) -> Vec<E> {
        self.transitions
            .keys()
            .filter(|(from, _)| from == state)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Whether `state` has no valid outgoing transitions.
    pub fn is_terminal(&self, state: &S) -> bool {
        self.terminal.contains(state) || self.valid_events(state).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Red,
        Green,
        Yellow,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Go {
        Advance,
    }

    fn traffic_light() -> StateMachine<Light, Go> {
        StateMachine::new(
            Light::Red,
            vec![
                (Light::Red, Go::Advance, Light::Green),
                (Light::Green, Go::Advance, Light::Yellow),
                (Light::Yellow, Go::Advance, Light::Red),
            ],
            vec![],
        )
    }

    #[test]
    fn total_function_never_panics_on_bad_state() {
        let fsm = traffic_light();
        assert_eq!(
            fsm.try_transition(&Light::Red, &Go::Advance),
            Some(Light::Green)
        );
    }

    #[test]
    fn assert_transition_errors_on_invalid_edge() {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        enum Other {
            Stop,
        }
        let fsm: StateMachine<Light, Other> = StateMachine::new(Light::Red, vec![], vec![]);
        assert_eq!(
            fsm.assert_transition(&Light::Red, &Other::Stop),
            Err(InvalidTransition)
        );
    }

    #[test]
    fn valid_events_lists_only_outgoing_edges() {
        let fsm = traffic_light();
        assert_eq!(fsm.valid_events(&Light::Red), vec![Go::Advance]);
    }

    #[test]
    fn terminal_state_has_no_valid_events() {
        let fsm: StateMachine<Light, Go> =
            StateMachine::new(Light::Red, vec![], vec![Light::Yellow]);
        assert!(fsm.is_terminal(&Light::Yellow));
        assert!(!fsm.can_transition(&Light::Yellow, &Go::Advance));
    }
}
