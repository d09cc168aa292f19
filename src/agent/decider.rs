//! Agent decision loop: loads history within the pattern window, builds an
//! `AgentExecutionContext`, calls the user-supplied decider, and interprets
//! the resulting decision into either a routed command or a pending
//! approval.

use async_trait::async_trait;

use super::checkpoint::AgentCheckpoint;
use super::subscription::{parse_window_duration, AgentSubscription};
use crate::command::CommandEnvelope;
use crate::event_store::Event;

/// LLM backend abstraction. A no-op mock is valid.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn analyze(&self, history: &[Event]) -> serde_json::Value;

    async fn reason(&self, context: &serde_json::Value) -> serde_json::Value;
}

/// Trivial mock that never produces a decision.
pub struct NoopLlmClient;

#[async_trait]
impl LlmClient for NoopLlmClient {
    async fn analyze(&self, _history: &[Event]) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn reason(&self, _context: &serde_json::Value) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Context passed to the user-supplied `onEvent` decider.
pub struct AgentExecutionContext<'a> {
    pub agent_id: &'a str,
    pub history: &'a [Event],
    pub checkpoint: &'a AgentCheckpoint,
    pub llm: &'a dyn LlmClient,
}

/// A decision returned by the agent's decider, or `None` for "no decision".
#[derive(Debug, Clone)]
pub struct AgentDecision {
    pub command: Option<CommandEnvelope>,
    pub confidence: f64,
    pub requires_approval: bool,
    pub reason: String,
}

/// Final interpretation of a non-null decision with a command.
pub enum RoutingDecision {
    /// No decision, or a decision with no command: nothing to do.
    Done,
    /// Emit directly through the command bus.
    Emit(CommandEnvelope),
    /// Requires a human in the loop before emitting.
    RequireApproval {
        command: CommandEnvelope,
        confidence: f64,
        reason: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },
}

/// Human-in-the-loop policy: decides whether a command needs approval.
pub struct HumanInLoopPolicy {
    pub requires_approval: Vec<String>,
    pub auto_approve: Vec<String>,
    pub confidence_threshold: f64,
}

impl HumanInLoopPolicy {
    pub fn should_require_approval(&self, command_type: &str, confidence: f64) -> bool {
        if self.requires_approval.iter().any(|c| c == command_type) {
            return true;
        }
        if self.auto_approve.iter().any(|c| c == command_type) {
            return false;
        }
        confidence < self.confidence_threshold
    }
}

/// Parses `"24h"`-style timeouts (`m|h|d`, positive integer) into a
/// `chrono::Duration`.
pub fn parse_timeout(spec: &str) -> Option<chrono::Duration> {
    parse_window_duration(spec).filter(|d| d.num_seconds() > 0)
}

/// Filters `history` to events within the subscription's pattern window of
/// `now`, ordered oldest-first.
pub fn filter_to_window(history: &[Event], subscription: &AgentSubscription, now: chrono::DateTime<chrono::Utc>) -> Vec<Event> {
    let window = parse_window_duration(&subscription.pattern_window.duration).unwrap_or(chrono::Duration::days(7));
    let cutoff = now - window;
    history
        .iter()
        .filter(|e| e.timestamp >= cutoff)
        .take(subscription.pattern_window.event_limit)
        .cloned()
        .collect()
}

/// Interprets the decider's output into a [`RoutingDecision`].
pub fn interpret_decision(
    decision: Option<AgentDecision>,
    policy: &HumanInLoopPolicy,
    approval_timeout: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> RoutingDecision {
    let Some(decision) = decision else {
        return RoutingDecision::Done;
    };
    let Some(command) = decision.command else {
        return RoutingDecision::Done;
    };

    let requires_approval = decision.requires_approval
        || policy.should_require_approval(&command.command_type, decision.confidence);

    if requires_approval {
        let timeout = parse_timeout(approval_timeout).unwrap_or(chrono::Duration::hours(24));
        RoutingDecision::RequireApproval {
            command,
            confidence: decision.confidence,
            reason: decision.reason,
            expires_at: now + timeout,
        }
    } else {
        RoutingDecision::Emit(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> CommandEnvelope {
        CommandEnvelope {
            command_id: "cmd-1".to_string(),
            command_type: "FlagFraud".to_string(),
            stream_type: "order".to_string(),
            stream_id: "o1".to_string(),
            bounded_context: "orders".to_string(),
            args: serde_json::json!({}),
            correlation_id: None,
            causation_id: None,
            user_id: None,
        }
    }

    #[test]
    fn null_decision_is_done() {
        let policy = HumanInLoopPolicy {
            requires_approval: vec![],
            auto_approve: vec![],
            confidence_threshold: 0.9,
        };
        let result = interpret_decision(None, &policy, "24h", chrono::Utc::now());
        assert!(matches!(result, RoutingDecision::Done));
    }

    #[test]
    fn low_confidence_below_threshold_requires_approval() {
        let policy = HumanInLoopPolicy {
            requires_approval: vec![],
            auto_approve: vec![],
            confidence_threshold: 0.9,
        };
        let decision = AgentDecision {
            command: Some(command()),
            confidence: 0.5,
            requires_approval: false,
            reason: "suspicious pattern".to_string(),
        };
        let result = interpret_decision(Some(decision), &policy, "24h", chrono::Utc::now());
        assert!(matches!(result, RoutingDecision::RequireApproval { .. }));
    }

    #[test]
    fn auto_approve_list_overrides_low_confidence() {
        let policy = HumanInLoopPolicy {
            requires_approval: vec![],
            auto_approve: vec!["FlagFraud".to_string()],
            confidence_threshold: 0.9,
        };
        let decision = AgentDecision {
            command: Some(command()),
            confidence: 0.1,
            requires_approval: false,
            reason: "low confidence but auto-approved type".to_string(),
        };
        let result = interpret_decision(Some(decision), &policy, "24h", chrono::Utc::now());
        assert!(matches!(result, RoutingDecision::Emit(_)));
    }

    #[test]
    fn requires_approval_list_wins_even_at_high_confidence() {
        let policy = HumanInLoopPolicy {
            requires_approval: vec!["FlagFraud".to_string()],
            auto_approve: vec![],
            confidence_threshold: 0.9,
        };
        let decision = AgentDecision {
            command: Some(command()),
            confidence: 0.99,
            requires_approval: false,
            reason: "always review fraud flags".to_string(),
        };
        let result = interpret_decision(Some(decision), &policy, "24h", chrono::Utc::now());
        assert!(matches!(result, RoutingDecision::RequireApproval { .. }));
    }
}
