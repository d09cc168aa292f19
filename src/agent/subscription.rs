//! Subscription filters for the agent event handler: which event types,
//! bounded contexts, and pattern windows an agent cares about.

use crate::event_store::Event;

/// Default priority, between projections (100) and sagas (300).
pub const DEFAULT_AGENT_PRIORITY: u32 = 250;

#[derive(Debug, Clone)]
pub struct PatternWindow {
    /// `"Nd" | "Nh" | "Nm"`.
    pub duration: String,
    pub min_events: usize,
    pub event_limit: usize,
}

/// Parses a duration like `"7d"`, `"24h"`, `"30m"` into a `chrono::Duration`.
pub fn parse_window_duration(spec: &str) -> Option<chrono::Duration> {
    let (number, unit) = spec.split_at(spec.len().saturating_sub(1));
    let n: i64 = number.parse().ok()?;
    match unit {
        "d" => Some(chrono::Duration::days(n)),
        "h" => Some(chrono::Duration::hours(n)),
        "m" => Some(chrono::Duration::minutes(n)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct AgentSubscription {
    pub subscription_id: String,
    pub agent_id: String,
    pub event_types: Vec<String>,
    pub bounded_context: String,
    pub priority: u32,
    pub pattern_window: PatternWindow,
}

impl AgentSubscription {
    /// Empty `event_types` matches every type in the context; otherwise an
    /// event type matches if it `ends_with` any registered type (same
    /// suffix-match rule as `descriptor::Target::matches_type`).
    pub fn matches(&self, event: &Event) -> bool {
        if event.bounded_context != self.bounded_context {
            return false;
        }
        self.event_types.is_empty()
            || self
                .event_types
                .iter()
                .any(|t| event.event_type.ends_with(t.as_str()))
    }

    /// The partition key this subscription derives for an event, default
    /// to the stream id.
    pub fn partition_key(&self, event: &Event) -> String {
        event.stream_id.clone()
    }
}
