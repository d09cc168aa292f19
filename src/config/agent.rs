use serde::Deserialize;

/// Default agent bounded-context runtime knobs.
///
/// Individual agents may override any of these via their own
/// `configOverrides` stored on the agent checkpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentRuntimeConfig {
    /// Confidence threshold below which an agent decision requires human
    /// approval, unless the command is explicitly auto-approved or
    /// explicitly always-requires-approval.
    pub approval_confidence_threshold: f64,
    /// Command types that always require approval regardless of confidence.
    pub requires_approval: Vec<String>,
    /// Command types that never require approval regardless of confidence.
    pub auto_approve: Vec<String>,
    /// Default approval timeout (parsed with `agent::approval::parse_timeout`),
    /// e.g. `"24h"`.
    pub default_approval_timeout: String,
    /// Daily cost budget in USD, shared default across agents without an
    /// override.
    pub daily_budget_usd: f64,
    /// Fraction of `daily_budget_usd` at which `at_alert_threshold` trips.
    pub alert_threshold_fraction: f64,
    /// Circuit breaker: consecutive failures before opening.
    pub circuit_breaker_failure_threshold: u32,
    /// Circuit breaker: seconds before an open breaker tries half-open.
    pub circuit_breaker_timeout_secs: u64,
    /// Circuit breaker: successes required in half-open before closing.
    pub circuit_breaker_success_threshold: u32,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            approval_confidence_threshold: 0.9,
            requires_approval: Vec::new(),
            auto_approve: Vec::new(),
            default_approval_timeout: "24h".to_string(),
            daily_budget_usd: 50.0,
            alert_threshold_fraction: 0.8,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_timeout_secs: 60,
            circuit_breaker_success_threshold: 1,
        }
    }
}
