//! In-process circuit breaker: guards calls to an agent's LLM/rule-engine
//! backend. Process-global and restart-ephemeral; a multi-process
//! deployment would need a table-backed equivalent.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker open")]
    Open,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl CircuitEntry {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

/// Per-key breaker registry (one breaker per agent, keyed by `agent_id`).
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    entries: RwLock<HashMap<String, CircuitEntry>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Call this before invoking the guarded backend. `Open` within the
    /// timeout window rejects; once the timeout has elapsed the breaker
    /// moves to `HalfOpen` and the call is allowed through as a probe.
    pub async fn before_call(&self, key: &str) -> Result<(), CircuitBreakerError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(CircuitEntry::closed);

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.open_timeout {
                    entry.state = CircuitState::HalfOpen;
                    entry.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(CircuitBreakerError::Open)
                }
            }
        }
    }

    pub async fn on_success(&self, key: &str) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(CircuitEntry::closed);
        match entry.state {
            CircuitState::Closed => {
                entry.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                entry.consecutive_successes += 1;
                if entry.consecutive_successes >= self.config.success_threshold {
                    *entry = CircuitEntry::closed();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// A failure while `HalfOpen` returns to `Open` and restarts the timer.
    pub async fn on_failure(&self, key: &str) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(CircuitEntry::closed);
        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                entry.consecutive_failures = 0;
                entry.consecutive_successes = 0;
                #[cfg(feature = "otel")]
                {
                    use crate::metrics::{self, AGENT_CIRCUIT_OPEN_TOTAL};
                    AGENT_CIRCUIT_OPEN_TOTAL.add(1, &[metrics::agent_attr(key)]);
                }
            }
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.config.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Instant::now());
                    #[cfg(feature = "otel")]
                    {
                        use crate::metrics::{self, AGENT_CIRCUIT_OPEN_TOTAL};
                        AGENT_CIRCUIT_OPEN_TOTAL.add(1, &[metrics::agent_attr(key)]);
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self, key: &str) -> CircuitState {
        self.entries
            .read()
            .await
            .get(key)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Admin surface: forces a breaker back to `Closed`.
    pub async fn reset(&self, key: &str) {
        self.entries.write().await.insert(key.to_string(), CircuitEntry::closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            open_timeout: Duration::from_millis(20),
            success_threshold: 1,
        }
    }

    #[tokio::test]
    async fn five_failures_open_the_circuit() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..5 {
            registry.on_failure("agent-1").await;
        }
        assert_eq!(registry.state("agent-1").await, CircuitState::Open);
        assert!(matches!(
            registry.before_call("agent-1").await,
            Err(CircuitBreakerError::Open)
        ));
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_restarts_timer() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..5 {
            registry.on_failure("agent-1").await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.before_call("agent-1").await.unwrap();
        assert_eq!(registry.state("agent-1").await, CircuitState::HalfOpen);

        registry.on_failure("agent-1").await;
        assert_eq!(registry.state("agent-1").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_success_closes_circuit() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..5 {
            registry.on_failure("agent-1").await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.before_call("agent-1").await.unwrap();
        registry.on_success("agent-1").await;
        assert_eq!(registry.state("agent-1").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_forces_closed_state() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..5 {
            registry.on_failure("agent-1").await;
        }
        registry.reset("agent-1").await;
        assert_eq!(registry.state("agent-1").await, CircuitState::Closed);
    }
}
