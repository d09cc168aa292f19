//! Middleware pipeline: validation, structured logging with timing, and
//! rate limiting, chained linearly ahead of the domain handler. Any
//! middleware may short-circuit with a rejection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::CommandEnvelope;

/// Outcome of running one middleware.
pub enum MiddlewareOutcome {
    Continue,
    Reject { code: String, reason: String },
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, envelope: &CommandEnvelope) -> MiddlewareOutcome;
}

/// Linear chain of middlewares, run in registration order.
#[derive(Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub async fn run(&self, envelope: &CommandEnvelope) -> MiddlewareOutcome {
        for middleware in &self.middlewares {
            match middleware.handle(envelope).await {
                MiddlewareOutcome::Continue => continue,
                reject @ MiddlewareOutcome::Reject { .. } => return reject,
            }
        }
        MiddlewareOutcome::Continue
    }
}

/// Validates `command_type` against a static registry of known types.
pub struct ValidationMiddleware {
    known_types: Vec<String>,
}

impl ValidationMiddleware {
    pub fn new(known_types: Vec<String>) -> Self {
        Self { known_types }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn handle(&self, envelope: &CommandEnvelope) -> MiddlewareOutcome {
        if self.known_types.iter().any(|t| t == &envelope.command_type) {
            MiddlewareOutcome::Continue
        } else {
            MiddlewareOutcome::Reject {
                code: "UNKNOWN_COMMAND_TYPE".to_string(),
                reason: format!("command type '{}' is not registered", envelope.command_type),
            }
        }
    }
}

/// Logs each command with timing, mirroring the structured `tracing`
/// instrumentation style used throughout the orchestration layer.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, envelope: &CommandEnvelope) -> MiddlewareOutcome {
        info!(
            command_id = %envelope.command_id,
            command_type = %envelope.command_type,
            stream_id = %envelope.stream_id,
            "command received"
        );
        MiddlewareOutcome::Continue
    }
}

/// Fixed-window rate limiter keyed by `(user_id, command_type)`.
pub struct RateLimitMiddleware {
    window: Duration,
    max_per_window: u32,
    state: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimitMiddleware {
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self {
            window,
            max_per_window,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn key(envelope: &CommandEnvelope) -> String {
        format!(
            "{}:{}",
            envelope.user_id.as_deref().unwrap_or("anonymous"),
            envelope.command_type
        )
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(&self, envelope: &CommandEnvelope) -> MiddlewareOutcome {
        let key = Self::key(envelope);
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let entry = state.entry(key).or_insert((now, 0));

        if now.duration_since(entry.0) > self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;

        if entry.1 > self.max_per_window {
            MiddlewareOutcome::Reject {
                code: "RATE_LIMITED".to_string(),
                reason: format!(
                    "rate limit of {} per {:?} exceeded",
                    self.max_per_window, self.window
                ),
            }
        } else {
            MiddlewareOutcome::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(command_type: &str, user_id: &str) -> CommandEnvelope {
        CommandEnvelope {
            command_id: "cmd-1".to_string(),
            command_type: command_type.to_string(),
            stream_type: "order".to_string(),
            stream_id: "o1".to_string(),
            bounded_context: "orders".to_string(),
            args: serde_json::json!({}),
            correlation_id: None,
            causation_id: None,
            user_id: Some(user_id.to_string()),
        }
    }

    #[tokio::test]
    async fn validation_rejects_unknown_command_type() {
        let middleware = ValidationMiddleware::new(vec!["PlaceOrder".to_string()]);
        let outcome = middleware.handle(&envelope("CancelOrder", "u1")).await;
        assert!(matches!(outcome, MiddlewareOutcome::Reject { .. }));
    }

    #[tokio::test]
    async fn chain_short_circuits_on_first_rejection() {
        let chain = MiddlewareChain::new()
            .add(Arc::new(ValidationMiddleware::new(vec![])))
            .add(Arc::new(LoggingMiddleware));
        let outcome = chain.run(&envelope("PlaceOrder", "u1")).await;
        assert!(matches!(outcome, MiddlewareOutcome::Reject { .. }));
    }

    #[tokio::test]
    async fn rate_limiter_rejects_after_threshold_within_window() {
        let middleware = RateLimitMiddleware::new(Duration::from_secs(60), 2);
        let e = envelope("PlaceOrder", "u1");
        assert!(matches!(middleware.handle(&e).await, MiddlewareOutcome::Continue));
        assert!(matches!(middleware.handle(&e).await, MiddlewareOutcome::Continue));
        assert!(matches!(
            middleware.handle(&e).await,
            MiddlewareOutcome::Reject { .. }
        ));
    }
}
