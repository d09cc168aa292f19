//! Command Bus: routes a command to its target bounded context's
//! orchestrator, sharing the same at-most-once semantics as the
//! orchestrator's own command-record step. The principal caller is the
//! agent runtime, which emits commands across context boundaries rather
//! than calling an orchestrator directly.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::{CommandConfig, CommandEnvelope, CommandOrchestrator, CommandOutcome, DomainHandler};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no route registered for bounded context '{0}'")]
    UnknownContext(String),
    #[error(transparent)]
    Command(#[from] super::CommandError),
}

struct Route {
    orchestrator: Arc<CommandOrchestrator>,
    config: CommandConfig,
    handler: Arc<dyn DomainHandler>,
}

/// Registry mapping `bounded_context` to the orchestrator, config, and
/// domain handler that should process commands for it.
#[derive(Default)]
pub struct CommandBus {
    routes: HashMap<String, Route>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        bounded_context: impl Into<String>,
        orchestrator: Arc<CommandOrchestrator>,
        config: CommandConfig,
        handler: Arc<dyn DomainHandler>,
    ) {
        self.routes.insert(
            bounded_context.into(),
            Route {
                orchestrator,
                config,
                handler,
            },
        );
    }

    /// Route a command to its target context, whatever the caller's own
    /// context is.
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> Result<CommandOutcome, BusError> {
        let route = self
            .routes
            .get(&envelope.bounded_context)
            .ok_or_else(|| BusError::UnknownContext(envelope.bounded_context.clone()))?;

        route
            .orchestrator
            .execute(&route.config, envelope, route.handler.as_ref())
            .await
            .map_err(BusError::Command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::record_store::InMemoryCommandRecordStore;
    use crate::command::{HandlerOutcome, MiddlewareChain};
    use crate::event_store::memory::InMemoryEventStore;
    use crate::event_store::{Event, NewEvent};
    use crate::workpool::{OnComplete, RetryPolicy, Task, TaskHandler, Workpool};
    use async_trait::async_trait;

    struct NoopHandler;
    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(&self, _target: &str, _args: &serde_json::Value) -> crate::workpool::Result<()> {
            Ok(())
        }
    }
    struct NoopOnComplete;
    #[async_trait]
    impl OnComplete for NoopOnComplete {
        async fn on_dead(&self, _task: &Task) {}
    }

    struct AcceptingHandler;
    #[async_trait]
    impl DomainHandler for AcceptingHandler {
        async fn handle(&self, _envelope: &CommandEnvelope, prior: &[Event]) -> HandlerOutcome {
            HandlerOutcome::Success {
                expected_version: prior.len() as u32,
                events: vec![NewEvent::new("OrderCreated", serde_json::json!({}))],
                data: None,
            }
        }
    }

    #[tokio::test]
    async fn dispatch_to_unknown_context_is_rejected() {
        let bus = CommandBus::new();
        let envelope = CommandEnvelope {
            command_id: "cmd-1".to_string(),
            command_type: "PlaceOrder".to_string(),
            stream_type: "order".to_string(),
            stream_id: "o1".to_string(),
            bounded_context: "orders".to_string(),
            args: serde_json::json!({}),
            correlation_id: None,
            causation_id: None,
            user_id: None,
        };
        let result = bus.dispatch(envelope).await;
        assert!(matches!(result, Err(BusError::UnknownContext(_))));
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_context() {
        let workpool = Arc::new(Workpool::new(
            4,
            RetryPolicy::default(),
            Arc::new(NoopHandler),
            Arc::new(NoopOnComplete),
        ));
        let orchestrator = Arc::new(CommandOrchestrator::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryCommandRecordStore::new()),
            MiddlewareChain::new(),
            workpool,
        ));

        let mut bus = CommandBus::new();
        bus.register(
            "orders",
            orchestrator,
            CommandConfig::default(),
            Arc::new(AcceptingHandler),
        );

        let envelope = CommandEnvelope {
            command_id: "cmd-1".to_string(),
            command_type: "PlaceOrder".to_string(),
            stream_type: "order".to_string(),
            stream_id: "o1".to_string(),
            bounded_context: "orders".to_string(),
            args: serde_json::json!({}),
            correlation_id: None,
            causation_id: None,
            user_id: None,
        };
        let outcome = bus.dispatch(envelope).await.unwrap();
        assert_eq!(outcome.new_version, 1);
    }
}
