//! The command pipeline: load prior state, invoke domain logic, persist
//! events, then fan out to projections and saga/agent routing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::middleware::MiddlewareOutcome;
use super::record_store::{BeginOutcome, CommandRecordStore};
use super::{CommandConfig, CommandEnvelope, CommandError, CommandOutcome, MiddlewareChain, Result};
use crate::event_store::{Event, EventStore, NewEvent};
use crate::ids;
use crate::workpool::{EnqueueOptions, Workpool};

/// Decision returned by a domain handler. The handler is the sole party
/// that mutates the CMS snapshot, in the same transaction that produces
/// this decision.
pub enum HandlerOutcome {
    Success {
        expected_version: u32,
        events: Vec<NewEvent>,
        data: Option<serde_json::Value>,
    },
    Rejected {
        code: String,
        reason: String,
    },
    Conflict {
        current_version: u32,
    },
    Error(String),
}

/// Domain handler for one command type, addressed to one stream.
#[async_trait]
pub trait DomainHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: &CommandEnvelope,
        prior_events: &[Event],
    ) -> HandlerOutcome;
}

/// Runs the 7-step pipeline against a concrete [`EventStore`],
/// [`CommandRecordStore`], [`MiddlewareChain`], and [`Workpool`].
pub struct CommandOrchestrator {
    event_store: Arc<dyn EventStore>,
    record_store: Arc<dyn CommandRecordStore>,
    middleware: MiddlewareChain,
    workpool: Arc<Workpool>,
}

impl CommandOrchestrator {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        record_store: Arc<dyn CommandRecordStore>,
        middleware: MiddlewareChain,
        workpool: Arc<Workpool>,
    ) -> Self {
        Self {
            event_store,
            record_store,
            middleware,
            workpool,
        }
    }

    #[instrument(name = "command.execute", skip_all, fields(command_id = %envelope.command_id, command_type = %envelope.command_type))]
    pub async fn execute(
        &self,
        config: &CommandConfig,
        envelope: CommandEnvelope,
        handler: &dyn DomainHandler,
    ) -> Result<CommandOutcome> {
        let start = std::time::Instant::now();
        let result = self.execute_inner(config, envelope, handler).await;

        #[cfg(feature = "otel")]
        {
            use crate::metrics::{self, COMMAND_DURATION, COMMAND_TOTAL};
            let outcome = if result.is_ok() { "success" } else { "error" };
            COMMAND_DURATION.record(start.elapsed().as_secs_f64(), &[metrics::outcome_attr(outcome)]);
            COMMAND_TOTAL.add(1, &[metrics::outcome_attr(outcome)]);
        }

        result
    }

    async fn execute_inner(
        &self,
        config: &CommandConfig,
        envelope: CommandEnvelope,
        handler: &dyn DomainHandler,
    ) -> Result<CommandOutcome> {
        let correlation_id = ids::ensure_correlation_id(envelope.correlation_id.as_deref());

        // Step 1: record command, at-most-once.
        match self
            .record_store
            .begin(&envelope.command_id, &envelope.command_type, &correlation_id)
            .await?
        {
            BeginOutcome::AlreadyCompleted(record) => {
                return Self::outcome_from_digest(record);
            }
            BeginOutcome::InFlight(record) => {
                return Err(CommandError::Rejected {
                    code: "COMMAND_IN_FLIGHT".to_string(),
                    reason: format!("command {} is already being processed", record.command_id),
                });
            }
            BeginOutcome::Start => {}
        }

        // Step 2: middleware pipeline.
        if let MiddlewareOutcome::Reject { code, reason } = self.middleware.run(&envelope).await {
            self.record_store
                .fail(&envelope.command_id, &reason)
                .await?;
            return Err(CommandError::Middleware(format!("{code}: {reason}")));
        }

        let prior_events = self
            .event_store
            .read_stream(&envelope.stream_type, &envelope.stream_id)
            .await?;

        // Step 3: invoke domain handler.
        let outcome = handler.handle(&envelope, &prior_events).await;

        // Step 4: rejection / conflict handling.
        let (expected_version, events, data) = match outcome {
            HandlerOutcome::Success {
                expected_version,
                events,
                data,
            } => (expected_version, events, data),
            HandlerOutcome::Rejected { code, reason } => {
                self.record_store
                    .fail(&envelope.command_id, &reason)
                    .await?;
                return Err(CommandError::Rejected { code, reason });
            }
            HandlerOutcome::Conflict { current_version } => {
                self.record_store
                    .fail(&envelope.command_id, "concurrency conflict")
                    .await?;
                return Err(CommandError::Conflict { current_version });
            }
            HandlerOutcome::Error(message) => {
                self.record_store
                    .fail(&envelope.command_id, &message)
                    .await?;
                return Err(CommandError::Handler(message));
            }
        };

        // Step 5: append event.
        let append = self
            .event_store
            .append_to_stream(
                &envelope.stream_type,
                &envelope.stream_id,
                expected_version,
                &envelope.bounded_context,
                events,
            )
            .await?;

        let (event_ids, global_positions, new_version) = match append {
            crate::event_store::AppendOutcome::Success {
                event_ids,
                global_positions,
                new_version,
            } => (event_ids, global_positions, new_version),
            crate::event_store::AppendOutcome::Conflict { current_version } => {
                self.record_store
                    .fail(&envelope.command_id, "concurrency conflict on append")
                    .await?;
                return Err(CommandError::Conflict { current_version });
            }
        };

        // Step 6: schedule projections.
        self.schedule_projections(config, &envelope, &global_positions)
            .await;

        // Step 6b: route to sagas; agent subscriptions are event-driven
        // and are not orchestrator-scheduled.
        self.schedule_sagas(config, &envelope, &correlation_id).await;

        // Step 7: complete command record. This must follow a successful
        // step 6 enqueue; retries of a now-completed command short-circuit
        // at step 1 above.
        let digest = serde_json::json!({
            "event_ids": event_ids,
            "global_positions": global_positions,
            "new_version": new_version,
            "data": data,
        });
        self.record_store
            .complete(&envelope.command_id, digest)
            .await?;

        info!(
            events = event_ids.len(),
            new_version,
            "command completed"
        );

        Ok(CommandOutcome {
            command_id: envelope.command_id,
            event_ids,
            global_positions,
            new_version,
        })
    }

    /// Reconstructs the `CommandOutcome` of a prior completed run from its
    /// stored digest, so a retry of an already-completed command observes
    /// the same result rather than an empty one.
    fn outcome_from_digest(record: crate::command::record_store::CommandRecord) -> Result<CommandOutcome> {
        let digest = record.result_digest.ok_or_else(|| {
            CommandError::Handler(format!(
                "completed command {} has no result digest",
                record.command_id
            ))
        })?;
        let event_ids: Vec<String> = serde_json::from_value(digest["event_ids"].clone())
            .map_err(|e| CommandError::Handler(format!("malformed result digest: {e}")))?;
        let global_positions: Vec<i64> = serde_json::from_value(digest["global_positions"].clone())
            .map_err(|e| CommandError::Handler(format!("malformed result digest: {e}")))?;
        let new_version: u32 = serde_json::from_value(digest["new_version"].clone())
            .map_err(|e| CommandError::Handler(format!("malformed result digest: {e}")))?;
        Ok(CommandOutcome {
            command_id: record.command_id,
            event_ids,
            global_positions,
            new_version,
        })
    }

    async fn schedule_projections(
        &self,
        config: &CommandConfig,
        envelope: &CommandEnvelope,
        global_positions: &[i64],
    ) {
        let mut targets: Vec<&str> = config.primary_projection.as_deref().into_iter().collect();
        targets.extend(config.secondary_projections.iter().map(String::as_str));

        for projection in targets {
            let partition_key = format!("{}:{}", envelope.stream_type, envelope.stream_id);
            self.workpool
                .enqueue(
                    format!("projection:{projection}"),
                    serde_json::json!({
                        "stream_type": envelope.stream_type,
                        "stream_id": envelope.stream_id,
                        "global_positions": global_positions,
                    }),
                    EnqueueOptions {
                        partition_key: Some(partition_key),
                        ..Default::default()
                    },
                )
                .await;
        }
    }

    async fn schedule_sagas(
        &self,
        config: &CommandConfig,
        envelope: &CommandEnvelope,
        correlation_id: &str,
    ) {
        for saga_type in &config.saga_types {
            let partition_key = format!("saga:{saga_type}:{correlation_id}");
            self.workpool
                .enqueue(
                    format!("saga_start:{saga_type}"),
                    serde_json::json!({
                        "stream_type": envelope.stream_type,
                        "stream_id": envelope.stream_id,
                        "correlation_id": correlation_id,
                    }),
                    EnqueueOptions {
                        partition_key: Some(partition_key),
                        ..Default::default()
                    },
                )
                .await;
        }
        if config.saga_types.is_empty() {
            return;
        }
        warn!(count = config.saga_types.len(), "saga starters scheduled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::record_store::InMemoryCommandRecordStore;
    use crate::event_store::memory::InMemoryEventStore;
    use crate::workpool::{OnComplete, RetryPolicy, Task, TaskHandler, WorkpoolError};

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

    fn envelope() -> CommandEnvelope {
        CommandEnvelope {
            command_id: "cmd-1".to_string(),
            command_type: "PlaceOrder".to_string(),
            stream_type: "order".to_string(),
            stream_id: "o1".to_string(),
            bounded_context: "orders".to_string(),
            args: serde_json::json!({}),
            correlation_id: None,
            causation_id: None,
            user_id: None,
        }
    }

    fn orchestrator() -> CommandOrchestrator {
        let workpool = Arc::new(Workpool::new(
            4,
            RetryPolicy::default(),
            Arc::new(NoopHandler),
            Arc::new(NoopOnComplete),
        ));
        CommandOrchestrator::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryCommandRecordStore::new()),
            MiddlewareChain::new(),
            workpool,
        )
    }

    #[tokio::test]
    async fn happy_path_appends_event_and_completes_command() {
        let orchestrator = orchestrator();
        let outcome = orchestrator
            .execute(&CommandConfig::default(), envelope(), &AcceptingHandler)
            .await
            .unwrap();
        assert_eq!(outcome.new_version, 1);
        assert_eq!(outcome.event_ids.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_command_id_after_completion_is_idempotent() {
        let orchestrator = orchestrator();
        let first = orchestrator
            .execute(&CommandConfig::default(), envelope(), &AcceptingHandler)
            .await
            .unwrap();

        let second = orchestrator
            .execute(&CommandConfig::default(), envelope(), &AcceptingHandler)
            .await
            .unwrap();
        assert_eq!(second.event_ids, first.event_ids);
        assert_eq!(second.global_positions, first.global_positions);
        assert_eq!(second.new_version, first.new_version);
    }
}
