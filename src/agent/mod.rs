//! Agent Bounded Context: event-driven subscriptions feeding a decider
//! that may emit commands directly or route them through human approval,
//! guarded by a cost budget and an in-process circuit breaker, with every
//! material action appended to the audit trail.

pub mod approval;
pub mod audit;
pub mod budget;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod dead_letter;
pub mod decider;
pub mod lifecycle;
pub mod subscription;

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::command::{BusError, CommandBus};
use crate::config::AgentRuntimeConfig;
use crate::event_store::{Event, EventStore};
use crate::ids::new_id;

use approval::{ApprovalRegistry, PendingApproval};
use audit::{AgentAuditEventType, InMemoryAuditLog};
use budget::{AgentBudgetTracker, BudgetStatus, ModelCostTable};
use checkpoint::{AgentCheckpointStore, AgentStatus};
use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use dead_letter::{sanitize_error, AgentDeadLetterStore};
use decider::{filter_to_window, interpret_decision, AgentDecision, AgentExecutionContext, HumanInLoopPolicy, LlmClient, RoutingDecision};
use subscription::AgentSubscription;

#[derive(Debug, Error)]
pub enum AgentRuntimeError {
    #[error("circuit breaker open for agent {0}")]
    CircuitOpen(String),
    #[error("daily budget exceeded for agent {0}")]
    BudgetExceeded(String),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A decider is the pluggable brain behind an agent: given the execution
/// context it returns a decision, or `None` for "nothing to do".
#[async_trait::async_trait]
pub trait AgentDecider: Send + Sync {
    async fn decide(&self, context: &AgentExecutionContext<'_>) -> Option<AgentDecision>;
}

/// Ties subscription matching, checkpointing, decision-making, approval
/// routing, budget enforcement, circuit breaking, and audit logging into
/// one event-handling flow.
pub struct AgentRuntime {
    event_store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn AgentCheckpointStore>,
    dead_letters: Arc<dyn AgentDeadLetterStore>,
    approvals: Arc<ApprovalRegistry>,
    budget: Arc<AgentBudgetTracker>,
    cost_table: ModelCostTable,
    circuit_breaker: Arc<CircuitBreakerRegistry>,
    audit: Arc<InMemoryAuditLog>,
    command_bus: Arc<CommandBus>,
    config: AgentRuntimeConfig,
}

impl AgentRuntime {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn AgentCheckpointStore>,
        dead_letters: Arc<dyn AgentDeadLetterStore>,
        command_bus: Arc<CommandBus>,
        config: AgentRuntimeConfig,
    ) -> Self {
        let circuit_breaker = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failure_threshold,
            open_timeout: std::time::Duration::from_secs(config.circuit_breaker_timeout_secs),
            success_threshold: config.circuit_breaker_success_threshold,
        }));
        Self {
            event_store,
            checkpoints,
            dead_letters,
            approvals: Arc::new(ApprovalRegistry::new(command_bus.clone())),
            budget: Arc::new(AgentBudgetTracker::new(config.daily_budget_usd, config.alert_threshold_fraction)),
            cost_table: ModelCostTable::default(),
            circuit_breaker,
            audit: Arc::new(InMemoryAuditLog::new()),
            command_bus,
            config,
        }
    }

    pub fn approvals(&self) -> &Arc<ApprovalRegistry> {
        &self.approvals
    }

    pub fn audit(&self) -> &Arc<InMemoryAuditLog> {
        &self.audit
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuit_breaker
    }

    /// Runs the full event-handling flow for one matching event: load
    /// checkpoint, filter to pattern window, budget gate, circuit-breaker-
    /// guarded decide, interpret, route. A handler/backend error is
    /// recorded to the dead-letter store rather than propagated,
    /// mirroring the runtime's "never let one poisoned event stop the
    /// subscription" contract.
    #[instrument(name = "agent.on_event", skip_all, fields(agent_id = %subscription.agent_id, event_id = %event.event_id))]
    pub async fn on_event(
        &self,
        subscription: &AgentSubscription,
        event: &Event,
        llm: &dyn LlmClient,
        decider: &dyn AgentDecider,
    ) {
        if let Err(e) = self.try_handle(subscription, event, llm, decider).await {
            warn!(error = %e, "agent event handling failed, quarantining");
            self.dead_letters
                .record_attempt(
                    &subscription.agent_id,
                    &subscription.subscription_id,
                    &event.event_id,
                    event.global_position,
                    &sanitize_error(&e.to_string()),
                )
                .await;
            #[cfg(feature = "otel")]
            {
                use crate::metrics::{self, AGENT_DEAD_LETTER_TOTAL};
                AGENT_DEAD_LETTER_TOTAL.add(1, &[metrics::agent_attr(&subscription.agent_id)]);
            }
            self.audit
                .record(
                    &subscription.agent_id,
                    AgentAuditEventType::DeadLetterRecorded,
                    serde_json::json!({ "event_id": event.event_id, "reason": e.to_string() }),
                    chrono::Utc::now(),
                )
                .await;
        }
    }

    async fn try_handle(
        &self,
        subscription: &AgentSubscription,
        event: &Event,
        llm: &dyn LlmClient,
        decider: &dyn AgentDecider,
    ) -> Result<(), AgentRuntimeError> {
        if !subscription.matches(event) {
            return Ok(());
        }

        // Step 1: load checkpoint. A paused/stopped agent silently skips
        // the event rather than failing.
        let checkpoint = self.checkpoints.load(&subscription.agent_id, &subscription.subscription_id).await;
        if checkpoint.status != AgentStatus::Active {
            return Ok(());
        }

        // Step 2: filter history to the pattern window.
        let history = self
            .event_store
            .read_stream(&event.stream_type, &event.stream_id)
            .await
            .map_err(|e| AgentRuntimeError::Bus(BusError::Command(e.into())))?;
        let windowed = filter_to_window(&history, subscription, chrono::Utc::now());

        if windowed.len() < subscription.pattern_window.min_events {
            self.checkpoints
                .advance(&subscription.agent_id, &subscription.subscription_id, &event.event_id, event.global_position)
                .await;
            self.audit
                .record(
                    &subscription.agent_id,
                    AgentAuditEventType::CheckpointUpdated,
                    serde_json::json!({ "event_id": event.event_id, "global_position": event.global_position }),
                    chrono::Utc::now(),
                )
                .await;
            return Ok(());
        }

        // Step 3: budget gate before spending on a backend call.
        let estimated_cost = budget::estimate_cost(&self.cost_table, "claude-sonnet", 2000, 500);
        let budget_check = self.budget.check_budget(&subscription.agent_id, estimated_cost).await;
        if matches!(budget_check.status, BudgetStatus::Exhausted) {
            return Err(AgentRuntimeError::BudgetExceeded(subscription.agent_id.clone()));
        }

        // Step 4: circuit-breaker-guarded call into the decider.
        self.circuit_breaker
            .before_call(&subscription.agent_id)
            .await
            .map_err(|_| AgentRuntimeError::CircuitOpen(subscription.agent_id.clone()))?;

        let context = AgentExecutionContext {
            agent_id: &subscription.agent_id,
            history: &windowed,
            checkpoint: &checkpoint,
            llm,
        };
        #[cfg(feature = "otel")]
        let decision_start = std::time::Instant::now();
        let decision = decider.decide(&context).await;
        #[cfg(feature = "otel")]
        {
            use crate::metrics::{self, AGENT_DECISION_DURATION};
            AGENT_DECISION_DURATION.record(decision_start.elapsed().as_secs_f64(), &[metrics::agent_attr(&subscription.agent_id)]);
        }
        self.circuit_breaker.on_success(&subscription.agent_id).await;
        self.budget.record_spend(&subscription.agent_id, estimated_cost).await;
        #[cfg(feature = "otel")]
        {
            use crate::metrics::{self, AGENT_COST_TOTAL};
            AGENT_COST_TOTAL.add(estimated_cost, &[metrics::agent_attr(&subscription.agent_id)]);
        }

        if decision.is_some() {
            self.audit
                .record(
                    &subscription.agent_id,
                    AgentAuditEventType::PatternDetected,
                    serde_json::json!({ "event_id": event.event_id }),
                    chrono::Utc::now(),
                )
                .await;
        }

        // Steps 5-6: interpret the decision.
        let policy = HumanInLoopPolicy {
            requires_approval: self.config.requires_approval.clone(),
            auto_approve: self.config.auto_approve.clone(),
            confidence_threshold: self.config.approval_confidence_threshold,
        };
        let routing = interpret_decision(decision, &policy, &self.config.default_approval_timeout, chrono::Utc::now());

        match routing {
            RoutingDecision::Done => {}
            RoutingDecision::Emit(command) => {
                match self.command_bus.dispatch(command).await {
                    Ok(_) => {
                        self.audit
                            .record(
                                &subscription.agent_id,
                                AgentAuditEventType::AgentCommandRouted,
                                serde_json::json!({ "event_id": event.event_id }),
                                chrono::Utc::now(),
                            )
                            .await;
                    }
                    Err(e) => {
                        self.audit
                            .record(
                                &subscription.agent_id,
                                AgentAuditEventType::AgentCommandRoutingFailed,
                                serde_json::json!({ "event_id": event.event_id, "error": e.to_string() }),
                                chrono::Utc::now(),
                            )
                            .await;
                        return Err(AgentRuntimeError::Bus(e));
                    }
                }
            }
            RoutingDecision::RequireApproval {
                command,
                confidence,
                reason,
                expires_at,
            } => {
                let approval = PendingApproval {
                    approval_id: new_id(),
                    agent_id: subscription.agent_id.clone(),
                    decision_id: crate::ids::new_decision_id(),
                    command,
                    confidence,
                    reason: reason.clone(),
                    state: approval::ApprovalState::Pending,
                    created_at: chrono::Utc::now(),
                    expires_at,
                    resolved_by: None,
                };
                self.approvals.create(approval).await;
                self.audit
                    .record(
                        &subscription.agent_id,
                        AgentAuditEventType::ApprovalRequested,
                        serde_json::json!({ "event_id": event.event_id, "reason": reason }),
                        chrono::Utc::now(),
                    )
                    .await;
            }
        }

        // Step 7: advance checkpoint.
        self.checkpoints
            .advance(&subscription.agent_id, &subscription.subscription_id, &event.event_id, event.global_position)
            .await;
        self.audit
            .record(
                &subscription.agent_id,
                AgentAuditEventType::CheckpointUpdated,
                serde_json::json!({ "event_id": event.event_id, "global_position": event.global_position }),
                chrono::Utc::now(),
            )
            .await;

        Ok(())
    }

    pub async fn set_status(&self, agent_id: &str, subscription_id: &str, status: AgentStatus) {
        self.checkpoints.set_status(agent_id, subscription_id, status).await;
        let event_type = match status {
            AgentStatus::Active => AgentAuditEventType::AgentStarted,
            AgentStatus::Paused => AgentAuditEventType::AgentPaused,
            AgentStatus::Stopped => AgentAuditEventType::AgentStopped,
            AgentStatus::ErrorRecovery => AgentAuditEventType::AgentErrorRecoveryStarted,
        };
        self.audit.record(agent_id, event_type, serde_json::json!({}), chrono::Utc::now()).await;
        info!(agent_id, ?status, "agent status updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::checkpoint::InMemoryAgentCheckpointStore;
    use crate::agent::dead_letter::InMemoryAgentDeadLetterStore;
    use crate::agent::decider::NoopLlmClient;
    use crate::agent::subscription::PatternWindow;
    use crate::command::record_store::InMemoryCommandRecordStore;
    use crate::command::{CommandConfig, CommandEnvelope, CommandOrchestrator, DomainHandler, HandlerOutcome, MiddlewareChain};
    use crate::event_store::memory::InMemoryEventStore;
    use crate::event_store::NewEvent;
    use crate::workpool::{OnComplete, RetryPolicy, Task, TaskHandler, Workpool};
    use async_trait::async_trait;

    struct NoopHandler;
    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(&self, _t: &str, _a: &serde_json::Value) -> crate::workpool::Result<()> {
            Ok(())
        }
    }
    struct NoopOnComplete;
    #[async_trait]
    impl OnComplete for NoopOnComplete {
        async fn on_dead(&self, _t: &Task) {}
    }
    struct AcceptingHandler;
    #[async_trait]
    impl DomainHandler for AcceptingHandler {
        async fn handle(&self, _envelope: &CommandEnvelope, prior: &[Event]) -> HandlerOutcome {
            HandlerOutcome::Success {
                expected_version: prior.len() as u32,
                events: vec![NewEvent::new("FraudFlagged", serde_json::json!({}))],
                data: None,
            }
        }
    }

    struct AlwaysEmitDecider;
    #[async_trait]
    impl AgentDecider for AlwaysEmitDecider {
        async fn decide(&self, context: &AgentExecutionContext<'_>) -> Option<AgentDecision> {
            Some(AgentDecision {
                command: Some(CommandEnvelope {
                    command_id: new_id(),
                    command_type: "FlagFraud".to_string(),
                    stream_type: "order".to_string(),
                    stream_id: "o1".to_string(),
                    bounded_context: "orders".to_string(),
                    args: serde_json::json!({}),
                    correlation_id: None,
                    causation_id: None,
                    user_id: None,
                }),
                confidence: 0.99,
                requires_approval: false,
                reason: format!("{} events observed", context.history.len()),
            })
        }
    }

    fn command_bus() -> Arc<CommandBus> {
        let workpool = Arc::new(Workpool::new(4, RetryPolicy::default(), Arc::new(NoopHandler), Arc::new(NoopOnComplete)));
        let orchestrator = Arc::new(CommandOrchestrator::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryCommandRecordStore::new()),
            MiddlewareChain::new(),
            workpool,
        ));
        let mut bus = CommandBus::new();
        bus.register("orders", orchestrator, CommandConfig::default(), Arc::new(AcceptingHandler));
        Arc::new(bus)
    }

    fn test_subscription() -> AgentSubscription {
        AgentSubscription {
            subscription_id: "sub-1".to_string(),
            agent_id: "agent-1".to_string(),
            event_types: vec![],
            bounded_context: "orders".to_string(),
            priority: subscription::DEFAULT_AGENT_PRIORITY,
            pattern_window: PatternWindow {
                duration: "7d".to_string(),
                min_events: 0,
                event_limit: 100,
            },
        }
    }

    fn test_event() -> Event {
        Event {
            event_id: "e1".to_string(),
            event_type: "OrderPlaced".to_string(),
            stream_type: "order".to_string(),
            stream_id: "o1".to_string(),
            version: 1,
            global_position: 1,
            bounded_context: "orders".to_string(),
            category: crate::event_store::EventCategory::Domain,
            schema_version: 1,
            correlation_id: "corr-1".to_string(),
            causation_id: None,
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({}),
            metadata: None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn high_confidence_decision_emits_command_and_advances_checkpoint() {
        let event_store = Arc::new(InMemoryEventStore::new());
        let runtime = AgentRuntime::new(
            event_store,
            Arc::new(InMemoryAgentCheckpointStore::new()),
            Arc::new(InMemoryAgentDeadLetterStore::new()),
            command_bus(),
            AgentRuntimeConfig::default(),
        );

        let subscription = test_subscription();
        runtime.on_event(&subscription, &test_event(), &NoopLlmClient, &AlwaysEmitDecider).await;

        let checkpoint = runtime.checkpoints.load("agent-1", "sub-1").await;
        assert_eq!(checkpoint.events_processed, 1);

        let audit = runtime.audit().list_for_agent("agent-1").await;
        assert!(audit.iter().any(|e| matches!(e.event_type, AgentAuditEventType::AgentCommandRouted)));
    }

    #[tokio::test]
    async fn non_matching_subscription_is_a_no_op() {
        let event_store = Arc::new(InMemoryEventStore::new());
        let runtime = AgentRuntime::new(
            event_store,
            Arc::new(InMemoryAgentCheckpointStore::new()),
            Arc::new(InMemoryAgentDeadLetterStore::new()),
            command_bus(),
            AgentRuntimeConfig::default(),
        );

        let mut subscription = test_subscription();
        subscription.bounded_context = "inventory".to_string();
        runtime.on_event(&subscription, &test_event(), &NoopLlmClient, &AlwaysEmitDecider).await;

        let checkpoint = runtime.checkpoints.load("agent-1", "sub-1").await;
        assert_eq!(checkpoint.events_processed, 0);
    }
}
