//! Sagas: durable multi-step coordinators that may await mutations and
//! compensate on failure, identified by `(sagaType, sagaId)` with
//! at-most-one instance per business key. Dispatch collects interested
//! subscribers under a read lock and releases it before running the async
//! steps.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use backon::Retryable;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::command::bus::BusError;
use crate::command::{CommandBus, CommandEnvelope, CommandError};
use crate::event_store::Event;
use crate::workpool::RetryPolicy;

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("saga step failed: {0}")]
    Failed(String),
    #[error("saga-emitted command failed: {0}")]
    CommandFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

/// Durable record for one `(sagaType, sagaId)` instance.
#[derive(Debug, Clone)]
pub struct SagaInstance {
    pub saga_type: String,
    pub saga_id: String,
    pub workflow_id: String,
    pub status: SagaStatus,
    pub trigger_event_id: String,
    pub trigger_global_position: i64,
    pub error: Option<String>,
    /// Commands already committed by this saga, in emission order, kept so
    /// a failed later step can invoke their inverse during compensation.
    pub committed_commands: Vec<CommandEnvelope>,
}

/// A saga step: a single triggering event in, zero or more commands plus a
/// continuation status out. Prefer a saga over a process manager whenever
/// compensation or multi-step awaits are needed.
#[async_trait]
pub trait Saga: Send + Sync {
    fn saga_type(&self) -> &str;

    /// Business key this event maps to, or `None` if this saga is not
    /// interested in the event.
    fn saga_id_for(&self, event: &Event) -> Option<String>;

    /// Advance the saga given the triggering event and its instance state
    /// (`None` on first trigger). Returns commands to execute and the next
    /// status.
    async fn step(
        &self,
        event: &Event,
        instance: Option<&SagaInstance>,
    ) -> Result<(Vec<CommandEnvelope>, SagaStatus), SagaError>;

    /// Given previously committed commands, produce their inverse
    /// (compensating) commands, innermost-first.
    async fn compensate(&self, committed: &[CommandEnvelope]) -> Vec<CommandEnvelope> {
        let _ = committed;
        Vec::new()
    }
}

#[derive(Default)]
struct InstanceStore {
    instances: HashMap<(String, String), SagaInstance>,
}

/// Registry of sagas plus their durable instances. Dispatch snapshots the
/// interested list under a read lock, then runs the async steps after
/// releasing it.
pub struct SagaRuntime {
    sagas: RwLock<Vec<Arc<dyn Saga>>>,
    instances: RwLock<InstanceStore>,
    command_bus: Arc<CommandBus>,
    retry_policy: RetryPolicy,
}

impl SagaRuntime {
    pub fn new(command_bus: Arc<CommandBus>) -> Self {
        Self::with_retry_policy(command_bus, RetryPolicy::default())
    }

    /// `policy` governs retries of saga-emitted commands that fail with a
    /// version conflict; it does not affect step execution itself.
    pub fn with_retry_policy(command_bus: Arc<CommandBus>, retry_policy: RetryPolicy) -> Self {
        Self {
            sagas: RwLock::new(Vec::new()),
            instances: RwLock::new(InstanceStore::default()),
            command_bus,
            retry_policy,
        }
    }

    pub async fn register(&self, saga: Arc<dyn Saga>) {
        self.sagas.write().await.push(saga);
    }

    pub async fn dispatch(&self, event: &Event) {
        let interested: Vec<Arc<dyn Saga>> = {
            let sagas = self.sagas.read().await;
            sagas
                .iter()
                .filter(|s| s.saga_id_for(event).is_some())
                .cloned()
                .collect()
        };

        for saga in interested {
            if let Some(saga_id) = saga.saga_id_for(event) {
                if let Err(e) = self.run_step(saga.as_ref(), &saga_id, event).await {
                    error!(saga_type = saga.saga_type(), %saga_id, error = %e, "saga step failed");
                }
            }
        }
    }

    async fn run_step(&self, saga: &dyn Saga, saga_id: &str, event: &Event) -> Result<(), SagaError> {
        #[cfg(feature = "otel")]
        let start = std::time::Instant::now();
        let result = self.run_step_inner(saga, saga_id, event).await;
        #[cfg(feature = "otel")]
        {
            use crate::metrics::{self, SAGA_DURATION};
            SAGA_DURATION.record(start.elapsed().as_secs_f64(), &[metrics::component_attr(saga.saga_type())]);
        }
        result
    }

    async fn run_step_inner(&self, saga: &dyn Saga, saga_id: &str, event: &Event) -> Result<(), SagaError> {
        let key = (saga.saga_type().to_string(), saga_id.to_string());
        let prior = self.instances.read().await.instances.get(&key).cloned();

        let (commands, next_status) = match saga.step(event, prior.as_ref()).await {
            Ok(result) => result,
            Err(e) => {
                self.compensate_and_mark(saga, &key, event, prior.as_ref(), &e.to_string())
                    .await;
                return Err(e);
            }
        };

        let mut committed = prior
            .as_ref()
            .map(|i| i.committed_commands.clone())
            .unwrap_or_default();

        let mut failure = None;
        for command in commands {
            let backoff = self.retry_policy.to_backon();
            let result = (|| async { self.command_bus.dispatch(command.clone()).await })
                .retry(backoff)
                .when(|e| matches!(e, BusError::Command(CommandError::Conflict { .. })))
                .await;

            match result {
                Ok(_) => committed.push(command),
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            warn!(saga_type = saga.saga_type(), saga_id, "compensating after command failure");
            let compensations = saga.compensate(&committed).await;
            #[cfg(feature = "otel")]
            {
                use crate::metrics::SAGA_COMPENSATION_TOTAL;
                SAGA_COMPENSATION_TOTAL.add(1, &[]);
            }
            for compensation in compensations {
                let _ = self.command_bus.dispatch(compensation).await;
            }
            self.store_instance(SagaInstance {
                saga_type: saga.saga_type().to_string(),
                saga_id: saga_id.to_string(),
                workflow_id: prior.as_ref().map(|i| i.workflow_id.clone()).unwrap_or_else(|| crate::ids::new_id()),
                status: SagaStatus::Compensated,
                trigger_event_id: event.event_id.clone(),
                trigger_global_position: event.global_position,
                error: Some(reason.clone()),
                committed_commands: committed,
            })
            .await;
            return Err(SagaError::CommandFailed(reason));
        }

        self.store_instance(SagaInstance {
            saga_type: saga.saga_type().to_string(),
            saga_id: saga_id.to_string(),
            workflow_id: prior.map(|i| i.workflow_id).unwrap_or_else(|| crate::ids::new_id()),
            status: next_status,
            trigger_event_id: event.event_id.clone(),
            trigger_global_position: event.global_position,
            error: None,
            committed_commands: committed,
        })
        .await;

        info!(saga_type = saga.saga_type(), saga_id, "saga step completed");
        Ok(())
    }

    /// A failed step invokes the inverse of whatever commands the saga
    /// already committed on prior steps, then records `Compensated` rather
    /// than leaving the instance `Failed` with steps uncompensated.
    async fn compensate_and_mark(
        &self,
        saga: &dyn Saga,
        key: &(String, String),
        event: &Event,
        prior: Option<&SagaInstance>,
        reason: &str,
    ) {
        let committed = prior.map(|i| i.committed_commands.clone()).unwrap_or_default();
        if !committed.is_empty() {
            warn!(saga_type = key.0, saga_id = key.1, "compensating after step failure");
            let compensations = saga.compensate(&committed).await;
            #[cfg(feature = "otel")]
            {
                use crate::metrics::SAGA_COMPENSATION_TOTAL;
                SAGA_COMPENSATION_TOTAL.add(1, &[]);
            }
            for compensation in compensations {
                let _ = self.command_bus.dispatch(compensation).await;
            }
        }

        self.store_instance(SagaInstance {
            saga_type: key.0.clone(),
            saga_id: key.1.clone(),
            workflow_id: prior.map(|i| i.workflow_id.clone()).unwrap_or_else(|| crate::ids::new_id()),
            status: SagaStatus::Compensated,
            trigger_event_id: event.event_id.clone(),
            trigger_global_position: event.global_position,
            error: Some(reason.to_string()),
            committed_commands: committed,
        })
        .await;
    }

    async fn store_instance(&self, instance: SagaInstance) {
        self.instances
            .write()
            .await
            .instances
            .insert((instance.saga_type.clone(), instance.saga_id.clone()), instance);
    }

    pub async fn get_instance(&self, saga_type: &str, saga_id: &str) -> Option<SagaInstance> {
        self.instances
            .read()
            .await
            .instances
            .get(&(saga_type.to_string(), saga_id.to_string()))
            .cloned()
    }
}
