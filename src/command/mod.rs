//! Command Orchestrator: the pipeline that turns a command envelope into
//! persisted events, scheduled projections, and saga/agent routing, as a
//! plain async pipeline over local traits with no wire protocol of its own.

pub mod bus;
pub mod middleware;
pub mod orchestrator;
pub mod record_store;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bus::CommandBus;
pub use middleware::{Middleware, MiddlewareChain, MiddlewareOutcome};
pub use orchestrator::{CommandOrchestrator, DomainHandler, HandlerOutcome};
pub use record_store::{CommandRecord, CommandRecordStore, CommandStatus};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command rejected: {code}: {reason}")]
    Rejected { code: String, reason: String },
    #[error("concurrency conflict: current version {current_version}")]
    Conflict { current_version: u32 },
    #[error("handler error: {0}")]
    Handler(String),
    #[error(transparent)]
    Store(#[from] crate::event_store::StoreError),
    #[error("middleware short-circuited: {0}")]
    Middleware(String),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Inbound command, addressed to one aggregate stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub command_type: String,
    pub stream_type: String,
    pub stream_id: String,
    pub bounded_context: String,
    pub args: serde_json::Value,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub user_id: Option<String>,
}

/// Static configuration for one registered command type: which
/// projections to schedule and which saga types to route to.
#[derive(Debug, Clone, Default)]
pub struct CommandConfig {
    pub primary_projection: Option<String>,
    pub secondary_projections: Vec<String>,
    pub saga_types: Vec<String>,
}

/// Successful outcome of running the orchestrator pipeline.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command_id: String,
    pub event_ids: Vec<String>,
    pub global_positions: Vec<i64>,
    pub new_version: u32,
}
