//! Application-layer runtime for event-sourced, CQRS-style bounded
//! contexts with durable orchestration: an append-only event store with
//! per-stream OCC, a command orchestrator, a partitioned retrying
//! workpool, checkpointed projections, chunked replay, process managers
//! and sagas, a scope-versioned dynamic consistency boundary, and an
//! agent bounded context with human-in-the-loop approval, cost budgeting,
//! and an in-process circuit breaker.

pub mod admin;
pub mod agent;
pub mod command;
pub mod config;
pub mod dcb;
pub mod event_store;
pub mod fsm;
pub mod ids;
pub mod process_manager;
pub mod projection;
pub mod replay;
pub mod saga;
pub mod workpool;

#[cfg(feature = "otel")]
pub mod metrics;

pub use config::Config;
pub use event_store::{Event, EventStore, NewEvent, StoreError};
pub use fsm::StateMachine;

/// Initializes the `tracing` subscriber for binaries embedding this
/// runtime. Libraries should prefer leaving subscriber setup to the host
/// application; this is exposed for small standalone tools and tests.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
