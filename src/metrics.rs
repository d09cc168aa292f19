//! OTel-native metrics instruments. Centralized, lazily-initialized,
//! feature-gated behind `otel`: off does not change runtime behavior,
//! only whether instruments are recorded.
//!
//! Naming follows OTel semantic conventions (dot-separated); the
//! Collector/Prometheus exporter converts dots to underscores.

#![cfg(feature = "otel")]

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("runtime"));

// ============================================================================
// Command Orchestrator
// ============================================================================

pub static COMMAND_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("runtime.command.duration")
        .with_description("Command orchestrator pipeline duration")
        .with_unit("s")
        .build()
});

pub static COMMAND_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("runtime.command.total")
        .with_description("Total commands processed")
        .build()
});

// ============================================================================
// Workpool
// ============================================================================

pub static WORKPOOL_TASK_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("runtime.workpool.task.duration")
        .with_description("Workpool task execution duration")
        .with_unit("s")
        .build()
});

pub static WORKPOOL_TASK_RETRY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("runtime.workpool.task.retry.total")
        .with_description("Total workpool task retry attempts")
        .build()
});

pub static WORKPOOL_TASK_DEAD_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("runtime.workpool.task.dead.total")
        .with_description("Total workpool tasks dead-lettered")
        .build()
});

// ============================================================================
// Projection Engine
// ============================================================================

pub static PROJECTION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("runtime.projection.duration")
        .with_description("Projection handler duration")
        .with_unit("s")
        .build()
});

pub static PROJECTION_POISON_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("runtime.projection.poison.total")
        .with_description("Total events quarantined as poison")
        .build()
});

// ============================================================================
// Replay
// ============================================================================

pub static REPLAY_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("runtime.replay.duration")
        .with_description("Replay chunk processing duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Saga
// ============================================================================

pub static SAGA_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("runtime.saga.duration")
        .with_description("Saga step duration")
        .with_unit("s")
        .build()
});

pub static SAGA_COMPENSATION_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("runtime.saga.compensation.total")
        .with_description("Total saga compensations triggered")
        .build()
});

// ============================================================================
// Agent Bounded Context
// ============================================================================

pub static AGENT_DECISION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("runtime.agent.decision.duration")
        .with_description("Agent decision loop duration")
        .with_unit("s")
        .build()
});

pub static AGENT_COST_TOTAL: LazyLock<Counter<f64>> = LazyLock::new(|| {
    METER
        .f64_counter("runtime.agent.cost.total")
        .with_description("Estimated agent spend, in USD")
        .build()
});

pub static AGENT_DEAD_LETTER_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("runtime.agent.dead_letter.total")
        .with_description("Total agent events dead-lettered")
        .build()
});

pub static AGENT_CIRCUIT_OPEN_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("runtime.agent.circuit.open.total")
        .with_description("Total times an agent's circuit breaker opened")
        .build()
});

// ============================================================================
// Helpers
// ============================================================================

pub fn component_attr(component: &str) -> KeyValue {
    KeyValue::new("component", component.to_string())
}

pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

pub fn agent_attr(agent_id: &str) -> KeyValue {
    KeyValue::new("agent_id", agent_id.to_string())
}
