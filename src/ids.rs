//! Identifier and correlation-chain helpers.
//!
//! Every event and command carries a `correlation_id` and optional
//! `causation_id`. When a caller omits a correlation id the runtime mints
//! one: UUID v7 is preferred because its time-ordered bit layout keeps
//! correlation ids roughly sortable, the same way `global_position` keeps
//! events roughly time-ordered.

use uuid::Uuid;

/// Generate a new correlation id (UUID v7).
pub fn new_correlation_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generate a new opaque entity id (UUID v7), used for event ids, task ids,
/// approval ids, and similar runtime-owned identifiers.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Return `existing` unchanged if non-empty, otherwise mint a fresh
/// correlation id.
pub fn ensure_correlation_id(existing: Option<&str>) -> String {
    match existing {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => new_correlation_id(),
    }
}

/// `decisionId = "dec_{epochMs}_{8hex}"`, used on every audit trail entry.
pub fn new_decision_id() -> String {
    let epoch_ms = chrono::Utc::now().timestamp_millis();
    let hex = Uuid::new_v4().simple().to_string();
    format!("dec_{epoch_ms}_{}", &hex[..8])
}
