//! Projection Engine: idempotent read-model updates via per-partition
//! checkpoints, with dead-letter and poison-event quarantine on repeated
//! failure. A plain in-process handler keyed by event type, not a
//! separately addressable service.

pub mod checkpoint;
pub mod poison;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::event_store::Event;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore};
pub use poison::{DeadLetterRecord, DeadLetterStore, InMemoryPoisonStore, PoisonStatus, PoisonStore};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("projection handler failed: {0}")]
    Failed(String),
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, ProjectionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionCategory {
    View,
    Integration,
    Logic,
    Reporting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionType {
    Primary,
    Secondary,
    CrossContext,
}

/// A single `(eventType -> handler)` mapping registered under one
/// `projectionName`.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    /// Apply one event to the read model. Must be idempotent: callers
    /// guarantee this is invoked at most meaningfully-once per event via
    /// [`checkpoint::with_checkpoint`], but a handler that is re-invoked
    /// after a crash mid-write must tolerate re-application.
    async fn handle(&self, event: &Event) -> Result<()>;

    /// Derive the partition key this event serializes under (e.g.
    /// `orderId`), guaranteeing per-entity ordering under the workpool.
    fn partition_key(&self, event: &Event) -> String {
        event.stream_id.clone()
    }
}

/// Static registration of one projection: its category/type, owning
/// bounded context, and per-event-type handlers.
pub struct ProjectionDefinition {
    pub name: String,
    pub category: ProjectionCategory,
    pub projection_type: ProjectionType,
    pub bounded_context: String,
    pub handlers: HashMap<String, Arc<dyn ProjectionHandler>>,
}

impl ProjectionDefinition {
    pub fn handler_for(&self, event_type: &str) -> Option<Arc<dyn ProjectionHandler>> {
        self.handlers.get(event_type).cloned()
    }
}

/// Registry of all projections, supporting lookups by event type,
/// context, and category, plus rebuild ordering.
#[derive(Default)]
pub struct ProjectionRegistry {
    definitions: HashMap<String, Arc<ProjectionDefinition>>,
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ProjectionDefinition) {
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProjectionDefinition>> {
        self.definitions.get(name).cloned()
    }

    pub fn get_by_event_type(&self, event_type: &str) -> Vec<Arc<ProjectionDefinition>> {
        self.definitions
            .values()
            .filter(|d| d.handlers.contains_key(event_type))
            .cloned()
            .collect()
    }

    pub fn get_by_context(&self, bounded_context: &str) -> Vec<Arc<ProjectionDefinition>> {
        self.definitions
            .values()
            .filter(|d| d.bounded_context == bounded_context)
            .cloned()
            .collect()
    }

    pub fn get_by_category(&self, category: ProjectionCategory) -> Vec<Arc<ProjectionDefinition>> {
        self.definitions
            .values()
            .filter(|d| d.category == category)
            .cloned()
            .collect()
    }

    /// Primary projections first, then secondary, then cross-context.
    pub fn get_rebuild_order(&self) -> Vec<Arc<ProjectionDefinition>> {
        let mut ordered: Vec<Arc<ProjectionDefinition>> = self.definitions.values().cloned().collect();
        ordered.sort_by_key(|d| match d.projection_type {
            ProjectionType::Primary => 0,
            ProjectionType::Secondary => 1,
            ProjectionType::CrossContext => 2,
        });
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;
    #[async_trait]
    impl ProjectionHandler for NoopHandler {
        async fn handle(&self, _event: &Event) -> Result<()> {
            Ok(())
        }
    }

    fn definition(name: &str, projection_type: ProjectionType) -> ProjectionDefinition {
        let mut handlers: HashMap<String, Arc<dyn ProjectionHandler>> = HashMap::new();
        handlers.insert("OrderCreated".to_string(), Arc::new(NoopHandler));
        ProjectionDefinition {
            name: name.to_string(),
            category: ProjectionCategory::View,
            projection_type,
            bounded_context: "orders".to_string(),
            handlers,
        }
    }

    #[test]
    fn rebuild_order_is_primary_then_secondary_then_cross_context() {
        let mut registry = ProjectionRegistry::new();
        registry.register(definition("cross", ProjectionType::CrossContext));
        registry.register(definition("primary", ProjectionType::Primary));
        registry.register(definition("secondary", ProjectionType::Secondary));

        let order: Vec<String> = registry
            .get_rebuild_order()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(order, vec!["primary", "secondary", "cross"]);
    }

    #[test]
    fn lookup_by_event_type_matches_registered_handlers_only() {
        let mut registry = ProjectionRegistry::new();
        registry.register(definition("summary", ProjectionType::Primary));

        assert_eq!(registry.get_by_event_type("OrderCreated").len(), 1);
        assert_eq!(registry.get_by_event_type("OrderShipped").len(), 0);
    }
}
