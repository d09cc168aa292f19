//! Dynamic Consistency Boundary: a scope-versioned, multi-stream
//! optimistic concurrency primitive for operations that must atomically
//! reason across several streams (e.g. "reserve across three products"),
//! in the same OCC idiom the event store uses for a single stream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::event_store::{Event, EventStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeCheck {
    Match,
    Mismatch { current: u32 },
    NotFound,
}

#[derive(Debug, Clone)]
pub struct DcbScope {
    pub scope_key: String,
    pub current_version: u32,
    pub stream_ids: HashSet<String>,
}

fn scope_key(tenant_id: &str, scope_type: &str, scope_id: &str) -> String {
    format!("tenant:{tenant_id}:{scope_type}:{scope_id}")
}

#[derive(Default)]
struct Inner {
    scopes: HashMap<String, DcbScope>,
}

/// In-process DCB scope engine.
pub struct DcbScopeEngine {
    inner: Arc<RwLock<Inner>>,
    event_store: Arc<dyn EventStore>,
}

impl DcbScopeEngine {
    pub fn new(event_store: Arc<dyn EventStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            event_store,
        }
    }

    pub async fn get_or_create_scope(&self, key: &str) -> DcbScope {
        let mut inner = self.inner.write().await;
        inner
            .scopes
            .entry(key.to_string())
            .or_insert_with(|| DcbScope {
                scope_key: key.to_string(),
                current_version: 0,
                stream_ids: HashSet::new(),
            })
            .clone()
    }

    pub async fn check_scope_version(&self, key: &str, expected: u32) -> ScopeCheck {
        let inner = self.inner.read().await;
        match inner.scopes.get(key) {
            None => ScopeCheck::NotFound,
            Some(scope) if scope.current_version == expected => ScopeCheck::Match,
            Some(scope) => ScopeCheck::Mismatch {
                current: scope.current_version,
            },
        }
    }

    /// OCC on `expected_version`; on success bumps the version and
    /// union-merges `stream_ids`. Scope creation (`expected_version == 0`
    /// on an absent scope) inserts at version 1.
    pub async fn commit_scope(
        &self,
        key: &str,
        expected_version: u32,
        stream_ids: &[String],
    ) -> ScopeCheck {
        let mut inner = self.inner.write().await;
        match inner.scopes.get_mut(key) {
            None => {
                if expected_version != 0 {
                    return ScopeCheck::Mismatch { current: 0 };
                }
                inner.scopes.insert(
                    key.to_string(),
                    DcbScope {
                        scope_key: key.to_string(),
                        current_version: 1,
                        stream_ids: stream_ids.iter().cloned().collect(),
                    },
                );
                ScopeCheck::Match
            }
            Some(scope) => {
                if scope.current_version != expected_version {
                    return ScopeCheck::Mismatch {
                        current: scope.current_version,
                    };
                }
                scope.current_version += 1;
                scope.stream_ids.extend(stream_ids.iter().cloned());
                ScopeCheck::Match
            }
        }
    }

    /// Aggregates events from every stream in the scope, in
    /// `global_position` order, bounded by `limit`.
    pub async fn read_virtual_stream(
        &self,
        key: &str,
        from_global_position: i64,
        limit: usize,
    ) -> Vec<Event> {
        let scope = {
            let inner = self.inner.read().await;
            match inner.scopes.get(key) {
                Some(scope) => scope.clone(),
                None => return Vec::new(),
            }
        };

        let mut events = Vec::new();
        for stream_id in &scope.stream_ids {
            if let Ok(stream_events) = self.event_store.read_stream("dcb", stream_id).await {
                events.extend(
                    stream_events
                        .into_iter()
                        .filter(|e| e.global_position > from_global_position),
                );
            }
        }
        events.sort_by_key(|e| e.global_position);
        events.truncate(limit);
        events
    }
}

pub fn build_scope_key(tenant_id: &str, scope_type: &str, scope_id: &str) -> String {
    scope_key(tenant_id, scope_type, scope_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::memory::InMemoryEventStore;

    #[tokio::test]
    async fn scope_starts_at_version_zero_and_is_created_lazily() {
        let engine = DcbScopeEngine::new(Arc::new(InMemoryEventStore::new()));
        let key = build_scope_key("t1", "reservation", "r1");
        let scope = engine.get_or_create_scope(&key).await;
        assert_eq!(scope.current_version, 0);
    }

    #[tokio::test]
    async fn commit_on_fresh_scope_bumps_to_version_one() {
        let engine = DcbScopeEngine::new(Arc::new(InMemoryEventStore::new()));
        let key = build_scope_key("t1", "reservation", "r1");

        let result = engine.commit_scope(&key, 0, &["product:1".to_string()]).await;
        assert_eq!(result, ScopeCheck::Match);

        let check = engine.check_scope_version(&key, 1).await;
        assert_eq!(check, ScopeCheck::Match);
    }

    #[tokio::test]
    async fn concurrent_commit_at_stale_version_is_detected() {
        let engine = DcbScopeEngine::new(Arc::new(InMemoryEventStore::new()));
        let key = build_scope_key("t1", "reservation", "r1");
        engine.commit_scope(&key, 0, &[]).await;

        let result = engine.commit_scope(&key, 0, &[]).await;
        assert_eq!(result, ScopeCheck::Mismatch { current: 1 });
    }

    #[tokio::test]
    async fn stream_ids_union_merge_across_commits() {
        let engine = DcbScopeEngine::new(Arc::new(InMemoryEventStore::new()));
        let key = build_scope_key("t1", "reservation", "r1");
        engine.commit_scope(&key, 0, &["a".to_string()]).await;
        engine.commit_scope(&key, 1, &["b".to_string()]).await;

        let scope = engine.get_or_create_scope(&key).await;
        assert_eq!(scope.stream_ids.len(), 2);
    }
}
