//! SQLite implementation of [`EventStore`], using sea-query for statement
//! building and sqlx for execution (same split as the in-memory/SQLite
//! pairing this runtime's storage layer follows throughout).

use async_trait::async_trait;
use sea_query::{Expr, Iden, Order, Query, SqliteQueryBuilder};
use sqlx::{Acquire, Row, SqlitePool};

use super::{
    global_position, resolve_correlation_id, AppendOutcome, Event, EventCategory, EventMetadata,
    EventStore, NewEvent, Result, StoreError,
};
use crate::ids;

#[derive(Iden)]
enum Events {
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "event_type"]
    EventType,
    #[iden = "stream_type"]
    StreamType,
    #[iden = "stream_id"]
    StreamId,
    #[iden = "version"]
    Version,
    #[iden = "global_position"]
    GlobalPosition,
    #[iden = "bounded_context"]
    BoundedContext,
    #[iden = "category"]
    Category,
    #[iden = "schema_version"]
    SchemaVersion,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "causation_id"]
    CausationId,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "payload"]
    Payload,
    #[iden = "metadata"]
    Metadata,
    #[iden = "idempotency_key"]
    IdempotencyKey,
}

const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    stream_type TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    global_position INTEGER NOT NULL,
    bounded_context TEXT NOT NULL,
    category TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    correlation_id TEXT NOT NULL,
    causation_id TEXT,
    created_at TEXT NOT NULL,
    payload TEXT NOT NULL,
    metadata TEXT,
    idempotency_key TEXT,
    PRIMARY KEY (stream_type, stream_id, version)
);

CREATE INDEX IF NOT EXISTS idx_events_global_position ON events(global_position);
CREATE INDEX IF NOT EXISTS idx_events_correlation ON events(correlation_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_idempotency_key
    ON events(idempotency_key) WHERE idempotency_key IS NOT NULL;
"#;

/// SQLite-backed [`EventStore`].
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the events table if it does not already exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_EVENTS_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event> {
        let category: String = row.get("category");
        let category = match category.as_str() {
            "domain" => EventCategory::Domain,
            "integration" => EventCategory::Integration,
            "trigger" => EventCategory::Trigger,
            "fat" => EventCategory::Fat,
            other => return Err(StoreError::Backend(format!("unknown category {other}"))),
        };
        let payload: String = row.get("payload");
        let payload: serde_json::Value = serde_json::from_str(&payload)?;
        let metadata: Option<String> = row.get("metadata");
        let metadata = metadata
            .map(|m| serde_json::from_str::<EventMetadata>(&m))
            .transpose()?;
        let created_at: String = row.get("created_at");
        let timestamp = chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| StoreError::Backend(format!("bad timestamp: {e}")))?;

        Ok(Event {
            event_id: row.get("event_id"),
            event_type: row.get("event_type"),
            stream_type: row.get("stream_type"),
            stream_id: row.get("stream_id"),
            version: row.get::<i64, _>("version") as u32,
            global_position: row.get("global_position"),
            bounded_context: row.get("bounded_context"),
            category,
            schema_version: row.get::<i64, _>("schema_version") as u32,
            correlation_id: row.get("correlation_id"),
            causation_id: row.get("causation_id"),
            timestamp,
            payload,
            metadata,
            idempotency_key: row.get("idempotency_key"),
        })
    }
}

fn category_str(category: EventCategory) -> &'static str {
    match category {
        EventCategory::Domain => "domain",
        EventCategory::Integration => "integration",
        EventCategory::Trigger => "trigger",
        EventCategory::Fat => "fat",
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append_to_stream(
        &self,
        stream_type: &str,
        stream_id: &str,
        expected_version: u32,
        bounded_context: &str,
        events: Vec<NewEvent>,
    ) -> Result<AppendOutcome> {
        if events.is_empty() {
            let version = self.get_stream_version(stream_type, stream_id).await?;
            return Ok(AppendOutcome::Success {
                event_ids: vec![],
                global_positions: vec![],
                new_version: version,
            });
        }

        if events.len() == 1 {
            if let Some(key) = events[0].idempotency_key.as_deref() {
                if let Some(existing) = self.get_by_idempotency_key(key).await? {
                    return Ok(AppendOutcome::Success {
                        event_ids: vec![existing.event_id],
                        global_positions: vec![existing.global_position],
                        new_version: existing.version,
                    });
                }
            }
        }

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let current_version = {
            let query = Query::select()
                .expr(Expr::col(Events::Version).max())
                .from(Events::Table)
                .and_where(Expr::col(Events::StreamType).eq(stream_type))
                .and_where(Expr::col(Events::StreamId).eq(stream_id))
                .to_string(SqliteQueryBuilder);

            let row = sqlx::query(&query).fetch_optional(&mut *tx).await?;
            row.and_then(|r| r.get::<Option<i64>, _>(0))
                .map(|v| v as u32)
                .unwrap_or(0)
        };

        if current_version != expected_version {
            tx.rollback().await?;
            return Ok(AppendOutcome::Conflict { current_version });
        }

        let now = chrono::Utc::now();
        let mut event_ids = Vec::with_capacity(events.len());
        let mut global_positions = Vec::with_capacity(events.len());
        let mut version = current_version;

        for mut new_event in events {
            version += 1;
            let correlation_id = resolve_correlation_id(&mut new_event.metadata);
            let causation_id = new_event
                .metadata
                .as_ref()
                .and_then(|m| m.causation_id.clone());
            let event_id = ids::new_id();
            let position = global_position(now.timestamp_millis(), stream_type, stream_id, version);
            let payload = serde_json::to_string(&new_event.payload)?;
            let metadata = new_event
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let query = Query::insert()
                .into_table(Events::Table)
                .columns([
                    Events::EventId,
                    Events::EventType,
                    Events::StreamType,
                    Events::StreamId,
                    Events::Version,
                    Events::GlobalPosition,
                    Events::BoundedContext,
                    Events::Category,
                    Events::SchemaVersion,
                    Events::CorrelationId,
                    Events::CausationId,
                    Events::CreatedAt,
                    Events::Payload,
                    Events::Metadata,
                    Events::IdempotencyKey,
                ])
                .values_panic([
                    event_id.clone().into(),
                    new_event.event_type.into(),
                    stream_type.into(),
                    stream_id.into(),
                    version.into(),
                    position.into(),
                    bounded_context.into(),
                    category_str(new_event.category).into(),
                    new_event.schema_version.into(),
                    correlation_id.into(),
                    causation_id.into(),
                    now.to_rfc3339().into(),
                    payload.into(),
                    metadata.into(),
                    new_event.idempotency_key.into(),
                ])
                .to_string(SqliteQueryBuilder);

            sqlx::query(&query).execute(&mut *tx).await?;

            event_ids.push(event_id);
            global_positions.push(position);
        }

        tx.commit().await?;

        Ok(AppendOutcome::Success {
            event_ids,
            global_positions,
            new_version: version,
        })
    }

    async fn read_stream(&self, stream_type: &str, stream_id: &str) -> Result<Vec<Event>> {
        self.read_stream_from(stream_type, stream_id, 1).await
    }

    async fn read_stream_from(
        &self,
        stream_type: &str,
        stream_id: &str,
        from_version: u32,
    ) -> Result<Vec<Event>> {
        let query = Query::select()
            .columns([
                Events::EventId,
                Events::EventType,
                Events::StreamType,
                Events::StreamId,
                Events::Version,
                Events::GlobalPosition,
                Events::BoundedContext,
                Events::Category,
                Events::SchemaVersion,
                Events::CorrelationId,
                Events::CausationId,
                Events::CreatedAt,
                Events::Payload,
                Events::Metadata,
                Events::IdempotencyKey,
            ])
            .from(Events::Table)
            .and_where(Expr::col(Events::StreamType).eq(stream_type))
            .and_where(Expr::col(Events::StreamId).eq(stream_id))
            .and_where(Expr::col(Events::Version).gte(from_version))
            .order_by(Events::Version, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn get_stream_version(&self, stream_type: &str, stream_id: &str) -> Result<u32> {
        let query = Query::select()
            .expr(Expr::col(Events::Version).max())
            .from(Events::Table)
            .and_where(Expr::col(Events::StreamType).eq(stream_type))
            .and_where(Expr::col(Events::StreamId).eq(stream_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row
            .and_then(|r| r.get::<Option<i64>, _>(0))
            .map(|v| v as u32)
            .unwrap_or(0))
    }

    async fn read_from_position(
        &self,
        from_position: i64,
        limit: usize,
        event_types: Option<&[String]>,
        bounded_context: Option<&str>,
    ) -> Result<Vec<Event>> {
        // Over-fetch unfiltered rows, then apply event-type/bounded-context
        // filtering in-process, matching the store's documented contract.
        let mut select = Query::select();
        select
            .columns([
                Events::EventId,
                Events::EventType,
                Events::StreamType,
                Events::StreamId,
                Events::Version,
                Events::GlobalPosition,
                Events::BoundedContext,
                Events::Category,
                Events::SchemaVersion,
                Events::CorrelationId,
                Events::CausationId,
                Events::CreatedAt,
                Events::Payload,
                Events::Metadata,
                Events::IdempotencyKey,
            ])
            .from(Events::Table)
            .and_where(Expr::col(Events::GlobalPosition).gt(from_position))
            .order_by(Events::GlobalPosition, Order::Asc)
            .limit((limit as u64).saturating_mul(4).max(limit as u64));

        let query = select.to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut matched = Vec::new();
        for row in &rows {
            let event = Self::row_to_event(row)?;
            if let Some(types) = event_types {
                if !types.iter().any(|t| t == &event.event_type) {
                    continue;
                }
            }
            if let Some(bc) = bounded_context {
                if bc != event.bounded_context {
                    continue;
                }
            }
            matched.push(event);
            if matched.len() >= limit {
                break;
            }
        }
        Ok(matched)
    }

    async fn get_by_correlation(&self, correlation_id: &str) -> Result<Vec<Event>> {
        let query = Query::select()
            .columns([
                Events::EventId,
                Events::EventType,
                Events::StreamType,
                Events::StreamId,
                Events::Version,
                Events::GlobalPosition,
                Events::BoundedContext,
                Events::Category,
                Events::SchemaVersion,
                Events::CorrelationId,
                Events::CausationId,
                Events::CreatedAt,
                Events::Payload,
                Events::Metadata,
                Events::IdempotencyKey,
            ])
            .from(Events::Table)
            .and_where(Expr::col(Events::CorrelationId).eq(correlation_id))
            .order_by(Events::GlobalPosition, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Event>> {
        let query = Query::select()
            .columns([
                Events::EventId,
                Events::EventType,
                Events::StreamType,
                Events::StreamId,
                Events::Version,
                Events::GlobalPosition,
                Events::BoundedContext,
                Events::Category,
                Events::SchemaVersion,
                Events::CorrelationId,
                Events::CausationId,
                Events::CreatedAt,
                Events::Payload,
                Events::Metadata,
                Events::IdempotencyKey,
            ])
            .from(Events::Table)
            .and_where(Expr::col(Events::IdempotencyKey).eq(key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn max_global_position(&self) -> Result<i64> {
        let query = Query::select()
            .expr(Expr::col(Events::GlobalPosition).max())
            .from(Events::Table)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.and_then(|r| r.get::<Option<i64>, _>(0)).unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteEventStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteEventStore::new(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn append_and_read_round_trips_payload() {
        let store = store().await;
        let event = NewEvent::new("OrderCreated", json!({"total": 42}));
        store
            .append_to_stream("order", "o1", 0, "orders", vec![event])
            .await
            .unwrap();

        let events = store.read_stream("order", "o1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["total"], 42);
        assert_eq!(events[0].version, 1);
    }

    #[tokio::test]
    async fn occ_conflict_on_stale_expected_version() {
        let store = store().await;
        store
            .append_to_stream(
                "order",
                "o1",
                0,
                "orders",
                vec![NewEvent::new("OrderCreated", json!({}))],
            )
            .await
            .unwrap();

        let outcome = store
            .append_to_stream(
                "order",
                "o1",
                0,
                "orders",
                vec![NewEvent::new("OrderItemAdded", json!({}))],
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            AppendOutcome::Conflict { current_version: 1 }
        ));
    }

    #[tokio::test]
    async fn idempotency_key_short_circuits_duplicate_append() {
        let store = store().await;
        let event = NewEvent::new("OrderCreated", json!({})).with_idempotency_key("cmd-1");

        let first = store
            .append_to_stream("order", "o1", 0, "orders", vec![event.clone()])
            .await
            .unwrap();
        let second = store
            .append_to_stream("order", "o1", 0, "orders", vec![event])
            .await
            .unwrap();

        match (first, second) {
            (
                AppendOutcome::Success { event_ids: a, .. },
                AppendOutcome::Success { event_ids: b, .. },
            ) => assert_eq!(a, b),
            _ => panic!("expected both to succeed"),
        }
    }
}
