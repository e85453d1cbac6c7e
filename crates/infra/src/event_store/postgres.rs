//! Postgres-backed event store.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE events (
//!     event_id        UUID PRIMARY KEY,
//!     aggregate_id    UUID NOT NULL,
//!     aggregate_type  TEXT NOT NULL,
//!     sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
//!     event_type      TEXT NOT NULL,
//!     event_version   INT NOT NULL,
//!     occurred_at     TIMESTAMPTZ NOT NULL,
//!     recorded_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     payload         JSONB NOT NULL,
//!     UNIQUE (aggregate_id, sequence_number)
//! );
//! ```
//!
//! The unique constraint on `(aggregate_id, sequence_number)` is the
//! optimistic-concurrency backstop: two concurrent appends at the same
//! version race to insert the same sequence number and the loser fails
//! with a unique violation, surfaced as `EventStoreError::Concurrency`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use billflow_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Postgres-backed append-only event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();
        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence_number), 0) AS version,
                   MIN(aggregate_type) AS aggregate_type
            FROM events
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("version check", e))?;

        let current: i64 = row.get("version");
        let current = current as u64;
        if let Some(existing) = row.get::<Option<String>, _>("aggregate_type")
            && existing != aggregate_type
        {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
            )));
        }

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        let recorded_at = Utc::now();
        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id, aggregate_id, aggregate_type, sequence_number,
                    event_type, event_version, occurred_at, recorded_at, payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(e.event_id)
            .bind(e.aggregate_id.as_uuid())
            .bind(&e.aggregate_type)
            .bind(next as i64)
            .bind(&e.event_type)
            .bind(e.event_version as i32)
            .bind(e.occurred_at)
            .bind(recorded_at)
            .bind(&e.payload)
            .execute(&mut *tx)
            .await
            .map_err(|err| map_sqlx_error("insert", err))?;

            committed.push(StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                recorded_at,
                payload: e.payload,
            });
            next += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(committed)
    }

    async fn load_stream(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, aggregate_id, aggregate_type, sequence_number,
                   event_type, event_version, occurred_at, recorded_at, payload
            FROM events
            WHERE aggregate_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        Ok(rows.iter().map(row_to_stored).collect())
    }

    async fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, aggregate_id, aggregate_type, sequence_number,
                   event_type, event_version, occurred_at, recorded_at, payload
            FROM events
            ORDER BY aggregate_id, sequence_number ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_all", e))?;

        Ok(rows.iter().map(row_to_stored).collect())
    }
}

fn row_to_stored(row: &sqlx::postgres::PgRow) -> StoredEvent {
    StoredEvent {
        event_id: row.get::<Uuid, _>("event_id"),
        aggregate_id: AggregateId::from_uuid(row.get::<Uuid, _>("aggregate_id")),
        aggregate_type: row.get("aggregate_type"),
        sequence_number: row.get::<i64, _>("sequence_number") as u64,
        event_type: row.get("event_type"),
        event_version: row.get::<i32, _>("event_version") as u32,
        occurred_at: row.get::<DateTime<Utc>, _>("occurred_at"),
        recorded_at: row.get::<DateTime<Utc>, _>("recorded_at"),
        payload: row.get("payload"),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    if let sqlx::Error::Database(db) = &err {
        // 23505 = unique violation: a concurrent append won the race.
        if db.code().as_deref() == Some("23505") {
            return EventStoreError::Concurrency(format!(
                "concurrent append detected during {operation}"
            ));
        }
    }
    EventStoreError::Backend(format!("{operation} failed: {err}"))
}
