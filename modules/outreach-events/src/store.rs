//! EventStore: append-only journal backed by Postgres.

use anyhow::Result;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::types::{AppendEvent, StoredEvent};

const COLUMNS: &str = "seq, ts, event_type, subject_id, actor, payload, schema_v";

#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a fact and return it as stored (with seq and ts from Postgres).
    pub async fn append(&self, event: AppendEvent) -> Result<StoredEvent> {
        let stored = sqlx::query_as::<_, StoredEvent>(&format!(
            r#"
            INSERT INTO events (event_type, subject_id, actor, payload, schema_v)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&event.event_type)
        .bind(event.subject_id)
        .bind(&event.actor)
        .bind(&event.payload)
        .bind(event.schema_v)
        .fetch_one(&self.pool)
        .await
        .inspect_err(|e| {
            warn!(
                event_type = %event.event_type,
                subject_id = ?event.subject_id,
                error = %e,
                "Failed to append event"
            )
        })?;

        Ok(stored)
    }

    /// Read facts about one subject (enrollment, lead, company), oldest first.
    pub async fn read_by_subject(&self, subject_id: Uuid) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEvent>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM events
            WHERE subject_id = $1
            ORDER BY seq ASC
            "#
        ))
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
