use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use outreach_common::{EngagementSequence, Result, SequenceStep, SequencerError};

use super::SequenceCatalog;

#[derive(Clone)]
pub struct PgSequenceCatalog {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct SequenceRow {
    id: Uuid,
    company_id: Uuid,
    version: i32,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    position: i32,
    action_kind: String,
    delay_after_previous_secs: i64,
    action_payload: serde_json::Value,
}

impl TryFrom<StepRow> for SequenceStep {
    type Error = SequencerError;

    fn try_from(row: StepRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            position: u32::try_from(row.position).unwrap_or(0),
            action_kind: row.action_kind.parse()?,
            delay_after_previous_secs: u64::try_from(row.delay_after_previous_secs).unwrap_or(0),
            action_payload: row.action_payload,
        })
    }
}

impl PgSequenceCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn hydrate(&self, row: SequenceRow) -> Result<EngagementSequence> {
        let steps = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, position, action_kind, delay_after_previous_secs, action_payload
            FROM sequence_steps
            WHERE sequence_id = $1 AND sequence_version = $2
            ORDER BY position ASC
            "#,
        )
        .bind(row.id)
        .bind(row.version)
        .fetch_all(&self.pool)
        .await?;

        Ok(EngagementSequence {
            id: row.id,
            company_id: row.company_id,
            version: u32::try_from(row.version).unwrap_or(0),
            is_active: row.is_active,
            steps: steps
                .into_iter()
                .map(SequenceStep::try_from)
                .collect::<Result<_>>()?,
        })
    }
}

#[async_trait]
impl SequenceCatalog for PgSequenceCatalog {
    async fn publish(&self, mut sequence: EngagementSequence) -> Result<EngagementSequence> {
        sequence.normalize()?;
        let mut tx = self.pool.begin().await?;

        // Serialize concurrent publishes of the same id.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(sequence.id)
            .execute(&mut *tx)
            .await?;

        let previous = sqlx::query_as::<_, (i32, bool)>(
            r#"
            SELECT version, is_active
            FROM engagement_sequences
            WHERE id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(sequence.id)
        .fetch_optional(&mut *tx)
        .await?;

        let (version, is_active) = match previous {
            Some((v, active)) => (v + 1, active),
            None => (1, true),
        };

        sqlx::query(
            r#"
            INSERT INTO engagement_sequences (id, version, company_id, is_active)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(sequence.id)
        .bind(version)
        .bind(sequence.company_id)
        .bind(is_active)
        .execute(&mut *tx)
        .await?;

        for step in &sequence.steps {
            sqlx::query(
                r#"
                INSERT INTO sequence_steps (
                    id, sequence_id, sequence_version, position, action_kind,
                    delay_after_previous_secs, action_payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(step.id)
            .bind(sequence.id)
            .bind(version)
            .bind(step.position as i32)
            .bind(step.action_kind.as_str())
            .bind(i64::try_from(step.delay_after_previous_secs).unwrap_or(i64::MAX))
            .bind(&step.action_payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        sequence.version = u32::try_from(version).unwrap_or(0);
        sequence.is_active = is_active;
        Ok(sequence)
    }

    async fn version(&self, sequence_id: Uuid, version: u32) -> Result<Option<EngagementSequence>> {
        let row = sqlx::query_as::<_, SequenceRow>(
            r#"
            SELECT id, company_id, version, is_active
            FROM engagement_sequences
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(sequence_id)
        .bind(version as i32)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn latest(&self, sequence_id: Uuid) -> Result<Option<EngagementSequence>> {
        let row = sqlx::query_as::<_, SequenceRow>(
            r#"
            SELECT id, company_id, version, is_active
            FROM engagement_sequences
            WHERE id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(sequence_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn set_active(&self, sequence_id: Uuid, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE engagement_sequences SET is_active = $2 WHERE id = $1")
            .bind(sequence_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_sequences(&self, company_id: Uuid) -> Result<Vec<EngagementSequence>> {
        let rows = sqlx::query_as::<_, SequenceRow>(
            r#"
            SELECT DISTINCT ON (id) id, company_id, version, is_active
            FROM engagement_sequences
            WHERE company_id = $1
            ORDER BY id, version DESC
            "#,
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;

        let mut sequences = Vec::new();
        for row in rows.into_iter().filter(|r| r.is_active) {
            sequences.push(self.hydrate(row).await?);
        }
        Ok(sequences)
    }
}
