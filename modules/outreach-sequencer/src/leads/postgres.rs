use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use outreach_common::{
    Enrollment, EnrollmentReason, EnrollmentStatus, Lead, Result, SequencerError,
};

use super::LeadStore;

const ENROLLMENT_COLUMNS: &str = "id, lead_id, company_id, sequence_id, sequence_version, cursor, \
     status, reason, next_fire_time, attempts, last_evaluated_at, enrolled_at, updated_at, revision";

/// Postgres lead state. The partial unique index on `enrollments(lead_id)`
/// for open statuses backs the one-open-enrollment rule; revisions back
/// optimistic writes.
#[derive(Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_enrollments(
        &self,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, EnrollmentRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Enrollment>> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Enrollment::try_from).collect()
    }
}

fn select_enrollments(filter: &str) -> String {
    format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE {filter}")
}

#[derive(sqlx::FromRow)]
struct LeadRow {
    id: Uuid,
    company_id: Uuid,
    temperature: String,
    reply_count: i32,
    last_replied_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LeadRow> for Lead {
    type Error = SequencerError;

    fn try_from(row: LeadRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            company_id: row.company_id,
            temperature: row.temperature.parse()?,
            reply_count: u32::try_from(row.reply_count).unwrap_or(0),
            last_replied_at: row.last_replied_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    lead_id: Uuid,
    company_id: Uuid,
    sequence_id: Uuid,
    sequence_version: i32,
    cursor: i32,
    status: String,
    reason: Option<sqlx::types::Json<EnrollmentReason>>,
    next_fire_time: Option<DateTime<Utc>>,
    attempts: i32,
    last_evaluated_at: Option<DateTime<Utc>>,
    enrolled_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    revision: i64,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = SequencerError;

    fn try_from(row: EnrollmentRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            lead_id: row.lead_id,
            company_id: row.company_id,
            sequence_id: row.sequence_id,
            sequence_version: u32::try_from(row.sequence_version).unwrap_or(0),
            cursor: u32::try_from(row.cursor).unwrap_or(0),
            status: row.status.parse()?,
            reason: row.reason.map(|r| r.0),
            next_fire_time: row.next_fire_time,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_evaluated_at: row.last_evaluated_at,
            enrolled_at: row.enrolled_at,
            updated_at: row.updated_at,
            revision: u64::try_from(row.revision).unwrap_or(0),
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == "23505")
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO leads (id, company_id, temperature, reply_count, last_replied_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                temperature = EXCLUDED.temperature,
                reply_count = EXCLUDED.reply_count,
                last_replied_at = EXCLUDED.last_replied_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(lead.id)
        .bind(lead.company_id)
        .bind(lead.temperature.as_str())
        .bind(i32::try_from(lead.reply_count).unwrap_or(i32::MAX))
        .bind(lead.last_replied_at)
        .bind(lead.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lead(&self, lead_id: Uuid) -> Result<Option<Lead>> {
        let row = sqlx::query_as::<_, LeadRow>(
            r#"
            SELECT id, company_id, temperature, reply_count, last_replied_at, updated_at
            FROM leads
            WHERE id = $1
            "#,
        )
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Lead::try_from).transpose()
    }

    async fn insert_enrollment(&self, enrollment: Enrollment) -> Result<Enrollment> {
        let result = sqlx::query(
            r#"
            INSERT INTO enrollments (
                id, lead_id, company_id, sequence_id, sequence_version, cursor, status, reason,
                next_fire_time, attempts, last_evaluated_at, enrolled_at, updated_at, revision
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.lead_id)
        .bind(enrollment.company_id)
        .bind(enrollment.sequence_id)
        .bind(enrollment.sequence_version as i32)
        .bind(enrollment.cursor as i32)
        .bind(enrollment.status.as_str())
        .bind(enrollment.reason.clone().map(sqlx::types::Json))
        .bind(enrollment.next_fire_time)
        .bind(enrollment.attempts as i32)
        .bind(enrollment.last_evaluated_at)
        .bind(enrollment.enrolled_at)
        .bind(enrollment.updated_at)
        .bind(enrollment.revision as i64)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(enrollment),
            Err(e) if is_unique_violation(&e) => Err(SequencerError::AlreadyEnrolled {
                lead_id: enrollment.lead_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>> {
        let sql = select_enrollments("id = $1");
        let rows = self
            .fetch_enrollments(sqlx::query_as(&sql).bind(enrollment_id))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn open_enrollment_for_lead(&self, lead_id: Uuid) -> Result<Option<Enrollment>> {
        let sql = select_enrollments("lead_id = $1 AND status IN ('active', 'paused') LIMIT 1");
        let rows = self
            .fetch_enrollments(sqlx::query_as(&sql).bind(lead_id))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn due_enrollments(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>> {
        let sql = select_enrollments(
            "status = 'active' \
             AND next_fire_time <= $1 \
             AND (last_evaluated_at IS NULL OR last_evaluated_at < $1) \
             ORDER BY next_fire_time ASC, id ASC \
             LIMIT $2",
        );
        self.fetch_enrollments(sqlx::query_as(&sql).bind(now).bind(limit as i64))
            .await
    }

    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<Enrollment> {
        let sql = format!(
            r#"
            UPDATE enrollments SET
                cursor = $3,
                status = $4,
                reason = $5,
                next_fire_time = $6,
                attempts = $7,
                last_evaluated_at = $8,
                updated_at = $9,
                revision = revision + 1
            WHERE id = $1 AND revision = $2
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, EnrollmentRow>(&sql)
            .bind(enrollment.id)
            .bind(enrollment.revision as i64)
            .bind(enrollment.cursor as i32)
            .bind(enrollment.status.as_str())
            .bind(enrollment.reason.clone().map(sqlx::types::Json))
            .bind(enrollment.next_fire_time)
            .bind(enrollment.attempts as i32)
            .bind(enrollment.last_evaluated_at)
            .bind(enrollment.updated_at)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => match self.enrollment(enrollment.id).await? {
                Some(_) => Err(SequencerError::ConcurrentModification {
                    enrollment_id: enrollment.id,
                }),
                None => Err(SequencerError::not_found("enrollment", enrollment.id)),
            },
        }
    }

    async fn company_enrollments(
        &self,
        company_id: Uuid,
        status: EnrollmentStatus,
    ) -> Result<Vec<Enrollment>> {
        let sql = select_enrollments("company_id = $1 AND status = $2 ORDER BY id ASC");
        self.fetch_enrollments(sqlx::query_as(&sql).bind(company_id).bind(status.as_str()))
            .await
    }

    async fn open_enrollments_for_sequence(&self, sequence_id: Uuid) -> Result<Vec<Enrollment>> {
        let sql =
            select_enrollments("sequence_id = $1 AND status IN ('active', 'paused') ORDER BY id ASC");
        self.fetch_enrollments(sqlx::query_as(&sql).bind(sequence_id))
            .await
    }
}
