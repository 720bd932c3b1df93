//! Postgres-backed ledger. The conditional `UPDATE` on the company row takes
//! a row lock, which serializes reservations per company.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use outreach_common::{Company, CreditReason, CreditTransaction, Result, SequencerError};

use super::{CreditLedger, Reservation};

#[derive(Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    company_id: Uuid,
    amount: i64,
    reason: String,
    enrollment_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = SequencerError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            company_id: row.company_id,
            amount: row.amount,
            reason: row.reason.parse()?,
            enrollment_id: row.enrollment_id,
            created_at: row.created_at,
        })
    }
}

fn signed(amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| anyhow!("credit amount {amount} out of range").into())
}

fn unsigned(balance: i64) -> u64 {
    u64::try_from(balance).unwrap_or(0)
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Return credits held by reservations that were never finalized (e.g. the
    /// process died mid-step). Returns how many reservations were swept.
    pub async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let stale = sqlx::query_as::<_, (Uuid, i64)>(
            r#"
            DELETE FROM credit_reservations
            WHERE created_at < $1
            RETURNING company_id, amount
            "#,
        )
        .bind(older_than)
        .fetch_all(&mut *tx)
        .await?;

        for (company_id, amount) in &stale {
            sqlx::query("UPDATE companies SET credits_remaining = credits_remaining + $2 WHERE id = $1")
                .bind(company_id)
                .bind(amount)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if !stale.is_empty() {
            warn!(count = stale.len(), "Released stale credit reservations");
        }
        Ok(stale.len() as u64)
    }

    async fn insert_transaction(
        conn: &mut sqlx::PgConnection,
        company_id: Uuid,
        amount: i64,
        reason: CreditReason,
        enrollment_id: Option<Uuid>,
    ) -> Result<CreditTransaction> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            INSERT INTO credit_transactions (id, company_id, amount, reason, enrollment_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, company_id, amount, reason, enrollment_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(company_id)
        .bind(amount)
        .bind(reason.as_str())
        .bind(enrollment_id)
        .fetch_one(conn)
        .await?;

        row.try_into()
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn open_company(&self, company: &Company) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO companies (id, name, credits_remaining)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(company.id)
        .bind(&company.name)
        .bind(signed(company.credits_remaining)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn balance(&self, company_id: Uuid) -> Result<u64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT credits_remaining FROM companies WHERE id = $1")
            .bind(company_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(balance,)| unsigned(balance))
            .ok_or_else(|| SequencerError::not_found("company", company_id))
    }

    async fn reserve(
        &self,
        company_id: Uuid,
        amount: u64,
        enrollment_id: Option<Uuid>,
    ) -> Result<Reservation> {
        let requested = signed(amount)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, (i64,)>(
            r#"
            UPDATE companies
            SET credits_remaining = credits_remaining - $2
            WHERE id = $1 AND credits_remaining >= $2
            RETURNING credits_remaining
            "#,
        )
        .bind(company_id)
        .bind(requested)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            tx.rollback().await?;
            let available = self.balance(company_id).await?;
            return Err(SequencerError::InsufficientCredit {
                company_id,
                requested: amount,
                available,
            });
        }

        let reservation = Reservation::new(company_id, amount, enrollment_id);
        sqlx::query(
            r#"
            INSERT INTO credit_reservations (id, company_id, amount, enrollment_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(reservation.id())
        .bind(company_id)
        .bind(requested)
        .bind(enrollment_id)
        .bind(reservation.created_at())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(reservation)
    }

    async fn commit(&self, reservation: Reservation) -> Result<CreditTransaction> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query_as::<_, (i64,)>(
            "DELETE FROM credit_reservations WHERE id = $1 RETURNING amount",
        )
        .bind(reservation.id())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((amount,)) = removed else {
            return Err(anyhow!("reservation {} is not pending", reservation.id()).into());
        };

        let transaction = Self::insert_transaction(
            &mut tx,
            reservation.company_id(),
            -amount,
            CreditReason::StepExecuted,
            reservation.enrollment_id(),
        )
        .await?;

        tx.commit().await?;
        Ok(transaction)
    }

    async fn release(&self, reservation: Reservation) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query_as::<_, (i64,)>(
            "DELETE FROM credit_reservations WHERE id = $1 RETURNING amount",
        )
        .bind(reservation.id())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((amount,)) = removed else {
            return Err(anyhow!("reservation {} is not pending", reservation.id()).into());
        };

        sqlx::query("UPDATE companies SET credits_remaining = credits_remaining + $2 WHERE id = $1")
            .bind(reservation.company_id())
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn replenish(&self, company_id: Uuid, amount: u64) -> Result<CreditTransaction> {
        let added = signed(amount)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, (i64,)>(
            r#"
            UPDATE companies
            SET credits_remaining = credits_remaining + $2
            WHERE id = $1
            RETURNING credits_remaining
            "#,
        )
        .bind(company_id)
        .bind(added)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((balance,)) = updated else {
            return Err(SequencerError::not_found("company", company_id));
        };

        let transaction =
            Self::insert_transaction(&mut tx, company_id, added, CreditReason::Replenished, None)
                .await?;
        tx.commit().await?;

        info!(%company_id, amount, balance, "Credits replenished");
        Ok(transaction)
    }

    async fn transactions(&self, company_id: Uuid) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, company_id, amount, reason, enrollment_id, created_at
            FROM credit_transactions
            WHERE company_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditTransaction::try_from).collect()
    }
}
