//! Credit ledger: per-company execution credits with reserve/commit/release.
//!
//! A reservation decrements the balance immediately. Committing it writes the
//! one `CreditTransaction` that corresponds to an executed step; releasing it
//! restores the balance and leaves no trace in the transaction log.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use outreach_common::{Company, CreditTransaction, Result};

pub use memory::MemoryLedger;
pub use postgres::PgCreditLedger;

/// Provisional decrement awaiting commit or release. Not `Clone`: each
/// reservation is finalized exactly once.
#[derive(Debug)]
#[must_use = "a reservation must be committed or released"]
pub struct Reservation {
    id: Uuid,
    company_id: Uuid,
    amount: u64,
    enrollment_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl Reservation {
    pub(crate) fn new(company_id: Uuid, amount: u64, enrollment_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_id,
            amount,
            enrollment_id,
            created_at: Utc::now(),
        }
    }

    /// A second handle on the same reservation, for retrying a commit that
    /// failed before it took effect. Ledgers finalize a reservation at most once.
    pub(crate) fn reissue(&self) -> Self {
        Self {
            id: self.id,
            company_id: self.company_id,
            amount: self.amount,
            enrollment_id: self.enrollment_id,
            created_at: self.created_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn company_id(&self) -> Uuid {
        self.company_id
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn enrollment_id(&self) -> Option<Uuid> {
        self.enrollment_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// All operations on one company's balance are linearizable; concurrent
/// reservations never succeed past the balance.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Register a company with its opening balance. Idempotent.
    async fn open_company(&self, company: &Company) -> Result<()>;

    async fn balance(&self, company_id: Uuid) -> Result<u64>;

    /// Fails with `InsufficientCredit` when the balance is below `amount`.
    async fn reserve(
        &self,
        company_id: Uuid,
        amount: u64,
        enrollment_id: Option<Uuid>,
    ) -> Result<Reservation>;

    async fn commit(&self, reservation: Reservation) -> Result<CreditTransaction>;

    async fn release(&self, reservation: Reservation) -> Result<()>;

    async fn replenish(&self, company_id: Uuid, amount: u64) -> Result<CreditTransaction>;

    /// The company's transaction log, oldest first.
    async fn transactions(&self, company_id: Uuid) -> Result<Vec<CreditTransaction>>;
}
