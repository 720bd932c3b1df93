use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use outreach_common::{Company, CreditReason, CreditTransaction, Result, SequencerError};

use super::{CreditLedger, Reservation};

#[derive(Debug, Default)]
struct Account {
    credits_remaining: u64,
    pending: HashMap<Uuid, u64>,
    log: Vec<CreditTransaction>,
}

/// In-memory ledger. Each company's account sits behind its own mutex, so
/// reservations for different companies never contend.
#[derive(Default)]
pub struct MemoryLedger {
    accounts: RwLock<HashMap<Uuid, Arc<Mutex<Account>>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, company_id: Uuid) -> Result<Arc<Mutex<Account>>> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&company_id)
            .cloned()
            .ok_or_else(|| SequencerError::not_found("company", company_id))
    }

    /// Credits currently held by uncommitted reservations.
    pub fn reserved(&self, company_id: Uuid) -> Result<u64> {
        let account = self.account(company_id)?;
        let account = account.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(account.pending.values().sum())
    }
}

fn signed(amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| anyhow!("credit amount {amount} out of range").into())
}

#[async_trait]
impl CreditLedger for MemoryLedger {
    async fn open_company(&self, company: &Company) -> Result<()> {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        accounts.entry(company.id).or_insert_with(|| {
            Arc::new(Mutex::new(Account {
                credits_remaining: company.credits_remaining,
                ..Account::default()
            }))
        });
        Ok(())
    }

    async fn balance(&self, company_id: Uuid) -> Result<u64> {
        let account = self.account(company_id)?;
        let balance = account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .credits_remaining;
        Ok(balance)
    }

    async fn reserve(
        &self,
        company_id: Uuid,
        amount: u64,
        enrollment_id: Option<Uuid>,
    ) -> Result<Reservation> {
        let account = self.account(company_id)?;
        let mut account = account.lock().unwrap_or_else(PoisonError::into_inner);

        if account.credits_remaining < amount {
            return Err(SequencerError::InsufficientCredit {
                company_id,
                requested: amount,
                available: account.credits_remaining,
            });
        }

        account.credits_remaining -= amount;
        let reservation = Reservation::new(company_id, amount, enrollment_id);
        account.pending.insert(reservation.id(), amount);
        debug!(%company_id, amount, remaining = account.credits_remaining, "Credit reserved");
        Ok(reservation)
    }

    async fn commit(&self, reservation: Reservation) -> Result<CreditTransaction> {
        let account = self.account(reservation.company_id())?;
        let mut account = account.lock().unwrap_or_else(PoisonError::into_inner);

        let amount = account
            .pending
            .remove(&reservation.id())
            .ok_or_else(|| anyhow!("reservation {} is not pending", reservation.id()))?;

        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            company_id: reservation.company_id(),
            amount: -signed(amount)?,
            reason: CreditReason::StepExecuted,
            enrollment_id: reservation.enrollment_id(),
            created_at: Utc::now(),
        };
        account.log.push(transaction.clone());
        Ok(transaction)
    }

    async fn release(&self, reservation: Reservation) -> Result<()> {
        let account = self.account(reservation.company_id())?;
        let mut account = account.lock().unwrap_or_else(PoisonError::into_inner);

        let amount = account
            .pending
            .remove(&reservation.id())
            .ok_or_else(|| anyhow!("reservation {} is not pending", reservation.id()))?;
        account.credits_remaining += amount;
        debug!(
            company_id = %reservation.company_id(),
            amount,
            remaining = account.credits_remaining,
            "Credit released"
        );
        Ok(())
    }

    async fn replenish(&self, company_id: Uuid, amount: u64) -> Result<CreditTransaction> {
        let account = self.account(company_id)?;
        let mut account = account.lock().unwrap_or_else(PoisonError::into_inner);

        account.credits_remaining = account.credits_remaining.saturating_add(amount);
        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            company_id,
            amount: signed(amount)?,
            reason: CreditReason::Replenished,
            enrollment_id: None,
            created_at: Utc::now(),
        };
        account.log.push(transaction.clone());
        Ok(transaction)
    }

    async fn transactions(&self, company_id: Uuid) -> Result<Vec<CreditTransaction>> {
        let account = self.account(company_id)?;
        let log = account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .log
            .clone();
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger_with(credits: u64) -> (Arc<MemoryLedger>, Uuid) {
        let ledger = Arc::new(MemoryLedger::new());
        let company = Company::new("Acme", credits);
        ledger.open_company(&company).await.unwrap();
        (ledger, company.id)
    }

    #[tokio::test]
    async fn reserve_decrements_and_commit_logs_once() {
        let (ledger, company) = ledger_with(2).await;

        let reservation = ledger.reserve(company, 1, None).await.unwrap();
        assert_eq!(ledger.balance(company).await.unwrap(), 1);
        assert_eq!(ledger.reserved(company).unwrap(), 1);

        let tx = ledger.commit(reservation).await.unwrap();
        assert_eq!(tx.amount, -1);
        assert_eq!(tx.reason, CreditReason::StepExecuted);
        assert_eq!(ledger.balance(company).await.unwrap(), 1);
        assert_eq!(ledger.reserved(company).unwrap(), 0);
        assert_eq!(ledger.transactions(company).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_restores_without_logging() {
        let (ledger, company) = ledger_with(1).await;

        let reservation = ledger.reserve(company, 1, None).await.unwrap();
        assert_eq!(ledger.balance(company).await.unwrap(), 0);
        ledger.release(reservation).await.unwrap();

        assert_eq!(ledger.balance(company).await.unwrap(), 1);
        assert!(ledger.transactions(company).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insufficient_credit_is_rejected() {
        let (ledger, company) = ledger_with(0).await;

        let err = ledger.reserve(company, 1, None).await.unwrap_err();
        assert!(matches!(
            err,
            SequencerError::InsufficientCredit {
                requested: 1,
                available: 0,
                ..
            }
        ));
        assert_eq!(ledger.balance(company).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_company_is_not_found() {
        let ledger = MemoryLedger::new();
        let err = ledger.balance(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SequencerError::NotFound { entity: "company", .. }));
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overspend() {
        let (ledger, company) = ledger_with(5).await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.reserve(company, 1, None).await
            }));
        }

        let mut granted = Vec::new();
        for h in handles {
            if let Ok(reservation) = h.await.unwrap() {
                granted.push(reservation);
            }
        }

        assert_eq!(granted.len(), 5);
        assert_eq!(ledger.balance(company).await.unwrap(), 0);
        for reservation in granted {
            ledger.commit(reservation).await.unwrap();
        }
        assert_eq!(ledger.transactions(company).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn replenish_adds_and_logs() {
        let (ledger, company) = ledger_with(0).await;
        let tx = ledger.replenish(company, 10).await.unwrap();
        assert_eq!(tx.amount, 10);
        assert_eq!(tx.reason, CreditReason::Replenished);
        assert_eq!(ledger.balance(company).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn open_company_is_idempotent() {
        let ledger = MemoryLedger::new();
        let company = Company::new("Acme", 3);
        ledger.open_company(&company).await.unwrap();
        let _held = ledger.reserve(company.id, 1, None).await.unwrap();
        ledger.open_company(&company).await.unwrap();
        assert_eq!(ledger.balance(company.id).await.unwrap(), 2);
    }
}
