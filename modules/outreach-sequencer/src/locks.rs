//! Per-key mutual exclusion shared by the scheduler and the event ingestor.
//!
//! There is no global lock: each enrollment, lead and company gets its own
//! async mutex, created on first use and pruned once nobody holds or awaits it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

const PRUNE_THRESHOLD: usize = 1024;

/// A table of async mutexes keyed by id.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn lock(&self, key: Uuid) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.len() >= PRUNE_THRESHOLD {
                // Holders and waiters each keep a clone, so count 1 means idle.
                slots.retain(|_, m| Arc::strong_count(m) > 1);
            }
            slots.entry(key).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusion scopes for sequence execution plus the cancellation signal a
/// `ManualCancel` uses to reach a step that is already executing.
///
/// The company scope orders a credit pause against a replenishment: the
/// scheduler holds it from a failed reservation until the pause is saved, and
/// the ingestor holds it from the top-up until it has listed what to resume.
/// Neither waits on an enrollment lock while holding it.
#[derive(Default)]
pub struct EnrollmentLocks {
    enrollments: KeyedLocks,
    leads: KeyedLocks,
    companies: KeyedLocks,
    cancel_signals: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl EnrollmentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enrollment(&self, enrollment_id: Uuid) -> OwnedMutexGuard<()> {
        self.enrollments.lock(enrollment_id).await
    }

    pub async fn lead(&self, lead_id: Uuid) -> OwnedMutexGuard<()> {
        self.leads.lock(lead_id).await
    }

    pub async fn company(&self, company_id: Uuid) -> OwnedMutexGuard<()> {
        self.companies.lock(company_id).await
    }

    /// Register an evaluation of `enrollment_id`. The returned handle reports
    /// whether a cancel was requested before or during the evaluation.
    pub fn begin_execution(&self, enrollment_id: Uuid) -> InFlight<'_> {
        let receiver = {
            let mut signals = self
                .cancel_signals
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            signals
                .entry(enrollment_id)
                .or_insert_with(|| watch::channel(false).0)
                .subscribe()
        };
        InFlight {
            locks: self,
            enrollment_id,
            receiver,
        }
    }

    /// Signal any current or imminent evaluation of `enrollment_id` to abort.
    /// The request stays pending until `clear_cancel` is called.
    pub fn request_cancel(&self, enrollment_id: Uuid) {
        let mut signals = self
            .cancel_signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        signals
            .entry(enrollment_id)
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }

    pub fn clear_cancel(&self, enrollment_id: Uuid) {
        self.cancel_signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&enrollment_id);
    }

    pub fn is_cancel_requested(&self, enrollment_id: Uuid) -> bool {
        self.cancel_signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&enrollment_id)
            .is_some_and(|tx| *tx.borrow())
    }
}

/// Handle for one in-flight evaluation. Dropping it unregisters the signal
/// unless a cancel is pending, which the requester clears itself.
pub struct InFlight<'a> {
    locks: &'a EnrollmentLocks,
    enrollment_id: Uuid,
    receiver: watch::Receiver<bool>,
}

impl InFlight<'_> {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once a cancel has been requested. Never resolves otherwise.
    pub async fn cancelled(&mut self) {
        if self.receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut signals = self
            .locks
            .cancel_signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let pending = signals
            .get(&self.enrollment_id)
            .is_some_and(|tx| *tx.borrow());
        if !pending {
            signals.remove(&self.enrollment_id);
        }
    }
}
