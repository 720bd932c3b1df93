use std::sync::Arc;

use crate::executor::StepExecutor;
use crate::journal::{Journal, MemoryJournal};
use crate::ledger::{CreditLedger, MemoryLedger};
use crate::leads::{LeadStore, MemoryLeadStore};
use crate::locks::EnrollmentLocks;
use crate::notify::{MemoryBackend, Notifier};
use crate::sequences::{MemorySequenceCatalog, SequenceCatalog};

/// Shared handles used by the scheduler and the event ingestor.
#[derive(Clone)]
pub struct SequencerDeps {
    pub ledger: Arc<dyn CreditLedger>,
    pub leads: Arc<dyn LeadStore>,
    pub sequences: Arc<dyn SequenceCatalog>,
    pub executor: Arc<dyn StepExecutor>,
    pub notifier: Notifier,
    pub journal: Arc<dyn Journal>,
    pub locks: Arc<EnrollmentLocks>,
}

impl SequencerDeps {
    pub fn new(
        ledger: Arc<dyn CreditLedger>,
        leads: Arc<dyn LeadStore>,
        sequences: Arc<dyn SequenceCatalog>,
        executor: Arc<dyn StepExecutor>,
        notifier: Notifier,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            ledger,
            leads,
            sequences,
            executor,
            notifier,
            journal,
            locks: Arc::new(EnrollmentLocks::new()),
        }
    }
}

/// Fully in-memory wiring with concrete handles kept for inspection.
pub struct MemoryDeps {
    pub ledger: Arc<MemoryLedger>,
    pub leads: Arc<MemoryLeadStore>,
    pub sequences: Arc<MemorySequenceCatalog>,
    pub notifications: Arc<MemoryBackend>,
    pub journal: Arc<MemoryJournal>,
}

impl MemoryDeps {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(MemoryLedger::new()),
            leads: Arc::new(MemoryLeadStore::new()),
            sequences: Arc::new(MemorySequenceCatalog::new()),
            notifications: Arc::new(MemoryBackend::new()),
            journal: Arc::new(MemoryJournal::new()),
        }
    }

    pub fn with_executor(&self, executor: Arc<dyn StepExecutor>) -> SequencerDeps {
        let journal: Arc<dyn Journal> = self.journal.clone();
        SequencerDeps::new(
            self.ledger.clone(),
            self.leads.clone(),
            self.sequences.clone(),
            executor,
            Notifier::new(self.notifications.clone(), journal.clone()),
            journal,
        )
    }
}

impl Default for MemoryDeps {
    fn default() -> Self {
        Self::new()
    }
}
