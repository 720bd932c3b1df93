use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use outreach_common::{Company, EngagementSequence, Enrollment, Lead, Result, SequencerError};
use outreach_events::StoredEvent;

use crate::deps::SequencerDeps;
use crate::events::EngagementEvent;
use crate::ingestor::{EventIngestor, IngestOutcome};
use crate::scheduler::{Scheduler, SchedulerConfig, TickReport};

/// Entry point for callers: enrollment, ticks, and event ingestion over one
/// shared set of stores and locks.
#[derive(Clone)]
pub struct Sequencer {
    deps: SequencerDeps,
    scheduler: Arc<Scheduler>,
    ingestor: Arc<EventIngestor>,
}

impl Sequencer {
    pub fn new(deps: SequencerDeps, config: SchedulerConfig) -> Self {
        let ingestor = EventIngestor::new(deps.clone(), config.max_conflict_retries);
        Self {
            scheduler: Arc::new(Scheduler::new(deps.clone(), config)),
            ingestor: Arc::new(ingestor),
            deps,
        }
    }

    pub fn deps(&self) -> &SequencerDeps {
        &self.deps
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.scheduler.config()
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.scheduler.tick(now).await
    }

    pub async fn handle(&self, event: EngagementEvent, now: DateTime<Utc>) -> Result<IngestOutcome> {
        self.ingestor.handle(event, now).await
    }

    pub async fn open_company(&self, company: &Company) -> Result<()> {
        self.deps.ledger.open_company(company).await
    }

    pub async fn register_lead(&self, lead: &Lead) -> Result<()> {
        let _guard = self.deps.locks.lead(lead.id).await;
        self.deps.leads.upsert_lead(lead).await
    }

    pub async fn publish_sequence(&self, sequence: EngagementSequence) -> Result<EngagementSequence> {
        let published = self.deps.sequences.publish(sequence).await?;
        info!(
            sequence_id = %published.id,
            version = published.version,
            steps = published.steps.len(),
            "Sequence published"
        );
        Ok(published)
    }

    /// Enroll a lead in the latest version of an active sequence.
    pub async fn enroll(
        &self,
        lead_id: Uuid,
        sequence_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        let _guard = self.deps.locks.lead(lead_id).await;

        let lead = self
            .deps
            .leads
            .lead(lead_id)
            .await?
            .ok_or_else(|| SequencerError::not_found("lead", lead_id))?;
        if lead.temperature.is_terminal() {
            return Err(SequencerError::LeadConverted(lead_id));
        }

        let sequence = self
            .deps
            .sequences
            .latest(sequence_id)
            .await?
            .ok_or_else(|| SequencerError::not_found("sequence", sequence_id))?;
        if !sequence.is_active {
            return Err(SequencerError::SequenceInactive(sequence_id));
        }
        if sequence.company_id != lead.company_id {
            return Err(SequencerError::CompanyMismatch);
        }
        if self.deps.leads.open_enrollment_for_lead(lead_id).await?.is_some() {
            return Err(SequencerError::AlreadyEnrolled { lead_id });
        }

        let enrollment = self
            .deps
            .leads
            .insert_enrollment(Enrollment::new(&lead, &sequence, now))
            .await?;
        info!(
            enrollment_id = %enrollment.id,
            %lead_id,
            %sequence_id,
            version = enrollment.sequence_version,
            "Lead enrolled"
        );
        Ok(enrollment)
    }

    pub async fn enrollment(&self, enrollment_id: Uuid) -> Result<Enrollment> {
        self.deps
            .leads
            .enrollment(enrollment_id)
            .await?
            .ok_or_else(|| SequencerError::not_found("enrollment", enrollment_id))
    }

    /// Events and notifications recorded about an enrollment, oldest first.
    pub async fn history(&self, enrollment_id: Uuid) -> Result<Vec<StoredEvent>> {
        self.enrollment(enrollment_id).await?;
        Ok(self.deps.journal.by_subject(enrollment_id).await?)
    }

    pub async fn balance(&self, company_id: Uuid) -> Result<u64> {
        self.deps.ledger.balance(company_id).await
    }
}
