//! Event ingestor: journals each external event, then applies it to lead and
//! enrollment state under the same locks the scheduler uses.
//!
//! Lock order is lead before enrollment. The scheduler takes the enrollment
//! lock and then, only to pause for credit, the company lock. Here the company
//! lock is released before any enrollment lock is taken, so no cycle forms.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use outreach_common::{
    fire_at, ActionKind, Enrollment, EnrollmentReason, EnrollmentStatus, LeadTemperature, Result,
    SequencerError,
};

use crate::deps::SequencerDeps;
use crate::events::EngagementEvent;
use crate::journal;
use crate::leads::{apply_transition, Transition};

/// What handling one event changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// Journal sequence number the event was recorded under.
    pub seq: i64,
    pub event_type: &'static str,
    /// Enrollments whose state this event changed.
    pub touched: Vec<Uuid>,
}

pub struct EventIngestor {
    deps: SequencerDeps,
    max_conflict_retries: u32,
}

impl EventIngestor {
    pub fn new(deps: SequencerDeps, max_conflict_retries: u32) -> Self {
        Self {
            deps,
            max_conflict_retries,
        }
    }

    pub async fn handle(&self, event: EngagementEvent, now: DateTime<Utc>) -> Result<IngestOutcome> {
        let stored = journal::record(self.deps.journal.as_ref(), &event, "ingestor").await?;

        let touched = match &event {
            EngagementEvent::LeadReplied { lead_id } => self.lead_replied(*lead_id, now).await?,
            EngagementEvent::TemperatureOverride {
                lead_id,
                temperature,
            } => self.temperature_override(*lead_id, *temperature, now).await?,
            EngagementEvent::CreditsReplenished { company_id, amount } => {
                self.credits_replenished(*company_id, *amount, now).await?
            }
            EngagementEvent::ManualCancel { enrollment_id } => {
                self.manual_cancel(*enrollment_id, now).await?
            }
            EngagementEvent::ResumeEnrollment { enrollment_id } => {
                self.resume(*enrollment_id, now).await?
            }
            EngagementEvent::SequenceDeactivated { sequence_id } => {
                self.sequence_deactivated(*sequence_id, now).await?
            }
        };

        info!(
            seq = stored.seq,
            event_type = event.type_str(),
            touched = touched.len(),
            "Event applied"
        );
        Ok(IngestOutcome {
            seq: stored.seq,
            event_type: event.type_str(),
            touched,
        })
    }

    async fn lead_replied(&self, lead_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let _lead_guard = self.deps.locks.lead(lead_id).await;

        let mut lead = self
            .deps
            .leads
            .lead(lead_id)
            .await?
            .ok_or_else(|| SequencerError::not_found("lead", lead_id))?;
        lead.reply_count = lead.reply_count.saturating_add(1);
        lead.last_replied_at = Some(now);
        lead.updated_at = now;
        self.deps.leads.upsert_lead(&lead).await?;

        let Some(open) = self.deps.leads.open_enrollment_for_lead(lead_id).await? else {
            return Ok(Vec::new());
        };

        let _guard = self.deps.locks.enrollment(open.id).await;
        let Some(enrollment) = self.deps.leads.enrollment(open.id).await? else {
            return Ok(Vec::new());
        };
        if enrollment.status != EnrollmentStatus::Active {
            return Ok(Vec::new());
        }

        let Some(sequence) = self
            .deps
            .sequences
            .version(enrollment.sequence_id, enrollment.sequence_version)
            .await?
        else {
            return Ok(Vec::new());
        };
        let Some(step) = sequence.step_after(enrollment.cursor) else {
            return Ok(Vec::new());
        };
        if step.action_kind != ActionKind::WaitForReply {
            debug!(enrollment_id = %enrollment.id, "Reply recorded, schedule unchanged");
            return Ok(Vec::new());
        }

        let position = step.position;
        let next_fire = sequence
            .step_after(position)
            .map(|next| fire_at(now, next.delay_after_previous()));
        info!(
            enrollment_id = %enrollment.id,
            position,
            "Reply received, skipping wait_for_reply step"
        );
        self.apply(enrollment, now, move |e| {
            e.cursor < position && e.advance(position, next_fire, now)
        })
        .await
    }

    async fn temperature_override(
        &self,
        lead_id: Uuid,
        temperature: LeadTemperature,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let _lead_guard = self.deps.locks.lead(lead_id).await;

        let mut lead = self
            .deps
            .leads
            .lead(lead_id)
            .await?
            .ok_or_else(|| SequencerError::not_found("lead", lead_id))?;
        lead.temperature = temperature;
        lead.updated_at = now;
        self.deps.leads.upsert_lead(&lead).await?;

        if !temperature.is_terminal() {
            return Ok(Vec::new());
        }

        let Some(open) = self.deps.leads.open_enrollment_for_lead(lead_id).await? else {
            return Ok(Vec::new());
        };
        let _guard = self.deps.locks.enrollment(open.id).await;
        let Some(enrollment) = self.deps.leads.enrollment(open.id).await? else {
            return Ok(Vec::new());
        };
        self.apply(enrollment, now, move |e| {
            e.cancel(EnrollmentReason::LeadConverted, now)
        })
        .await
    }

    async fn credits_replenished(
        &self,
        company_id: Uuid,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let paused = {
            // A tick pausing for credit either sees this top-up on its retry
            // or has saved the pause before the listing below.
            let _company_guard = self.deps.locks.company(company_id).await;
            if amount > 0 {
                self.deps.ledger.replenish(company_id, amount).await?;
            } else {
                // Still fail for unknown companies.
                self.deps.ledger.balance(company_id).await?;
            }
            self.deps
                .leads
                .company_enrollments(company_id, EnrollmentStatus::Paused)
                .await?
        };

        let mut touched = Vec::new();
        for candidate in paused {
            if candidate.reason != Some(EnrollmentReason::CreditExhausted) {
                continue;
            }
            let _guard = self.deps.locks.enrollment(candidate.id).await;
            let Some(enrollment) = self.deps.leads.enrollment(candidate.id).await? else {
                continue;
            };
            touched.extend(
                self.apply(enrollment, now, move |e| {
                    e.reason == Some(EnrollmentReason::CreditExhausted) && e.resume(now)
                })
                .await?,
            );
        }

        info!(%company_id, amount, resumed = touched.len(), "Credits replenished");
        Ok(touched)
    }

    async fn manual_cancel(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        // Reach a step that is executing right now, then wait our turn.
        self.deps.locks.request_cancel(enrollment_id);
        let result = self.cancel_under_lock(enrollment_id, now).await;
        self.deps.locks.clear_cancel(enrollment_id);
        result
    }

    async fn cancel_under_lock(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let _guard = self.deps.locks.enrollment(enrollment_id).await;
        let enrollment = self
            .deps
            .leads
            .enrollment(enrollment_id)
            .await?
            .ok_or_else(|| SequencerError::not_found("enrollment", enrollment_id))?;

        let transition = apply_transition(
            self.deps.leads.as_ref(),
            enrollment,
            self.max_conflict_retries,
            move |e| e.cancel(EnrollmentReason::ManualCancel, now),
        )
        .await?;

        match transition {
            Transition::Applied(saved) => {
                self.deps.notifier.notify_enrollment(&saved, now).await;
                Ok(vec![saved.id])
            }
            // The scheduler observed the signal mid-step and cancelled it.
            Transition::Superseded(current)
                if current.reason == Some(EnrollmentReason::ManualCancel) =>
            {
                Ok(vec![current.id])
            }
            Transition::Superseded(_) => Ok(Vec::new()),
        }
    }

    async fn resume(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let _guard = self.deps.locks.enrollment(enrollment_id).await;
        let enrollment = self
            .deps
            .leads
            .enrollment(enrollment_id)
            .await?
            .ok_or_else(|| SequencerError::not_found("enrollment", enrollment_id))?;
        self.apply(enrollment, now, move |e| e.resume(now)).await
    }

    async fn sequence_deactivated(&self, sequence_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        if !self.deps.sequences.set_active(sequence_id, false).await? {
            return Err(SequencerError::not_found("sequence", sequence_id));
        }

        let open = self
            .deps
            .leads
            .open_enrollments_for_sequence(sequence_id)
            .await?;

        let mut touched = Vec::new();
        for candidate in open {
            let _guard = self.deps.locks.enrollment(candidate.id).await;
            let Some(enrollment) = self.deps.leads.enrollment(candidate.id).await? else {
                continue;
            };
            touched.extend(
                self.apply(enrollment, now, move |e| {
                    e.cancel(EnrollmentReason::SequenceDeactivated, now)
                })
                .await?,
            );
        }

        info!(%sequence_id, cancelled = touched.len(), "Sequence deactivated");
        Ok(touched)
    }

    /// Apply a transition and notify on success. Returns the enrollment id if
    /// anything changed.
    async fn apply<F>(&self, enrollment: Enrollment, now: DateTime<Utc>, change: F) -> Result<Vec<Uuid>>
    where
        F: Fn(&mut Enrollment) -> bool + Send + Sync,
    {
        let transition = apply_transition(
            self.deps.leads.as_ref(),
            enrollment,
            self.max_conflict_retries,
            change,
        )
        .await?;

        match transition {
            Transition::Applied(saved) => {
                self.deps.notifier.notify_enrollment(&saved, now).await;
                Ok(vec![saved.id])
            }
            Transition::Superseded(_) => Ok(Vec::new()),
        }
    }
}
