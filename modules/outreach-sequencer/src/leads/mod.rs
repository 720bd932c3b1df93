//! Lead state store: lead temperature plus each lead's enrollments.
//!
//! Enrollment writes are optimistic. Every save must carry the revision it
//! read; a mismatch fails with `ConcurrentModification` and the caller
//! re-reads. `apply_transition` packages that loop.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use outreach_common::{Enrollment, EnrollmentStatus, Lead, Result, SequencerError};

pub use memory::MemoryLeadStore;
pub use postgres::PgLeadStore;

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn upsert_lead(&self, lead: &Lead) -> Result<()>;

    async fn lead(&self, lead_id: Uuid) -> Result<Option<Lead>>;

    /// Insert a new enrollment. Fails with `AlreadyEnrolled` if the lead
    /// already has an active or paused one.
    async fn insert_enrollment(&self, enrollment: Enrollment) -> Result<Enrollment>;

    async fn enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>>;

    /// The lead's active or paused enrollment, if any.
    async fn open_enrollment_for_lead(&self, lead_id: Uuid) -> Result<Option<Enrollment>>;

    /// Enrollments due at `now`, ordered by `(next_fire_time, id)`.
    async fn due_enrollments(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>>;

    /// Write `enrollment` if the stored revision still matches; returns the
    /// stored copy with its revision bumped.
    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<Enrollment>;

    async fn company_enrollments(
        &self,
        company_id: Uuid,
        status: EnrollmentStatus,
    ) -> Result<Vec<Enrollment>>;

    async fn open_enrollments_for_sequence(&self, sequence_id: Uuid) -> Result<Vec<Enrollment>>;
}

/// Result of applying a transition to an enrollment.
#[derive(Debug)]
pub enum Transition {
    /// The change was written; holds the stored enrollment.
    Applied(Enrollment),
    /// The current state no longer admits the change (e.g. it was cancelled
    /// elsewhere); holds that current state.
    Superseded(Enrollment),
}

impl Transition {
    pub fn enrollment(&self) -> &Enrollment {
        match self {
            Self::Applied(e) | Self::Superseded(e) => e,
        }
    }

    pub fn into_enrollment(self) -> Enrollment {
        match self {
            Self::Applied(e) | Self::Superseded(e) => e,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Apply `change` to `enrollment` and save it, re-reading and re-applying on
/// `ConcurrentModification` up to `max_conflicts` times. `change` returns
/// false when the transition is not valid from the state it is given.
pub async fn apply_transition<F>(
    store: &dyn LeadStore,
    mut enrollment: Enrollment,
    max_conflicts: u32,
    change: F,
) -> Result<Transition>
where
    F: Fn(&mut Enrollment) -> bool + Send + Sync,
{
    let mut conflicts = 0;
    loop {
        let mut candidate = enrollment.clone();
        if !change(&mut candidate) {
            return Ok(Transition::Superseded(enrollment));
        }

        match store.save_enrollment(&candidate).await {
            Ok(saved) => return Ok(Transition::Applied(saved)),
            Err(SequencerError::ConcurrentModification { enrollment_id }) if conflicts < max_conflicts => {
                conflicts += 1;
                debug!(%enrollment_id, conflicts, "Enrollment changed underneath us, re-reading");
                enrollment = store
                    .enrollment(enrollment_id)
                    .await?
                    .ok_or_else(|| SequencerError::not_found("enrollment", enrollment_id))?;
            }
            Err(e) => return Err(e),
        }
    }
}
