use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use outreach_common::{Enrollment, EnrollmentStatus, Lead, Result, SequencerError};

use super::LeadStore;

/// In-memory lead state. Map guards are only held for the duration of a
/// lookup or write, never across an await.
#[derive(Default)]
pub struct MemoryLeadStore {
    leads: RwLock<HashMap<Uuid, Lead>>,
    enrollments: RwLock<HashMap<Uuid, Enrollment>>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a stored enrollment directly, bumping its revision the way an
    /// out-of-band writer would.
    pub fn force_update(&self, enrollment_id: Uuid, f: impl FnOnce(&mut Enrollment)) -> Result<()> {
        let mut enrollments = self
            .enrollments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stored = enrollments
            .get_mut(&enrollment_id)
            .ok_or_else(|| SequencerError::not_found("enrollment", enrollment_id))?;
        f(stored);
        stored.revision += 1;
        Ok(())
    }

    fn filtered(&self, pred: impl Fn(&Enrollment) -> bool) -> Vec<Enrollment> {
        let enrollments = self.enrollments.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<Enrollment> = enrollments.values().filter(|e| pred(e)).cloned().collect();
        matched.sort_by_key(|e| e.id);
        matched
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        self.leads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(lead.id, lead.clone());
        Ok(())
    }

    async fn lead(&self, lead_id: Uuid) -> Result<Option<Lead>> {
        Ok(self
            .leads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&lead_id)
            .cloned())
    }

    async fn insert_enrollment(&self, enrollment: Enrollment) -> Result<Enrollment> {
        let mut enrollments = self
            .enrollments
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let already_open = enrollments
            .values()
            .any(|e| e.lead_id == enrollment.lead_id && e.status.is_open());
        if already_open {
            return Err(SequencerError::AlreadyEnrolled {
                lead_id: enrollment.lead_id,
            });
        }

        enrollments.insert(enrollment.id, enrollment.clone());
        Ok(enrollment)
    }

    async fn enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>> {
        Ok(self
            .enrollments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&enrollment_id)
            .cloned())
    }

    async fn open_enrollment_for_lead(&self, lead_id: Uuid) -> Result<Option<Enrollment>> {
        Ok(self
            .filtered(|e| e.lead_id == lead_id && e.status.is_open())
            .into_iter()
            .next())
    }

    async fn due_enrollments(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>> {
        let mut due = self.filtered(|e| e.is_due(now));
        due.sort_by_key(|e| (e.next_fire_time, e.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<Enrollment> {
        let mut enrollments = self
            .enrollments
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let stored = enrollments
            .get_mut(&enrollment.id)
            .ok_or_else(|| SequencerError::not_found("enrollment", enrollment.id))?;

        if stored.revision != enrollment.revision {
            return Err(SequencerError::ConcurrentModification {
                enrollment_id: enrollment.id,
            });
        }

        *stored = enrollment.clone();
        stored.revision += 1;
        Ok(stored.clone())
    }

    async fn company_enrollments(
        &self,
        company_id: Uuid,
        status: EnrollmentStatus,
    ) -> Result<Vec<Enrollment>> {
        Ok(self.filtered(|e| e.company_id == company_id && e.status == status))
    }

    async fn open_enrollments_for_sequence(&self, sequence_id: Uuid) -> Result<Vec<Enrollment>> {
        Ok(self.filtered(|e| e.sequence_id == sequence_id && e.status.is_open()))
    }
}
