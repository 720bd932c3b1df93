use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SequencerError;

/// Returned when a stored enum column holds a value this build doesn't know.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// `now + delay`, saturating at the latest representable instant.
pub fn fire_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// --- Companies ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub credits_remaining: u64,
}

impl Company {
    pub fn new(name: impl Into<String>, credits_remaining: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            credits_remaining,
        }
    }
}

// --- Leads ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LeadTemperature {
    Cold,
    Warm,
    Hot,
    Converted,
}

impl LeadTemperature {
    /// `converted` is terminal: nothing moves a lead out of it automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Hot => "hot",
            Self::Converted => "converted",
        }
    }
}

impl fmt::Display for LeadTemperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadTemperature {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cold" => Ok(Self::Cold),
            "warm" => Ok(Self::Warm),
            "hot" => Ok(Self::Hot),
            "converted" => Ok(Self::Converted),
            other => Err(ParseEnumError::new("lead_temperature", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub company_id: Uuid,
    pub temperature: LeadTemperature,
    pub reply_count: u32,
    pub last_replied_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(company_id: Uuid, temperature: LeadTemperature) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_id,
            temperature,
            reply_count: 0,
            last_replied_at: None,
            updated_at: Utc::now(),
        }
    }
}

// --- Sequences ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage,
    Wait,
    WaitForReply,
    TagLead,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::Wait => "wait",
            Self::WaitForReply => "wait_for_reply",
            Self::TagLead => "tag_lead",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_message" => Ok(Self::SendMessage),
            "wait" => Ok(Self::Wait),
            "wait_for_reply" => Ok(Self::WaitForReply),
            "tag_lead" => Ok(Self::TagLead),
            other => Err(ParseEnumError::new("action_kind", other)),
        }
    }
}

/// One ordered action within a sequence. The payload is opaque here; it is
/// validated by the step executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: Uuid,
    pub position: u32,
    pub action_kind: ActionKind,
    pub delay_after_previous_secs: u64,
    #[serde(default)]
    pub action_payload: serde_json::Value,
}

impl SequenceStep {
    pub fn new(
        position: u32,
        action_kind: ActionKind,
        delay_after_previous_secs: u64,
        action_payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            position,
            action_kind,
            delay_after_previous_secs,
            action_payload,
        }
    }

    pub fn delay_after_previous(&self) -> Duration {
        seconds(self.delay_after_previous_secs)
    }
}

/// An immutable version of a sequence definition. Publishing an edited
/// sequence produces a new version; enrollments stay bound to the version
/// they started on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementSequence {
    pub id: Uuid,
    pub company_id: Uuid,
    pub version: u32,
    pub is_active: bool,
    pub steps: Vec<SequenceStep>,
}

impl EngagementSequence {
    /// Build a validated, position-ordered sequence (version 1, active).
    pub fn new(company_id: Uuid, steps: Vec<SequenceStep>) -> Result<Self, SequencerError> {
        let mut sequence = Self {
            id: Uuid::new_v4(),
            company_id,
            version: 1,
            is_active: true,
            steps,
        };
        sequence.normalize()?;
        Ok(sequence)
    }

    /// Sort steps by position and reject duplicate or zero positions.
    pub fn normalize(&mut self) -> Result<(), SequencerError> {
        self.steps.sort_by_key(|s| s.position);
        if self.steps.iter().any(|s| s.position == 0) {
            return Err(SequencerError::InvalidSequence(
                "step positions start at 1".to_string(),
            ));
        }
        if let Some(dup) = self
            .steps
            .windows(2)
            .find(|pair| pair[0].position == pair[1].position)
        {
            return Err(SequencerError::InvalidSequence(format!(
                "duplicate step position {}",
                dup[0].position
            )));
        }
        Ok(())
    }

    /// The first step strictly after `cursor`, i.e. the next one to run.
    pub fn step_after(&self, cursor: u32) -> Option<&SequenceStep> {
        self.steps.iter().find(|s| s.position > cursor)
    }

    pub fn first_step(&self) -> Option<&SequenceStep> {
        self.steps.first()
    }
}

// --- Enrollments ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Active or paused: the lead is still "in" the sequence.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("enrollment_status", other)),
        }
    }
}

/// Why an enrollment left the `active` state. Stored alongside the status so
/// downstream views can explain a paused or cancelled enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrollmentReason {
    CreditExhausted,
    MaxRetriesExceeded { last_error: String },
    FatalFailure { error: String },
    LeadConverted,
    ManualCancel,
    SequenceDeactivated,
    SequenceExhausted,
    SequenceMissing,
}

impl EnrollmentReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CreditExhausted => "credit-exhausted",
            Self::MaxRetriesExceeded { .. } => "max-retries-exceeded",
            Self::FatalFailure { .. } => "fatal-failure",
            Self::LeadConverted => "lead-converted",
            Self::ManualCancel => "manual-cancel",
            Self::SequenceDeactivated => "sequence-deactivated",
            Self::SequenceExhausted => "sequence-exhausted",
            Self::SequenceMissing => "sequence-missing",
        }
    }
}

impl fmt::Display for EnrollmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxRetriesExceeded { last_error } => write!(f, "{}: {last_error}", self.code()),
            Self::FatalFailure { error } => write!(f, "{}: {error}", self.code()),
            _ => f.write_str(self.code()),
        }
    }
}

/// A lead's traversal of one sequence version.
///
/// The transition methods below are the only way the scheduler and ingestor
/// change status, so the invariants live here: terminal states never reopen,
/// and the cursor never moves backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub company_id: Uuid,
    pub sequence_id: Uuid,
    pub sequence_version: u32,
    /// Position of the last completed step; 0 before any step has run.
    pub cursor: u32,
    pub status: EnrollmentStatus,
    pub reason: Option<EnrollmentReason>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Failed attempts at the step after `cursor`.
    pub attempts: u32,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

impl Enrollment {
    pub fn new(lead: &Lead, sequence: &EngagementSequence, now: DateTime<Utc>) -> Self {
        let first_delay = sequence
            .first_step()
            .map(|s| s.delay_after_previous())
            .unwrap_or_else(Duration::zero);

        Self {
            id: Uuid::new_v4(),
            lead_id: lead.id,
            company_id: lead.company_id,
            sequence_id: sequence.id,
            sequence_version: sequence.version,
            cursor: 0,
            status: EnrollmentStatus::Active,
            reason: None,
            next_fire_time: Some(fire_at(now, first_delay)),
            attempts: 0,
            last_evaluated_at: None,
            enrolled_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Due for evaluation by a tick at `now`. An enrollment is evaluated at
    /// most once per tick instant, which makes overlapping ticks for the same
    /// `now` converge on the same state.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active
            && self.next_fire_time.is_some_and(|t| t <= now)
            && self.last_evaluated_at.map_or(true, |t| t < now)
    }

    /// Record a completed step. Returns false if the enrollment is not active.
    pub fn advance(
        &mut self,
        position: u32,
        next_fire_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != EnrollmentStatus::Active {
            return false;
        }
        self.cursor = self.cursor.max(position);
        self.attempts = 0;
        self.updated_at = now;
        match next_fire_time {
            Some(at) => self.next_fire_time = Some(at),
            None => self.finish(
                EnrollmentStatus::Completed,
                EnrollmentReason::SequenceExhausted,
                now,
            ),
        }
        true
    }

    /// Schedule another attempt at the current step.
    pub fn retry_at(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.status != EnrollmentStatus::Active {
            return false;
        }
        self.attempts += 1;
        self.next_fire_time = Some(at);
        self.updated_at = now;
        true
    }

    pub fn pause(&mut self, reason: EnrollmentReason, now: DateTime<Utc>) -> bool {
        if self.status != EnrollmentStatus::Active {
            return false;
        }
        self.status = EnrollmentStatus::Paused;
        self.reason = Some(reason);
        self.next_fire_time = None;
        self.updated_at = now;
        true
    }

    /// paused → active, due immediately.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != EnrollmentStatus::Paused {
            return false;
        }
        self.status = EnrollmentStatus::Active;
        self.reason = None;
        self.attempts = 0;
        self.next_fire_time = Some(now);
        self.last_evaluated_at = None;
        self.updated_at = now;
        true
    }

    pub fn complete(&mut self, reason: EnrollmentReason, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.finish(EnrollmentStatus::Completed, reason, now);
        true
    }

    pub fn cancel(&mut self, reason: EnrollmentReason, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.finish(EnrollmentStatus::Cancelled, reason, now);
        true
    }

    fn finish(&mut self, status: EnrollmentStatus, reason: EnrollmentReason, now: DateTime<Utc>) {
        self.status = status;
        self.reason = Some(reason);
        self.next_fire_time = None;
        self.updated_at = now;
    }
}

// --- Credits ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    StepExecuted,
    Replenished,
}

impl CreditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepExecuted => "step_executed",
            Self::Replenished => "replenished",
        }
    }
}

impl FromStr for CreditReason {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step_executed" => Ok(Self::StepExecuted),
            "replenished" => Ok(Self::Replenished),
            other => Err(ParseEnumError::new("credit_reason", other)),
        }
    }
}

/// Append-only ledger entry. Debits are negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub company_id: Uuid,
    pub amount: i64,
    pub reason: CreditReason,
    pub enrollment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn three_step_sequence(company_id: Uuid) -> EngagementSequence {
        EngagementSequence::new(
            company_id,
            vec![
                SequenceStep::new(3, ActionKind::SendMessage, 3600, json!({})),
                SequenceStep::new(1, ActionKind::SendMessage, 0, json!({})),
                SequenceStep::new(2, ActionKind::Wait, 3600, json!({})),
            ],
        )
        .unwrap()
    }

    #[test]
    fn sequence_steps_are_sorted_by_position() {
        let seq = three_step_sequence(Uuid::new_v4());
        let positions: Vec<u32> = seq.steps.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(seq.step_after(0).unwrap().position, 1);
        assert_eq!(seq.step_after(2).unwrap().position, 3);
        assert!(seq.step_after(3).is_none());
    }

    #[test]
    fn duplicate_positions_are_rejected() {
        let result = EngagementSequence::new(
            Uuid::new_v4(),
            vec![
                SequenceStep::new(1, ActionKind::Wait, 0, json!({})),
                SequenceStep::new(1, ActionKind::Wait, 0, json!({})),
            ],
        );
        assert!(matches!(result, Err(SequencerError::InvalidSequence(_))));
    }

    #[test]
    fn zero_position_is_rejected() {
        let result = EngagementSequence::new(
            Uuid::new_v4(),
            vec![SequenceStep::new(0, ActionKind::Wait, 0, json!({}))],
        );
        assert!(result.is_err());
    }

    #[test]
    fn new_enrollment_fires_after_first_delay() {
        let company = Uuid::new_v4();
        let mut seq = three_step_sequence(company);
        seq.steps[0].delay_after_previous_secs = 60;
        let lead = Lead::new(company, LeadTemperature::Cold);
        let now = Utc::now();

        let enrollment = Enrollment::new(&lead, &seq, now);
        assert_eq!(enrollment.cursor, 0);
        assert_eq!(enrollment.next_fire_time, Some(now + Duration::seconds(60)));
        assert!(!enrollment.is_due(now));
        assert!(enrollment.is_due(now + Duration::seconds(60)));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let company = Uuid::new_v4();
        let seq = three_step_sequence(company);
        let lead = Lead::new(company, LeadTemperature::Warm);
        let now = Utc::now();
        let mut enrollment = Enrollment::new(&lead, &seq, now);

        assert!(enrollment.advance(2, Some(now), now));
        assert!(enrollment.advance(1, Some(now), now));
        assert_eq!(enrollment.cursor, 2);
    }

    #[test]
    fn terminal_states_never_reopen() {
        let company = Uuid::new_v4();
        let seq = three_step_sequence(company);
        let lead = Lead::new(company, LeadTemperature::Hot);
        let now = Utc::now();
        let mut enrollment = Enrollment::new(&lead, &seq, now);

        assert!(enrollment.cancel(EnrollmentReason::ManualCancel, now));
        assert!(!enrollment.resume(now));
        assert!(!enrollment.complete(EnrollmentReason::SequenceExhausted, now));
        assert!(!enrollment.advance(3, None, now));
        assert_eq!(enrollment.status, EnrollmentStatus::Cancelled);
        assert_eq!(enrollment.reason, Some(EnrollmentReason::ManualCancel));
    }

    #[test]
    fn pause_then_resume_is_due_immediately() {
        let company = Uuid::new_v4();
        let seq = three_step_sequence(company);
        let lead = Lead::new(company, LeadTemperature::Cold);
        let now = Utc::now();
        let mut enrollment = Enrollment::new(&lead, &seq, now);
        enrollment.last_evaluated_at = Some(now);

        assert!(enrollment.pause(EnrollmentReason::CreditExhausted, now));
        assert!(enrollment.next_fire_time.is_none());
        assert!(!enrollment.is_due(now));

        let later = now + Duration::minutes(5);
        assert!(enrollment.resume(later));
        assert!(enrollment.reason.is_none());
        assert!(enrollment.is_due(later));
    }

    #[test]
    fn advance_without_next_step_completes() {
        let company = Uuid::new_v4();
        let seq = three_step_sequence(company);
        let lead = Lead::new(company, LeadTemperature::Cold);
        let now = Utc::now();
        let mut enrollment = Enrollment::new(&lead, &seq, now);

        enrollment.advance(3, None, now);
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert_eq!(enrollment.reason, Some(EnrollmentReason::SequenceExhausted));
        assert!(enrollment.next_fire_time.is_none());
    }

    #[test]
    fn reason_serializes_with_kind_tag() {
        let reason = EnrollmentReason::MaxRetriesExceeded {
            last_error: "smtp 451".to_string(),
        };
        let value = serde_json::to_value(&reason).unwrap();
        assert_eq!(value["kind"], "max_retries_exceeded");
        assert_eq!(value["last_error"], "smtp 451");
        assert_eq!(reason.to_string(), "max-retries-exceeded: smtp 451");
    }

    #[test]
    fn enum_round_trips_through_column_text() {
        for status in [
            EnrollmentStatus::Active,
            EnrollmentStatus::Paused,
            EnrollmentStatus::Completed,
            EnrollmentStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<EnrollmentStatus>().unwrap(), status);
        }
        assert!("lukewarm".parse::<LeadTemperature>().is_err());
    }

    #[test]
    fn huge_delays_saturate_instead_of_overflowing() {
        let company = Uuid::new_v4();
        let seq = EngagementSequence::new(
            company,
            vec![SequenceStep::new(1, ActionKind::Wait, u64::MAX, json!({}))],
        )
        .unwrap();
        let lead = Lead::new(company, LeadTemperature::Cold);

        let enrollment = Enrollment::new(&lead, &seq, Utc::now());
        assert_eq!(enrollment.next_fire_time, Some(DateTime::<Utc>::MAX_UTC));
    }
}
