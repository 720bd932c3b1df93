//! Sequence scheduler: one `tick(now)` evaluates every due enrollment and
//! moves each forward by at most one step.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use outreach_common::{
    fire_at, AppConfig, Enrollment, EnrollmentReason, EnrollmentStatus, Result, SequenceStep,
    SequencerError,
};

use crate::deps::SequencerDeps;
use crate::executor::{ExecutionResult, StepContext};
use crate::ledger::Reservation;
use crate::leads::{apply_transition, Transition};
use crate::locks::InFlight;
use crate::retry::RetryPolicy;

const COMMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Enrollments evaluated concurrently within one tick.
    pub max_concurrency: usize,
    /// Upper bound on due enrollments picked up per tick.
    pub batch_size: usize,
    pub executor_timeout: Duration,
    pub retry: RetryPolicy,
    /// Re-read/re-apply rounds after a concurrent write before giving up.
    pub max_conflict_retries: u32,
    pub credits_per_step: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            batch_size: 1000,
            executor_timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
            max_conflict_retries: 3,
            credits_per_step: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            max_concurrency: config.tick_max_concurrency.max(1),
            executor_timeout: Duration::from_secs(config.executor_timeout_secs),
            retry: RetryPolicy::new()
                .initial_delay(Duration::from_secs(config.retry_initial_delay_secs))
                .max_delay(Duration::from_secs(config.retry_max_delay_secs))
                .max_attempts(config.retry_max_attempts),
            ..Self::default()
        }
    }
}

/// Where one enrollment ended up after a tick evaluated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// Not evaluated: no longer due, or changed by someone else mid-flight.
    Skipped,
    /// A step ran and more remain.
    Advanced,
    /// A retryable failure; another attempt is scheduled.
    Retrying,
    Paused,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub outcome: TickOutcome,
    /// Whether a step executed successfully and its credit was spent.
    pub executed: bool,
}

impl Evaluation {
    fn skipped() -> Self {
        Self {
            outcome: TickOutcome::Skipped,
            executed: false,
        }
    }

    fn of(enrollment: &Enrollment, executed: bool) -> Self {
        let outcome = match enrollment.status {
            EnrollmentStatus::Active if executed => TickOutcome::Advanced,
            EnrollmentStatus::Active => TickOutcome::Retrying,
            EnrollmentStatus::Paused => TickOutcome::Paused,
            EnrollmentStatus::Completed => TickOutcome::Completed,
            EnrollmentStatus::Cancelled => TickOutcome::Cancelled,
        };
        Self { outcome, executed }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub executed: usize,
    pub advanced: usize,
    pub retrying: usize,
    pub paused: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub errored: usize,
}

impl TickReport {
    fn record(&mut self, evaluation: &Evaluation) {
        if evaluation.executed {
            self.executed += 1;
        }
        match evaluation.outcome {
            TickOutcome::Skipped => self.skipped += 1,
            TickOutcome::Advanced => self.advanced += 1,
            TickOutcome::Retrying => self.retrying += 1,
            TickOutcome::Paused => self.paused += 1,
            TickOutcome::Completed => self.completed += 1,
            TickOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

pub struct Scheduler {
    deps: SequencerDeps,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(deps: SequencerDeps, config: SchedulerConfig) -> Self {
        Self { deps, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Evaluate every enrollment due at `now`. Errors are isolated per
    /// enrollment; only a failure to list the due set fails the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self
            .deps
            .leads
            .due_enrollments(now, self.config.batch_size)
            .await?;

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let results: Vec<(Uuid, Result<Evaluation>)> = stream::iter(due)
            .map(|enrollment| async move {
                let id = enrollment.id;
                (id, self.evaluate(id, now).await)
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for (enrollment_id, result) in results {
            match result {
                Ok(evaluation) => report.record(&evaluation),
                Err(e) => {
                    report.errored += 1;
                    let status = self
                        .deps
                        .leads
                        .enrollment(enrollment_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|e| e.status.as_str());
                    let status = status.unwrap_or("unknown");
                    if e.is_recoverable() {
                        warn!(%enrollment_id, reason = %e, status, "Enrollment evaluation deferred");
                    } else {
                        error!(%enrollment_id, reason = %e, status, "Enrollment evaluation failed");
                    }
                }
            }
        }

        info!(
            due = report.due,
            executed = report.executed,
            paused = report.paused,
            completed = report.completed,
            cancelled = report.cancelled,
            retrying = report.retrying,
            errored = report.errored,
            "Tick complete"
        );
        Ok(report)
    }

    /// Evaluate one enrollment under its lock.
    pub async fn evaluate(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> Result<Evaluation> {
        let _guard = self.deps.locks.enrollment(enrollment_id).await;
        let mut in_flight = self.deps.locks.begin_execution(enrollment_id);

        let Some(enrollment) = self.deps.leads.enrollment(enrollment_id).await? else {
            return Ok(Evaluation::skipped());
        };
        if !enrollment.is_due(now) {
            debug!(%enrollment_id, "No longer due, skipping");
            return Ok(Evaluation::skipped());
        }
        let Some(enrollment) = self.claim(enrollment, now).await? else {
            return Ok(Evaluation::skipped());
        };

        let sequence = self
            .deps
            .sequences
            .version(enrollment.sequence_id, enrollment.sequence_version)
            .await?;
        let Some(sequence) = sequence else {
            warn!(
                %enrollment_id,
                sequence_id = %enrollment.sequence_id,
                version = enrollment.sequence_version,
                "Sequence definition missing"
            );
            return self
                .finish(enrollment, now, move |e| {
                    e.cancel(EnrollmentReason::SequenceMissing, now)
                })
                .await;
        };

        let Some(step) = sequence.step_after(enrollment.cursor).cloned() else {
            return self
                .finish(enrollment, now, move |e| {
                    e.complete(EnrollmentReason::SequenceExhausted, now)
                })
                .await;
        };

        let lead = self
            .deps
            .leads
            .lead(enrollment.lead_id)
            .await?
            .ok_or_else(|| SequencerError::not_found("lead", enrollment.lead_id))?;
        if lead.temperature.is_terminal() {
            return self
                .finish(enrollment, now, move |e| {
                    e.complete(EnrollmentReason::LeadConverted, now)
                })
                .await;
        }

        if in_flight.is_cancelled() {
            return self.cancel_manually(enrollment, now).await;
        }

        let reservation = match self.reserve(&enrollment).await {
            Ok(reservation) => reservation,
            Err(SequencerError::InsufficientCredit { .. }) => {
                // Retry under the company lock so a concurrent replenishment
                // either funds this attempt or finds the pause and resumes it.
                let _company_guard = self.deps.locks.company(enrollment.company_id).await;
                match self.reserve(&enrollment).await {
                    Ok(reservation) => reservation,
                    Err(SequencerError::InsufficientCredit {
                        company_id,
                        available,
                        ..
                    }) => {
                        info!(%enrollment_id, %company_id, available, "Out of credits, pausing");
                        return self
                            .finish(enrollment, now, move |e| {
                                e.pause(EnrollmentReason::CreditExhausted, now)
                            })
                            .await;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let ctx = StepContext {
            enrollment_id: enrollment.id,
            lead_id: enrollment.lead_id,
            company_id: enrollment.company_id,
            sequence_id: enrollment.sequence_id,
            sequence_version: enrollment.sequence_version,
            step_position: step.position,
            attempt: enrollment.attempts + 1,
        };

        let Some(result) = self.run_step(&ctx, &step, &mut in_flight).await else {
            info!(%enrollment_id, "Cancelled while executing, releasing credit");
            self.deps.ledger.release(reservation).await?;
            return self.cancel_manually(enrollment, now).await;
        };

        match result {
            ExecutionResult::Success => {
                let next_fire = sequence
                    .step_after(step.position)
                    .map(|next| fire_at(now, next.delay_after_previous()));
                let position = step.position;
                let transition = self
                    .transition(enrollment, move |e| e.advance(position, next_fire, now))
                    .await;

                // The step ran, so its credit is spent whatever happens to
                // the write below.
                self.settle(reservation, enrollment_id).await;

                match transition? {
                    Transition::Applied(saved) => {
                        debug!(%enrollment_id, cursor = saved.cursor, "Step executed");
                        self.deps.notifier.notify_enrollment(&saved, now).await;
                        Ok(Evaluation::of(&saved, true))
                    }
                    Transition::Superseded(current) => {
                        warn!(
                            %enrollment_id,
                            status = current.status.as_str(),
                            "Enrollment changed during execution"
                        );
                        Ok(Evaluation {
                            outcome: TickOutcome::Skipped,
                            executed: true,
                        })
                    }
                }
            }
            ExecutionResult::RetryableFailure(message) => {
                self.deps.ledger.release(reservation).await?;
                let attempt = enrollment.attempts + 1;
                match self.config.retry.next_delay(attempt) {
                    Some(delay) => {
                        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
                        let at = fire_at(now, delay);
                        warn!(
                            %enrollment_id,
                            attempt,
                            error = %SequencerError::RetryableExecutorFailure(message),
                            retry_at = %at,
                            "Step failed, will retry"
                        );
                        self.finish(enrollment, now, move |e| e.retry_at(at, now)).await
                    }
                    None => {
                        warn!(
                            %enrollment_id,
                            attempt,
                            error = %SequencerError::RetryableExecutorFailure(message.clone()),
                            "Step failed, retries exhausted"
                        );
                        self.finish(enrollment, now, move |e| {
                            e.pause(
                                EnrollmentReason::MaxRetriesExceeded {
                                    last_error: message.clone(),
                                },
                                now,
                            )
                        })
                        .await
                    }
                }
            }
            ExecutionResult::FatalFailure(message) => {
                self.deps.ledger.release(reservation).await?;
                warn!(
                    %enrollment_id,
                    error = %SequencerError::FatalExecutorFailure(message.clone()),
                    "Step failed permanently"
                );
                self.finish(enrollment, now, move |e| {
                    e.cancel(
                        EnrollmentReason::FatalFailure {
                            error: message.clone(),
                        },
                        now,
                    )
                })
                .await
            }
        }
    }

    async fn reserve(&self, enrollment: &Enrollment) -> Result<Reservation> {
        self.deps
            .ledger
            .reserve(
                enrollment.company_id,
                self.config.credits_per_step,
                Some(enrollment.id),
            )
            .await
    }

    /// Commit the credit for a step that ran. The enrollment has already moved
    /// on, so a failed commit is retried and then logged, never returned.
    async fn settle(&self, reservation: Reservation, enrollment_id: Uuid) {
        let mut reservation = reservation;
        let mut attempt = 1;
        loop {
            let again = reservation.reissue();
            match self.deps.ledger.commit(reservation).await {
                Ok(_) => return,
                Err(e) if attempt < COMMIT_ATTEMPTS => {
                    warn!(%enrollment_id, attempt, error = %e, "Credit commit failed, retrying");
                    attempt += 1;
                    reservation = again;
                }
                Err(e) => {
                    error!(
                        %enrollment_id,
                        reservation_id = %again.id(),
                        error = %e,
                        "Credit commit failed for an executed step"
                    );
                    return;
                }
            }
        }
    }

    /// Mark the enrollment evaluated at `now` so an overlapping tick for the
    /// same instant skips it. Returns `None` if it stopped being due.
    async fn claim(&self, mut enrollment: Enrollment, now: DateTime<Utc>) -> Result<Option<Enrollment>> {
        let mut conflicts = 0;
        loop {
            let mut claimed = enrollment.clone();
            claimed.last_evaluated_at = Some(now);

            match self.deps.leads.save_enrollment(&claimed).await {
                Ok(saved) => return Ok(Some(saved)),
                Err(SequencerError::ConcurrentModification { enrollment_id })
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    match self.deps.leads.enrollment(enrollment_id).await? {
                        Some(fresh) if fresh.is_due(now) => enrollment = fresh,
                        _ => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the executor, racing the timeout and a manual cancel. `None`
    /// means the run was cancelled, whatever the executor returned.
    async fn run_step(
        &self,
        ctx: &StepContext,
        step: &SequenceStep,
        in_flight: &mut InFlight<'_>,
    ) -> Option<ExecutionResult> {
        let execution = tokio::time::timeout(
            self.config.executor_timeout,
            self.deps
                .executor
                .execute(ctx, step.action_kind, &step.action_payload),
        );

        let result = tokio::select! {
            biased;
            _ = in_flight.cancelled() => return None,
            result = execution => match result {
                Ok(result) => result,
                Err(_) => ExecutionResult::RetryableFailure(format!(
                    "executor timed out after {}s",
                    self.config.executor_timeout.as_secs()
                )),
            },
        };

        if in_flight.is_cancelled() {
            return None;
        }
        Some(result)
    }

    async fn cancel_manually(&self, enrollment: Enrollment, now: DateTime<Utc>) -> Result<Evaluation> {
        self.finish(enrollment, now, move |e| {
            e.cancel(EnrollmentReason::ManualCancel, now)
        })
        .await
    }

    async fn transition<F>(&self, enrollment: Enrollment, change: F) -> Result<Transition>
    where
        F: Fn(&mut Enrollment) -> bool + Send + Sync,
    {
        apply_transition(
            self.deps.leads.as_ref(),
            enrollment,
            self.config.max_conflict_retries,
            change,
        )
        .await
    }

    /// Apply a transition that spends no credit and notify on its result.
    async fn finish<F>(&self, enrollment: Enrollment, now: DateTime<Utc>, change: F) -> Result<Evaluation>
    where
        F: Fn(&mut Enrollment) -> bool + Send + Sync,
    {
        match self.transition(enrollment, change).await? {
            Transition::Applied(saved) => {
                if let Some(reason) = &saved.reason {
                    info!(
                        enrollment_id = %saved.id,
                        status = saved.status.as_str(),
                        reason = %reason,
                        "Enrollment transitioned"
                    );
                }
                self.deps.notifier.notify_enrollment(&saved, now).await;
                Ok(Evaluation::of(&saved, false))
            }
            Transition::Superseded(_) => Ok(Evaluation::skipped()),
        }
    }
}
