mod harness;

use outreach_common::{EnrollmentReason, EnrollmentStatus, LeadTemperature, SequencerError};
use outreach_sequencer::ledger::CreditLedger;
use outreach_sequencer::leads::LeadStore;
use outreach_sequencer::EngagementEvent;

use harness::{hours, message, retryable, t0, wait_for_reply, Harness};

const DAY: u64 = 86_400;

#[tokio::test]
async fn reply_skips_a_pending_wait_for_reply_step() {
    let h = Harness::new(10).await;
    let seq = h
        .sequence(vec![message(1, 0), wait_for_reply(2, DAY), message(3, 0)])
        .await;
    let enrollment = h.enrolled(&seq, t0()).await;

    h.sequencer.tick(t0()).await.unwrap();
    assert_eq!(h.get(&enrollment).await.next_fire_time, Some(t0() + hours(24)));

    let replied_at = t0() + hours(1);
    let outcome = h
        .sequencer
        .handle(
            EngagementEvent::LeadReplied {
                lead_id: enrollment.lead_id,
            },
            replied_at,
        )
        .await
        .unwrap();
    assert_eq!(outcome.touched, vec![enrollment.id]);

    let e = h.get(&enrollment).await;
    assert_eq!(e.cursor, 2);
    assert_eq!(e.next_fire_time, Some(replied_at));

    let lead = h.mem.leads.lead(enrollment.lead_id).await.unwrap().unwrap();
    assert_eq!(lead.reply_count, 1);
    assert_eq!(lead.last_replied_at, Some(replied_at));

    h.sequencer.tick(replied_at).await.unwrap();
    let e = h.get(&enrollment).await;
    assert_eq!(e.status, EnrollmentStatus::Completed);

    // The skipped wait cost nothing.
    assert_eq!(h.debits().await, 2);
    assert_eq!(h.executor.calls().len(), 2);
}

#[tokio::test]
async fn reply_leaves_other_schedules_alone() {
    let h = Harness::new(10).await;
    let seq = h.sequence(vec![message(1, 0), message(2, DAY)]).await;
    let enrollment = h.enrolled(&seq, t0()).await;
    h.sequencer.tick(t0()).await.unwrap();
    let before = h.get(&enrollment).await;

    let outcome = h
        .sequencer
        .handle(
            EngagementEvent::LeadReplied {
                lead_id: enrollment.lead_id,
            },
            t0() + hours(1),
        )
        .await
        .unwrap();
    assert!(outcome.touched.is_empty());

    let after = h.get(&enrollment).await;
    assert_eq!(after.cursor, before.cursor);
    assert_eq!(after.next_fire_time, before.next_fire_time);
    assert_eq!(after.revision, before.revision);
}

#[tokio::test]
async fn conversion_cancels_the_open_enrollment() {
    let h = Harness::new(10).await;
    let seq = h.sequence(vec![message(1, 0), message(2, DAY)]).await;
    let enrollment = h.enrolled(&seq, t0()).await;

    h.sequencer
        .handle(
            EngagementEvent::TemperatureOverride {
                lead_id: enrollment.lead_id,
                temperature: LeadTemperature::Converted,
            },
            t0(),
        )
        .await
        .unwrap();

    let e = h.get(&enrollment).await;
    assert_eq!(e.status, EnrollmentStatus::Cancelled);
    assert_eq!(e.reason, Some(EnrollmentReason::LeadConverted));

    // Nothing further runs for it.
    assert_eq!(h.sequencer.tick(t0()).await.unwrap().due, 0);
    assert!(h.executor.calls().is_empty());

    let err = h
        .sequencer
        .enroll(enrollment.lead_id, seq.id, t0() + hours(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SequencerError::LeadConverted(_)));
}

#[tokio::test]
async fn warming_a_lead_does_not_touch_enrollments() {
    let h = Harness::new(10).await;
    let seq = h.sequence(vec![message(1, 0)]).await;
    let enrollment = h.enrolled(&seq, t0()).await;

    let outcome = h
        .sequencer
        .handle(
            EngagementEvent::TemperatureOverride {
                lead_id: enrollment.lead_id,
                temperature: LeadTemperature::Hot,
            },
            t0(),
        )
        .await
        .unwrap();
    assert!(outcome.touched.is_empty());

    let lead = h.mem.leads.lead(enrollment.lead_id).await.unwrap().unwrap();
    assert_eq!(lead.temperature, LeadTemperature::Hot);
    assert_eq!(h.get(&enrollment).await.status, EnrollmentStatus::Active);
}

#[tokio::test]
async fn manual_cancel_of_idle_enrollment() {
    let h = Harness::new(10).await;
    let seq = h.sequence(vec![message(1, 0), message(2, DAY)]).await;
    let enrollment = h.enrolled(&seq, t0()).await;

    let outcome = h
        .sequencer
        .handle(
            EngagementEvent::ManualCancel {
                enrollment_id: enrollment.id,
            },
            t0(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.touched, vec![enrollment.id]);

    let e = h.get(&enrollment).await;
    assert_eq!(e.status, EnrollmentStatus::Cancelled);
    assert_eq!(e.reason, Some(EnrollmentReason::ManualCancel));
    assert!(!h.mem.journal.events_of_type("notification.enrollment-cancelled").is_empty());

    // A second cancel leaves the terminal state unchanged.
    let again = h
        .sequencer
        .handle(
            EngagementEvent::ManualCancel {
                enrollment_id: enrollment.id,
            },
            t0() + hours(1),
        )
        .await
        .unwrap();
    let e2 = h.get(&enrollment).await;
    assert_eq!(e2.revision, e.revision);
    assert_eq!(e2.updated_at, e.updated_at);
    assert_eq!(again.touched, vec![enrollment.id]);
}

#[tokio::test]
async fn completed_enrollment_is_not_cancelled() {
    let h = Harness::new(10).await;
    let seq = h.sequence(vec![message(1, 0)]).await;
    let enrollment = h.enrolled(&seq, t0()).await;
    h.sequencer.tick(t0()).await.unwrap();

    let outcome = h
        .sequencer
        .handle(
            EngagementEvent::ManualCancel {
                enrollment_id: enrollment.id,
            },
            t0() + hours(1),
        )
        .await
        .unwrap();
    assert!(outcome.touched.is_empty());
    assert_eq!(h.get(&enrollment).await.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn replenish_only_resumes_credit_pauses() {
    let config = outreach_sequencer::SchedulerConfig {
        retry: outreach_sequencer::RetryPolicy::new().max_attempts(1),
        ..Default::default()
    };
    let h = Harness::with_config(1, config).await;
    let seq = h.sequence(vec![message(1, 0), message(2, 0)]).await;

    // One enrollment pauses on retries, the other on credit.
    h.executor.push(retryable("down"));
    let failing = h.enrolled(&seq, t0()).await;
    h.sequencer.tick(t0()).await.unwrap();
    assert_eq!(h.get(&failing).await.status, EnrollmentStatus::Paused);

    let starving = h.enrolled(&seq, t0()).await;
    h.sequencer.tick(t0() + hours(1)).await.unwrap();
    h.sequencer.tick(t0() + hours(2)).await.unwrap();
    let s = h.get(&starving).await;
    assert_eq!(s.reason, Some(EnrollmentReason::CreditExhausted));

    let outcome = h
        .sequencer
        .handle(
            EngagementEvent::CreditsReplenished {
                company_id: h.company.id,
                amount: 3,
            },
            t0() + hours(3),
        )
        .await
        .unwrap();
    assert_eq!(outcome.touched, vec![starving.id]);
    assert_eq!(h.get(&starving).await.status, EnrollmentStatus::Active);
    assert_eq!(h.get(&failing).await.status, EnrollmentStatus::Paused);
    assert_eq!(h.balance().await, 3);
}

#[tokio::test]
async fn zero_replenish_still_resumes() {
    let h = Harness::new(0).await;
    let seq = h.sequence(vec![message(1, 0)]).await;
    let enrollment = h.enrolled(&seq, t0()).await;
    h.sequencer.tick(t0()).await.unwrap();
    assert_eq!(h.get(&enrollment).await.status, EnrollmentStatus::Paused);

    h.sequencer
        .handle(
            EngagementEvent::CreditsReplenished {
                company_id: h.company.id,
                amount: 0,
            },
            t0() + hours(1),
        )
        .await
        .unwrap();
    assert_eq!(h.get(&enrollment).await.status, EnrollmentStatus::Active);
    assert!(h.mem.ledger.transactions(h.company.id).await.unwrap().is_empty());

    // Still no credit, so the next tick pauses it again.
    h.sequencer.tick(t0() + hours(1)).await.unwrap();
    assert_eq!(h.get(&enrollment).await.status, EnrollmentStatus::Paused);
}

#[tokio::test]
async fn resume_reactivates_a_retry_pause() {
    let config = outreach_sequencer::SchedulerConfig {
        retry: outreach_sequencer::RetryPolicy::new().max_attempts(1),
        ..Default::default()
    };
    let h = Harness::with_config(5, config).await;
    h.executor.push(retryable("down"));
    let seq = h.sequence(vec![message(1, 0)]).await;
    let enrollment = h.enrolled(&seq, t0()).await;
    h.sequencer.tick(t0()).await.unwrap();

    let paused = h.get(&enrollment).await;
    assert!(matches!(
        paused.reason,
        Some(EnrollmentReason::MaxRetriesExceeded { .. })
    ));

    h.sequencer
        .handle(
            EngagementEvent::ResumeEnrollment {
                enrollment_id: enrollment.id,
            },
            t0() + hours(1),
        )
        .await
        .unwrap();
    let resumed = h.get(&enrollment).await;
    assert_eq!(resumed.status, EnrollmentStatus::Active);
    assert_eq!(resumed.attempts, 0);
    assert_eq!(resumed.next_fire_time, Some(t0() + hours(1)));

    h.sequencer.tick(t0() + hours(1)).await.unwrap();
    assert_eq!(h.get(&enrollment).await.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn deactivating_a_sequence_cancels_and_blocks_enrollment() {
    let h = Harness::new(10).await;
    let seq = h.sequence(vec![message(1, DAY)]).await;
    let a = h.enrolled(&seq, t0()).await;
    let b = h.enrolled(&seq, t0()).await;

    let outcome = h
        .sequencer
        .handle(
            EngagementEvent::SequenceDeactivated {
                sequence_id: seq.id,
            },
            t0(),
        )
        .await
        .unwrap();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(outcome.touched, expected);

    for e in [&a, &b] {
        let e = h.get(e).await;
        assert_eq!(e.status, EnrollmentStatus::Cancelled);
        assert_eq!(e.reason, Some(EnrollmentReason::SequenceDeactivated));
    }

    let lead = h.lead().await;
    let err = h.sequencer.enroll(lead.id, seq.id, t0()).await.unwrap_err();
    assert!(matches!(err, SequencerError::SequenceInactive(_)));
}

#[tokio::test]
async fn every_event_is_journaled_even_when_it_fails() {
    let h = Harness::new(1).await;
    let unknown = uuid::Uuid::new_v4();

    let err = h
        .sequencer
        .handle(EngagementEvent::ResumeEnrollment { enrollment_id: unknown }, t0())
        .await
        .unwrap_err();
    assert!(matches!(err, SequencerError::NotFound { .. }));

    let journaled = h.mem.journal.events_of_type("event.resume_enrollment");
    assert_eq!(journaled.len(), 1);
    assert_eq!(journaled[0].subject_id, Some(unknown));
    assert_eq!(journaled[0].actor.as_deref(), Some("ingestor"));
    assert_eq!(
        journaled[0].decode::<EngagementEvent>().unwrap(),
        EngagementEvent::ResumeEnrollment { enrollment_id: unknown }
    );
}

#[tokio::test]
async fn enrollment_rules() {
    let h = Harness::new(1).await;
    let seq = h.sequence(vec![message(1, DAY)]).await;
    let lead = h.lead().await;

    h.sequencer.enroll(lead.id, seq.id, t0()).await.unwrap();
    let err = h.sequencer.enroll(lead.id, seq.id, t0()).await.unwrap_err();
    assert!(matches!(err, SequencerError::AlreadyEnrolled { .. }));

    let other = Harness::new(1).await;
    let foreign = other.sequence(vec![message(1, 0)]).await;
    h.sequencer.publish_sequence(foreign.clone()).await.unwrap();
    let fresh = h.lead().await;
    let err = h.sequencer.enroll(fresh.id, foreign.id, t0()).await.unwrap_err();
    assert!(matches!(err, SequencerError::CompanyMismatch));

    let err = h
        .sequencer
        .enroll(fresh.id, uuid::Uuid::new_v4(), t0())
        .await
        .unwrap_err();
    assert!(matches!(err, SequencerError::NotFound { entity: "sequence", .. }));
}
