use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use outreach_sequencer::ledger::PgCreditLedger;
use outreach_sequencer::Sequencer;

/// How long a reservation may outlive the executor timeout before it is taken
/// to belong to a process that died mid-step.
const STALE_RESERVATION_GRACE_MINUTES: i64 = 15;

/// Drive `tick(now)` on a fixed interval in the background. When a Postgres
/// ledger is given, each pass also returns credit held by stale reservations.
pub fn spawn(sequencer: Sequencer, every: Duration, ledger: Option<PgCreditLedger>) -> JoinHandle<()> {
    let executor_timeout = sequencer.config().executor_timeout;
    info!(
        interval_secs = every.as_secs(),
        executor_timeout_secs = executor_timeout.as_secs(),
        "Starting scheduler ticker"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            if let Err(e) = sequencer.tick(Utc::now()).await {
                error!(error = %e, "Scheduler tick failed");
            }

            if let Some(ledger) = &ledger {
                let cutoff = stale_cutoff(Utc::now(), executor_timeout);
                if let Err(e) = ledger.release_stale(cutoff).await {
                    warn!(error = %e, "Stale reservation sweep failed");
                }
            }
        }
    })
}

/// Reservations created before this instant are swept. A step still in flight
/// is bounded by the executor timeout, so it is never older than the cutoff.
fn stale_cutoff(now: DateTime<Utc>, executor_timeout: Duration) -> DateTime<Utc> {
    let timeout = chrono::Duration::from_std(executor_timeout).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(timeout)
        .and_then(|t| t.checked_sub_signed(chrono::Duration::minutes(STALE_RESERVATION_GRACE_MINUTES)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sweep_never_reaches_a_step_within_its_timeout() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();

        let cutoff = stale_cutoff(now, Duration::from_secs(20));
        assert_eq!(now - cutoff, chrono::Duration::seconds(20 + 15 * 60));

        // A two-hour executor timeout pushes the sweep back with it.
        let cutoff = stale_cutoff(now, Duration::from_secs(2 * 60 * 60));
        assert!(cutoff < now - chrono::Duration::hours(2));
    }

    #[test]
    fn huge_timeout_disables_the_sweep() {
        let now = Utc::now();
        assert_eq!(stale_cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
