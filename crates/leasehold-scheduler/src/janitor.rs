use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::TaskCoordinator;
use crate::engine::MIN_TICK;
use crate::error::Result;
use crate::lease::LeaseManager;

/// How many stale rows one sweep cleared.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub runs: usize,
    pub mutexes: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.runs == 0 && self.mutexes == 0
    }
}

/// Clears run tickets and mutex leases that expired without being released.
///
/// Claims already treat expired tickets as free, so the janitor is only
/// hygiene: it keeps inspection output honest after crashes.
#[derive(Clone)]
pub struct Janitor {
    coordinator: TaskCoordinator,
    leases: LeaseManager,
}

impl Janitor {
    pub fn new(coordinator: TaskCoordinator, leases: LeaseManager) -> Self {
        Self {
            coordinator,
            leases,
        }
    }

    /// One pass over both tables.
    pub fn sweep(&self) -> Result<SweepReport> {
        let report = SweepReport {
            runs: self.coordinator.reset_expired_runs()?,
            mutexes: self.leases.reset_expired()?,
        };
        if report.is_empty() {
            debug!("janitor sweep found nothing expired");
        } else {
            warn!(
                runs = report.runs,
                mutexes = report.mutexes,
                "janitor reclaimed expired leases"
            );
        }
        Ok(report)
    }

    /// Sweep every `every` until `shutdown` fires.
    pub async fn run(self, every: Duration, shutdown: CancellationToken) {
        info!(interval_secs = every.as_secs(), "janitor started");
        let mut interval = tokio::time::interval(every.max(MIN_TICK));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("janitor stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep() {
                        if e.is_transient() {
                            warn!(error = %e, "janitor sweep skipped, store busy");
                        } else {
                            error!(error = %e, "janitor sweep failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::lock_store::LockStore;
    use crate::run_store::RunStore;
    use crate::schedule::{FailurePolicy, ScheduleDefinition};
    use chrono::{TimeZone, Utc};
    use leasehold_core::Ticket;
    use std::sync::Arc;

    #[test]
    fn sweep_clears_both_tables() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
        let db = Database::open_in_memory().unwrap();
        let coordinator = TaskCoordinator::new(
            RunStore::new(db.clone(), Arc::new(clock.clone())),
            FailurePolicy::Cadence,
        );
        let leases = LeaseManager::new(LockStore::new(db, Arc::new(clock.clone())));
        let janitor = Janitor::new(coordinator.clone(), leases.clone());

        let def = ScheduleDefinition::every(Duration::from_secs(3600), Duration::from_secs(30));
        coordinator.register("t", &def, false).unwrap();
        coordinator.attempt_run("t", &def).unwrap();
        leases
            .try_acquire_or_renew("m", &Ticket::new(), Duration::from_secs(30))
            .unwrap();

        assert!(janitor.sweep().unwrap().is_empty());
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(janitor.sweep().unwrap(), SweepReport { runs: 1, mutexes: 1 });
        assert!(janitor.sweep().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_exits_on_cancel() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
        let db = Database::open_in_memory().unwrap();
        let janitor = Janitor::new(
            TaskCoordinator::new(
                RunStore::new(db.clone(), Arc::new(clock.clone())),
                FailurePolicy::Cadence,
            ),
            LeaseManager::new(LockStore::new(db, Arc::new(clock))),
        );
        let token = CancellationToken::new();
        let handle = tokio::spawn(janitor.run(Duration::from_millis(10), token.clone()));
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn zero_interval_does_not_panic() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
        let db = Database::open_in_memory().unwrap();
        let janitor = Janitor::new(
            TaskCoordinator::new(
                RunStore::new(db.clone(), Arc::new(clock.clone())),
                FailurePolicy::Cadence,
            ),
            LeaseManager::new(LockStore::new(db, Arc::new(clock))),
        );
        let token = CancellationToken::new();
        let handle = tokio::spawn(janitor.run(Duration::ZERO, token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
