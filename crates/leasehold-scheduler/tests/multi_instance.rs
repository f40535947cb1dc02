//! Several simulated instances, each with its own connection to one SQLite
//! file, sharing a hand-driven clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use leasehold_core::Ticket;
use leasehold_scheduler::{
    Clock, Database, FailurePolicy, LeaseManager, ManualClock, RunAttempt, RunOutcome,
    ScheduleDefinition, Scheduler, SchedulerError, SchedulerSettings, TaskCoordinator,
    TickOutcome,
};
use leasehold_scheduler::{lock_store::LockStore, run_store::RunStore};
use tempfile::TempDir;

struct Cluster {
    _dir: TempDir,
    path: std::path::PathBuf,
    clock: ManualClock,
}

impl Cluster {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leasehold.db");
        Self {
            _dir: dir,
            path,
            clock: ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()),
        }
    }

    fn connect(&self) -> Database {
        Database::open(&self.path, Duration::from_secs(5)).unwrap()
    }

    fn leases(&self) -> LeaseManager {
        LeaseManager::new(LockStore::new(self.connect(), Arc::new(self.clock.clone())))
    }

    fn coordinator(&self) -> TaskCoordinator {
        TaskCoordinator::new(
            RunStore::new(self.connect(), Arc::new(self.clock.clone())),
            FailurePolicy::Cadence,
        )
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.connect(),
            Arc::new(self.clock.clone()),
            SchedulerSettings {
                poll_interval: Duration::from_millis(10),
                ..SchedulerSettings::default()
            },
        )
    }
}

fn one_minute_timeout() -> ScheduleDefinition {
    ScheduleDefinition::every(Duration::from_secs(3600), Duration::from_secs(60))
}

#[test]
fn mutual_exclusion_across_instances() {
    let cluster = Cluster::new();
    let instances: Vec<LeaseManager> = (0..4).map(|_| cluster.leases()).collect();

    for step in 0..6 {
        let winners = instances
            .iter()
            .filter(|leases| {
                leases
                    .try_acquire_or_renew("nightly-export", &Ticket::new(), Duration::from_secs(30))
                    .unwrap()
            })
            .count();
        // The first window opens with one winner; inside it nobody else wins.
        let expected = if step % 3 == 0 { 1 } else { 0 };
        assert_eq!(winners, expected, "step {step}");
        cluster.clock.advance(chrono::Duration::seconds(10));
    }
}

#[test]
fn concurrent_claims_from_threads_have_one_winner() {
    let cluster = Cluster::new();
    cluster.coordinator().register("t", &one_minute_timeout(), false).unwrap();

    let claims = Arc::new(AtomicUsize::new(0));
    let threads: Vec<_> = (0..6)
        .map(|_| {
            let coordinator = cluster.coordinator();
            let claims = claims.clone();
            std::thread::spawn(move || {
                match coordinator.attempt_run("t", &one_minute_timeout()).unwrap() {
                    RunAttempt::Claimed(_) => {
                        claims.fetch_add(1, Ordering::SeqCst);
                    }
                    RunAttempt::AlreadyRunning { .. } => {}
                    RunAttempt::NotDue { .. } => panic!("task should be due"),
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(claims.load(Ordering::SeqCst), 1);
}

#[test]
fn crashed_holder_is_reclaimed_after_timeout() {
    let cluster = Cluster::new();
    let a = cluster.coordinator();
    let b = cluster.coordinator();
    a.register("t", &one_minute_timeout(), false).unwrap();
    b.register("t", &one_minute_timeout(), false).unwrap();

    let RunAttempt::Claimed(_crashed) = a.attempt_run("t", &one_minute_timeout()).unwrap() else {
        panic!("first claim should win");
    };
    assert!(matches!(
        b.attempt_run("t", &one_minute_timeout()).unwrap(),
        RunAttempt::AlreadyRunning { .. }
    ));

    cluster.clock.advance(chrono::Duration::seconds(61));
    assert!(matches!(
        b.attempt_run("t", &one_minute_timeout()).unwrap(),
        RunAttempt::Claimed(_)
    ));
}

#[test]
fn stale_completion_leaves_newer_run_untouched() {
    let cluster = Cluster::new();
    let a = cluster.coordinator();
    let b = cluster.coordinator();
    a.register("t", &one_minute_timeout(), false).unwrap();

    let RunAttempt::Claimed(t1) = a.attempt_run("t", &one_minute_timeout()).unwrap() else {
        panic!("a should claim");
    };
    cluster.clock.advance(chrono::Duration::seconds(61));
    let RunAttempt::Claimed(t2) = b.attempt_run("t", &one_minute_timeout()).unwrap() else {
        panic!("b should reclaim");
    };
    let before = b.get_task("t").unwrap().unwrap();

    assert!(!t1.complete(&RunOutcome::Succeeded).unwrap());
    let after = b.get_task("t").unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(after.current_run_ticket.as_ref(), Some(t2.ticket()));

    assert!(t2.complete(&RunOutcome::Succeeded).unwrap());
}

#[test]
fn next_run_follows_completion_time() {
    let cluster = Cluster::new();
    let coordinator = cluster.coordinator();
    coordinator.register("t", &one_minute_timeout(), false).unwrap();

    let RunAttempt::Claimed(run) = coordinator.attempt_run("t", &one_minute_timeout()).unwrap()
    else {
        panic!("should claim");
    };
    cluster.clock.advance(chrono::Duration::seconds(37));
    let finished = cluster.clock.now();
    assert!(run.complete(&RunOutcome::Succeeded).unwrap());

    let row = cluster.coordinator().get_task("t").unwrap().unwrap();
    assert_eq!(row.next_run_start_at, Some(finished + chrono::Duration::hours(1)));
}

#[tokio::test]
async fn two_schedulers_run_a_task_once_per_cycle() {
    let cluster = Cluster::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let schedulers: Vec<Scheduler> = (0..3).map(|_| cluster.scheduler()).collect();
    for scheduler in &schedulers {
        let runs = runs.clone();
        scheduler
            .schedule_task("digest", one_minute_timeout(), move |_ctx| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
            .unwrap();
    }

    let mut ran = 0;
    for scheduler in &schedulers {
        if let TickOutcome::Ran(_) = scheduler.run_task_once("digest").await.unwrap() {
            ran += 1;
        }
    }
    assert_eq!(ran, 1);

    cluster.clock.advance(chrono::Duration::hours(1));
    for scheduler in schedulers.iter().rev() {
        scheduler.run_task_once("digest").await.unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn conflicting_registration_from_another_instance_fails() {
    let cluster = Cluster::new();
    cluster
        .scheduler()
        .schedule_task("t", one_minute_timeout(), |_ctx| async { anyhow::Ok(()) })
        .unwrap();

    let err = cluster
        .scheduler()
        .schedule_task(
            "t",
            ScheduleDefinition::every(Duration::from_secs(300), Duration::from_secs(60)),
            |_ctx| async { anyhow::Ok(()) },
        )
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ConflictingSchedule { .. }));

    // An equivalent definition from a fresh instance is fine.
    cluster
        .scheduler()
        .schedule_task("t", one_minute_timeout(), |_ctx| async { anyhow::Ok(()) })
        .unwrap();
}
