use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use leasehold_core::Ticket;
use rusqlite::OptionalExtension;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::db::{opt_time, store_now, to_db_time, Database};
use crate::error::{Result, SchedulerError};
use crate::schedule::{offset, TaskSettings};
use crate::types::{ClaimOutcome, RunOutcome, TaskRecord};

const TASK_COLUMNS: &str = "id, settings_json, next_run_start_at, current_run_ticket,
     current_run_started_at, current_run_expires_at,
     last_run_ended_at, last_run_status, last_run_error";

/// How a registration was reconciled with the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registered {
    Created,
    Unchanged,
    Replaced { previous: String },
}

/// Row access for the `tasks` table.
#[derive(Clone)]
pub struct RunStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl RunStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        store_now(self.clock.as_ref())
    }

    /// Create the task row, or reconcile with an existing one.
    ///
    /// A new row becomes due after `initial_delay` (immediately when `None`).
    /// An existing row with equivalent settings is left untouched. Differing
    /// settings are a `ConflictingSchedule` error unless `replace` is set.
    #[instrument(skip(self, settings_json, initial_delay), fields(task_id = %id))]
    pub fn register(
        &self,
        id: &str,
        settings_json: &str,
        initial_delay: Option<chrono::Duration>,
        replace: bool,
    ) -> Result<Registered> {
        let next_run = initial_delay
            .map(|d| offset(self.now(), d))
            .transpose()?
            .map(|t| to_db_time(t.trunc_subsecs(3)));
        let requested: TaskSettings = serde_json::from_str(settings_json)?;

        let conn = self.db.lock()?;
        let inserted = conn.execute(
            "INSERT INTO tasks (id, settings_json, next_run_start_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            rusqlite::params![id, settings_json, next_run],
        )?;
        if inserted == 1 {
            info!("task row created");
            return Ok(Registered::Created);
        }

        // Read back: another instance may have created the row first.
        let existing: String = conn.query_row(
            "SELECT settings_json FROM tasks WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        let same = serde_json::from_str::<TaskSettings>(&existing)
            .map(|stored| stored == requested)
            .unwrap_or(false);
        if same {
            debug!("task row already registered with equivalent settings");
            return Ok(Registered::Unchanged);
        }
        if !replace {
            return Err(SchedulerError::ConflictingSchedule {
                id: id.to_string(),
                existing,
                requested: settings_json.to_string(),
            });
        }

        conn.execute(
            "UPDATE tasks SET settings_json = ?2 WHERE id = ?1",
            rusqlite::params![id, settings_json],
        )?;
        warn!(previous = %existing, "stored task settings replaced");
        Ok(Registered::Replaced { previous: existing })
    }

    /// Claim a due, idle task for `ticket` with a lease of `timeout`.
    ///
    /// Due means `next_run_start_at` is unset or has arrived; idle means no
    /// ticket, or a ticket whose lease expired (crash recovery).
    #[instrument(skip(self, ticket, timeout), fields(task_id = %id))]
    pub fn try_claim(
        &self,
        id: &str,
        ticket: &Ticket,
        timeout: chrono::Duration,
    ) -> Result<ClaimOutcome> {
        let now = self.now();
        let expires_at = offset(now, timeout)?.trunc_subsecs(3);
        let now_str = to_db_time(now);

        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE tasks
             SET current_run_ticket = ?2,
                 current_run_started_at = ?3,
                 current_run_expires_at = ?4
             WHERE id = ?1
               AND (next_run_start_at IS NULL OR next_run_start_at <= ?3)
               AND (current_run_ticket IS NULL
                    OR current_run_expires_at IS NULL
                    OR current_run_expires_at <= ?3)",
            rusqlite::params![id, ticket.as_str(), now_str, to_db_time(expires_at)],
        )?;
        if changed == 1 {
            return Ok(ClaimOutcome::Claimed {
                started_at: now,
                expires_at,
            });
        }

        let record = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;

        if record.is_running_at(now) {
            Ok(ClaimOutcome::AlreadyRunning {
                expires_at: record.current_run_expires_at,
            })
        } else {
            Ok(ClaimOutcome::NotDue {
                next_run_start_at: record.next_run_start_at,
            })
        }
    }

    /// Push the run's expiry to now + `timeout` if `ticket` still holds it.
    /// Returns the new expiry, or `None` when the ticket was superseded.
    #[instrument(skip(self, ticket, timeout), fields(task_id = %id))]
    pub fn heartbeat(
        &self,
        id: &str,
        ticket: &Ticket,
        timeout: chrono::Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let expires_at = offset(self.now(), timeout)?.trunc_subsecs(3);
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET current_run_expires_at = ?3
             WHERE id = ?1 AND current_run_ticket = ?2",
            rusqlite::params![id, ticket.as_str(), to_db_time(expires_at)],
        )?;
        Ok((changed == 1).then_some(expires_at))
    }

    /// True while `ticket` is the task's current, unexpired run.
    pub fn still_holds(&self, id: &str, ticket: &Ticket) -> Result<bool> {
        let now_str = to_db_time(self.now());
        let conn = self.db.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE id = ?1 AND current_run_ticket = ?2 AND current_run_expires_at > ?3",
            rusqlite::params![id, ticket.as_str(), now_str],
            |row| row.get(0),
        )?;
        Ok(n == 1)
    }

    /// Release the run held by `ticket` and schedule the next one.
    ///
    /// A report carrying a ticket that no longer matches (the run was
    /// reclaimed after expiry) changes nothing and returns `false`.
    #[instrument(skip(self, ticket, outcome), fields(task_id = %id))]
    pub fn complete(
        &self,
        id: &str,
        ticket: &Ticket,
        finished_at: DateTime<Utc>,
        next_run_start_at: DateTime<Utc>,
        outcome: &RunOutcome,
    ) -> Result<bool> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE tasks
             SET next_run_start_at = ?3,
                 current_run_ticket = NULL,
                 current_run_started_at = NULL,
                 current_run_expires_at = NULL,
                 last_run_ended_at = ?4,
                 last_run_status = ?5,
                 last_run_error = ?6
             WHERE id = ?1 AND current_run_ticket = ?2",
            rusqlite::params![
                id,
                ticket.as_str(),
                to_db_time(next_run_start_at),
                to_db_time(finished_at),
                outcome.status().to_string(),
                outcome.error(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Make an idle task due now.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn trigger(&self, id: &str) -> Result<()> {
        let now_str = to_db_time(self.now());
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET next_run_start_at = ?2
             WHERE id = ?1
               AND (current_run_ticket IS NULL
                    OR current_run_expires_at IS NULL
                    OR current_run_expires_at <= ?2)",
            rusqlite::params![id, now_str],
        )?;
        if changed == 1 {
            info!("task triggered");
            return Ok(());
        }

        let exists: i64 = conn.query_row("SELECT COUNT(*) FROM tasks WHERE id = ?1", [id], |row| {
            row.get(0)
        })?;
        if exists == 0 {
            Err(SchedulerError::TaskNotFound { id: id.to_string() })
        } else {
            Err(SchedulerError::TaskRunning { id: id.to_string() })
        }
    }

    /// Clear run tickets whose lease has expired. Returns how many were reset.
    ///
    /// `next_run_start_at` is left alone, so a reclaimed task stays due.
    #[instrument(skip(self))]
    pub fn reset_expired(&self) -> Result<usize> {
        let now_str = to_db_time(self.now());
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE tasks
             SET current_run_ticket = NULL,
                 current_run_started_at = NULL,
                 current_run_expires_at = NULL
             WHERE current_run_ticket IS NOT NULL
               AND (current_run_expires_at IS NULL OR current_run_expires_at <= ?1)",
            [&now_str],
        )?;
        Ok(changed)
    }

    pub fn get(&self, id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.db.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                row_to_task,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"))?;
        let records = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

/// Map a SQLite row to a `TaskRecord`. Unknown status strings read as `None`.
fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        settings_json: row.get(1)?,
        next_run_start_at: opt_time(row, 2)?,
        current_run_ticket: row.get::<_, Option<String>>(3)?.map(Ticket::from),
        current_run_started_at: opt_time(row, 4)?,
        current_run_expires_at: opt_time(row, 5)?,
        last_run_ended_at: opt_time(row, 6)?,
        last_run_status: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| s.parse().ok()),
        last_run_error: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::schedule::ScheduleDefinition;
    use crate::types::RunStatus;
    use chrono::{Duration, TimeZone};

    const SETTINGS: &str =
        r#"{"version":2,"cadence":"PT1H","timeoutAfterDuration":"PT1M"}"#;

    fn store() -> (RunStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
        let db = Database::open_in_memory().unwrap();
        (RunStore::new(db, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn register_creates_then_is_idempotent() {
        let (store, _) = store();
        assert_eq!(store.register("t", SETTINGS, None, false).unwrap(), Registered::Created);
        assert_eq!(store.register("t", SETTINGS, None, false).unwrap(), Registered::Unchanged);
        // Same settings with different key order are still equivalent.
        let reordered = r#"{"cadence":"PT1H","timeoutAfterDuration":"PT1M","version":2}"#;
        assert_eq!(store.register("t", reordered, None, false).unwrap(), Registered::Unchanged);
        assert!(store.get("t").unwrap().unwrap().next_run_start_at.is_none());
    }

    #[test]
    fn conflicting_registration_fails_unless_replacing() {
        let (store, _) = store();
        store.register("t", SETTINGS, None, false).unwrap();
        let other = ScheduleDefinition::every(
            std::time::Duration::from_secs(60),
            std::time::Duration::from_secs(10),
        )
        .settings_json()
        .unwrap();

        let err = store.register("t", &other, None, false).unwrap_err();
        assert!(matches!(err, SchedulerError::ConflictingSchedule { .. }));
        assert_eq!(store.get("t").unwrap().unwrap().settings_json, SETTINGS);

        let outcome = store.register("t", &other, None, true).unwrap();
        assert!(matches!(outcome, Registered::Replaced { .. }));
        assert_eq!(store.get("t").unwrap().unwrap().settings_json, other);
    }

    #[test]
    fn initial_delay_sets_first_start() {
        let (store, clock) = store();
        store.register("t", SETTINGS, Some(Duration::seconds(30)), false).unwrap();
        let row = store.get("t").unwrap().unwrap();
        assert_eq!(row.next_run_start_at, Some(clock.now() + Duration::seconds(30)));
        assert!(!row.is_due_at(clock.now()));
    }

    #[test]
    fn due_task_is_claimable_and_future_task_is_not() {
        let (store, clock) = store();
        store.register("due", SETTINGS, None, false).unwrap();
        store.register("later", SETTINGS, Some(Duration::minutes(5)), false).unwrap();

        let claim = store.try_claim("due", &Ticket::new(), Duration::minutes(1)).unwrap();
        assert!(matches!(claim, ClaimOutcome::Claimed { .. }));

        let claim = store.try_claim("later", &Ticket::new(), Duration::minutes(1)).unwrap();
        assert_eq!(
            claim,
            ClaimOutcome::NotDue {
                next_run_start_at: Some(clock.now() + Duration::minutes(5))
            }
        );
    }

    #[test]
    fn second_claim_sees_already_running() {
        let (store, _) = store();
        store.register("t", SETTINGS, None, false).unwrap();
        store.try_claim("t", &Ticket::new(), Duration::minutes(1)).unwrap();
        let claim = store.try_claim("t", &Ticket::new(), Duration::minutes(1)).unwrap();
        assert!(matches!(claim, ClaimOutcome::AlreadyRunning { .. }));
    }

    #[test]
    fn spans_past_the_calendar_error_without_writing() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(262_000, 1, 1, 0, 0, 0).unwrap());
        let store = RunStore::new(Database::open_in_memory().unwrap(), Arc::new(clock));
        let millennium = Duration::days(365 * 1000);

        let err = store.register("t", SETTINGS, Some(millennium), false).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert!(store.get("t").unwrap().is_none());

        store.register("t", SETTINGS, None, false).unwrap();
        let ticket = Ticket::new();
        let err = store.try_claim("t", &ticket, millennium).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert!(store.get("t").unwrap().unwrap().current_run_ticket.is_none());
        assert!(store.heartbeat("t", &ticket, millennium).is_err());
    }

    #[test]
    fn claim_on_unknown_task_errors() {
        let (store, _) = store();
        let err = store.try_claim("ghost", &Ticket::new(), Duration::minutes(1)).unwrap_err();
        assert!(matches!(err, SchedulerError::TaskNotFound { .. }));
    }

    #[test]
    fn completion_reschedules_and_records_status() {
        let (store, clock) = store();
        store.register("t", SETTINGS, None, false).unwrap();
        let ticket = Ticket::new();
        store.try_claim("t", &ticket, Duration::minutes(1)).unwrap();
        clock.advance(Duration::seconds(20));
        let now = store.now();
        let next = now + Duration::hours(1);
        let outcome = RunOutcome::Failed("boom".to_string());
        assert!(store.complete("t", &ticket, now, next, &outcome).unwrap());

        let row = store.get("t").unwrap().unwrap();
        assert_eq!(row.next_run_start_at, Some(next));
        assert!(row.current_run_ticket.is_none());
        assert_eq!(row.last_run_ended_at, Some(now));
        assert_eq!(row.last_run_status, Some(RunStatus::Failed));
        assert_eq!(row.last_run_error.as_deref(), Some("boom"));
    }

    #[test]
    fn heartbeat_and_still_holds_follow_the_ticket() {
        let (store, clock) = store();
        store.register("t", SETTINGS, None, false).unwrap();
        let ticket = Ticket::new();
        store.try_claim("t", &ticket, Duration::minutes(1)).unwrap();
        assert!(store.still_holds("t", &ticket).unwrap());

        clock.advance(Duration::seconds(50));
        let renewed = store.heartbeat("t", &ticket, Duration::minutes(1)).unwrap();
        assert_eq!(renewed, Some(clock.now() + Duration::minutes(1)));
        clock.advance(Duration::seconds(50));
        assert!(store.still_holds("t", &ticket).unwrap());

        assert_eq!(store.heartbeat("t", &Ticket::new(), Duration::minutes(1)).unwrap(), None);
        assert!(!store.still_holds("t", &Ticket::new()).unwrap());
    }

    #[test]
    fn trigger_makes_idle_task_due_and_refuses_running_one() {
        let (store, clock) = store();
        store.register("t", SETTINGS, Some(Duration::hours(1)), false).unwrap();
        store.trigger("t").unwrap();
        assert!(store.get("t").unwrap().unwrap().is_due_at(clock.now()));

        store.try_claim("t", &Ticket::new(), Duration::minutes(1)).unwrap();
        assert!(matches!(store.trigger("t"), Err(SchedulerError::TaskRunning { .. })));
        assert!(matches!(store.trigger("nope"), Err(SchedulerError::TaskNotFound { .. })));
    }

    #[test]
    fn reset_expired_clears_only_dead_runs() {
        let (store, clock) = store();
        store.register("dead", SETTINGS, None, false).unwrap();
        store.register("alive", SETTINGS, None, false).unwrap();
        store.try_claim("dead", &Ticket::new(), Duration::seconds(10)).unwrap();
        store.try_claim("alive", &Ticket::new(), Duration::minutes(10)).unwrap();
        clock.advance(Duration::seconds(11));

        assert_eq!(store.reset_expired().unwrap(), 1);
        let dead = store.get("dead").unwrap().unwrap();
        assert!(dead.current_run_ticket.is_none());
        assert!(dead.is_due_at(clock.now()));
        assert!(store.get("alive").unwrap().unwrap().current_run_ticket.is_some());
    }
}
