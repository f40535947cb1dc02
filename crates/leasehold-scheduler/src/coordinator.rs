use std::future::Future;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use leasehold_core::{types::validate_name, Ticket};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::run_store::{Registered, RunStore};
use crate::schedule::{next_run_after_outcome, FailurePolicy, ScheduleDefinition};
use crate::types::{ClaimOutcome, RunOutcome, TaskRecord};

/// Answer to "may I run this task now?".
#[derive(Debug)]
pub enum RunAttempt {
    /// This caller owns the run; report through the handle.
    Claimed(RunHandle),
    NotDue {
        next_run_start_at: Option<DateTime<Utc>>,
    },
    AlreadyRunning {
        expires_at: Option<DateTime<Utc>>,
    },
}

/// What happened to a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// `false` when the ticket had been superseded and the report was dropped.
    pub recorded: bool,
}

/// Decides due-ness, claims runs, and records their completion.
#[derive(Clone)]
pub struct TaskCoordinator {
    store: RunStore,
    failure_policy: FailurePolicy,
}

impl TaskCoordinator {
    pub fn new(store: RunStore, failure_policy: FailurePolicy) -> Self {
        Self {
            store,
            failure_policy,
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Upsert the task row for `schedule`.
    pub fn register(
        &self,
        id: &str,
        schedule: &ScheduleDefinition,
        replace_stored_settings: bool,
    ) -> Result<Registered> {
        validate_name(id)?;
        schedule.validate()?;
        let initial_delay = schedule
            .initial_delay
            .map(crate::schedule::to_delta)
            .transpose()?;
        self.store.register(
            id,
            &schedule.settings_json()?,
            initial_delay,
            replace_stored_settings,
        )
    }

    /// Claim the task if it is due and idle.
    pub fn attempt_run(&self, id: &str, schedule: &ScheduleDefinition) -> Result<RunAttempt> {
        let ticket = Ticket::new();
        match self.store.try_claim(id, &ticket, schedule.timeout_delta()?)? {
            ClaimOutcome::Claimed {
                started_at,
                expires_at,
            } => {
                info!(task_id = %id, %ticket, %expires_at, "run claimed");
                Ok(RunAttempt::Claimed(RunHandle {
                    task_id: id.to_string(),
                    ticket,
                    started_at,
                    expires_at,
                    schedule: schedule.clone(),
                    failure_policy: self.failure_policy,
                    store: self.store.clone(),
                }))
            }
            ClaimOutcome::NotDue { next_run_start_at } => {
                debug!(task_id = %id, ?next_run_start_at, "task not due");
                Ok(RunAttempt::NotDue { next_run_start_at })
            }
            ClaimOutcome::AlreadyRunning { expires_at } => {
                debug!(task_id = %id, ?expires_at, "task already running elsewhere");
                Ok(RunAttempt::AlreadyRunning { expires_at })
            }
        }
    }

    /// Invoke `body` for a claimed run and report the result.
    ///
    /// Errors and panics from the body become a failed run; they never
    /// propagate. Only store failures while reporting come back as `Err`.
    pub async fn run_body<Fut>(&self, handle: &RunHandle, body: Fut) -> Result<RunReport>
    where
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let outcome = invoke_body(&handle.task_id, body).await;
        let recorded = handle.complete(&outcome)?;
        Ok(RunReport { outcome, recorded })
    }

    /// Make an idle task due immediately.
    pub fn trigger(&self, id: &str) -> Result<()> {
        self.store.trigger(id)
    }

    /// Clear tickets of runs whose lease expired without a report.
    pub fn reset_expired_runs(&self) -> Result<usize> {
        self.store.reset_expired()
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        self.store.get(id)
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.store.list()
    }
}

/// Capability for one claimed run, identified by its ticket.
#[derive(Clone)]
pub struct RunHandle {
    task_id: String,
    ticket: Ticket,
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    schedule: ScheduleDefinition,
    failure_policy: FailurePolicy,
    store: RunStore,
}

impl RunHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Expiry as of the claim; heartbeats move the stored value forward.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn schedule(&self) -> &ScheduleDefinition {
        &self.schedule
    }

    /// Extend the run's lease by another `timeout`. `false` when the run
    /// has been reclaimed by someone else.
    pub fn heartbeat(&self) -> Result<bool> {
        match self
            .store
            .heartbeat(&self.task_id, &self.ticket, self.schedule.timeout_delta()?)?
        {
            Some(expires_at) => {
                debug!(task_id = %self.task_id, %expires_at, "run lease extended");
                Ok(true)
            }
            None => {
                warn!(task_id = %self.task_id, ticket = %self.ticket, "heartbeat rejected, run was reclaimed");
                Ok(false)
            }
        }
    }

    /// Whether this ticket is still the task's live run. Check before
    /// committing side effects in long bodies.
    pub fn still_holds(&self) -> Result<bool> {
        self.store.still_holds(&self.task_id, &self.ticket)
    }

    /// Release the run and schedule the next one. A stale ticket is a no-op
    /// returning `false`.
    pub fn complete(&self, outcome: &RunOutcome) -> Result<bool> {
        let finished_at = self.store.now();
        let next = next_run_after_outcome(
            &self.schedule.frequency,
            self.failure_policy,
            matches!(outcome, RunOutcome::Failed(_)),
            finished_at,
        )?;
        let recorded = self
            .store
            .complete(&self.task_id, &self.ticket, finished_at, next, outcome)?;
        if recorded {
            info!(task_id = %self.task_id, status = %outcome.status(), next_run_start_at = %next, "run completed");
        } else {
            debug!(task_id = %self.task_id, ticket = %self.ticket, "stale completion ignored");
        }
        Ok(recorded)
    }
}

/// Await a job body, turning errors and panics into a failed outcome.
pub(crate) async fn invoke_body<Fut>(task_id: &str, body: Fut) -> RunOutcome
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(Ok(())) => RunOutcome::Succeeded,
        Ok(Err(e)) => {
            let msg = format!("{e:#}");
            warn!(task_id = %task_id, error = %msg, "task run failed");
            RunOutcome::Failed(msg)
        }
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            warn!(task_id = %task_id, panic = %msg, "task run panicked");
            RunOutcome::Failed(format!("panicked: {msg}"))
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("task_id", &self.task_id)
            .field("ticket", &self.ticket)
            .field("started_at", &self.started_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
