use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use leasehold_core::config::{
    SchedulerConfig, DEFAULT_JANITOR_INTERVAL_SECS, DEFAULT_POLL_INTERVAL_MS,
};
use leasehold_core::{types::validate_name, InstanceId, Ticket};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::coordinator::{invoke_body, RunAttempt, RunHandle, TaskCoordinator};
use crate::db::Database;
use crate::error::{Result, SchedulerError};
use crate::janitor::Janitor;
use crate::lease::{LeaseManager, LockedWorker};
use crate::lock_store::LockStore;
use crate::run_store::RunStore;
use crate::schedule::{
    next_run_after_outcome, offset, to_delta, FailurePolicy, ScheduleDefinition, TaskScope,
};
use crate::types::{RunOutcome, TaskDescriptor};

/// Type-erased job body.
pub type TaskBody =
    Arc<dyn Fn(RunContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Knobs for one [`Scheduler`] instance.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Upper bound on how long a task loop sleeps between due-checks.
    pub poll_interval: Duration,
    pub janitor_interval: Duration,
    /// Overwrite stored settings that differ instead of failing registration.
    pub replace_stored_settings: bool,
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            janitor_interval: Duration::from_secs(DEFAULT_JANITOR_INTERVAL_SECS),
            replace_stored_settings: false,
            failure_policy: FailurePolicy::Cadence,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        if config.poll_interval_ms == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if config.janitor_interval_secs == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "janitor_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            janitor_interval: Duration::from_secs(config.janitor_interval_secs),
            replace_stored_settings: config.replace_stored_settings,
            failure_policy: FailurePolicy::from_setting(config.failure_retry_after.as_deref())?,
        })
    }

    /// Due-checks happen at least once per cadence period. For cron the
    /// period is the gap between the next two occurrences after `now`.
    pub fn poll_interval_for(
        &self,
        schedule: &ScheduleDefinition,
        now: DateTime<Utc>,
    ) -> Duration {
        let poll = match schedule.frequency.period_after(now) {
            Some(period) => self.poll_interval.min(period),
            None => self.poll_interval,
        };
        poll.max(MIN_TICK)
    }

    /// Raise zero intervals to [`MIN_TICK`]; `tokio::time::interval` panics on zero.
    fn clamped(mut self) -> Self {
        if self.poll_interval < MIN_TICK {
            warn!(poll_interval = ?self.poll_interval, "poll interval too small, using {MIN_TICK:?}");
            self.poll_interval = MIN_TICK;
        }
        if self.janitor_interval < MIN_TICK {
            warn!(janitor_interval = ?self.janitor_interval, "janitor interval too small, using {MIN_TICK:?}");
            self.janitor_interval = MIN_TICK;
        }
        self
    }
}

/// Shortest timer period any scheduler loop uses.
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Result of a single due-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The body ran here and its outcome was recorded.
    Ran(RunOutcome),
    NotDue,
    AlreadyRunning,
    /// The body ran but the lease had been reclaimed, so the report was dropped.
    Stale,
}

/// Handed to every job body.
#[derive(Clone)]
pub struct RunContext {
    task_id: String,
    ticket: Ticket,
    timeout: Duration,
    cancel: CancellationToken,
    deadline: Arc<Mutex<Instant>>,
    handle: Option<RunHandle>,
}

impl RunContext {
    fn new(registration: &Registration, ticket: Ticket, handle: Option<RunHandle>) -> Self {
        let timeout = registration.schedule.timeout;
        Self {
            task_id: registration.id.clone(),
            ticket,
            timeout,
            cancel: CancellationToken::new(),
            deadline: Arc::new(Mutex::new(Instant::now() + timeout)),
            handle,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    /// Fires when the run's timeout passes without a heartbeat, when the
    /// registration is cancelled, or when the scheduler stops. Bodies are
    /// expected to wind down on it; nothing aborts them.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Extend the run's lease by another timeout.
    ///
    /// `false` means another instance has reclaimed the run; the body should
    /// stop before committing anything further.
    pub fn heartbeat(&self) -> Result<bool> {
        let alive = match &self.handle {
            Some(handle) => handle.heartbeat()?,
            None => true,
        };
        if alive {
            *lock(&self.deadline) = Instant::now() + self.timeout;
        }
        Ok(alive)
    }

    /// Whether this run is still the sanctioned one.
    pub fn still_holds(&self) -> Result<bool> {
        match &self.handle {
            Some(handle) => handle.still_holds(),
            None => Ok(!self.cancel.is_cancelled()),
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("task_id", &self.task_id)
            .field("ticket", &self.ticket)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct Registration {
    id: String,
    schedule: ScheduleDefinition,
    body: TaskBody,
    cancel: CancellationToken,
    /// Only used by `TaskScope::Local` tasks.
    local_next_run: Mutex<Option<DateTime<Utc>>>,
    local_running: AtomicBool,
}

struct Running {
    shutdown: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

struct Inner {
    coordinator: TaskCoordinator,
    leases: LeaseManager,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    instance: InstanceId,
    registry: Mutex<HashMap<String, Arc<Registration>>>,
    running: Mutex<Option<Running>>,
}

/// Registration table and timer loops for one process.
///
/// Lock order is `running` then `registry`.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(db: Database, clock: Arc<dyn Clock>, settings: SchedulerSettings) -> Self {
        let settings = settings.clamped();
        let coordinator = TaskCoordinator::new(
            RunStore::new(db.clone(), clock.clone()),
            settings.failure_policy,
        );
        let leases = LeaseManager::new(LockStore::new(db, clock.clone()));
        Self {
            inner: Arc::new(Inner {
                coordinator,
                leases,
                clock,
                settings,
                instance: InstanceId::new(),
                registry: Mutex::new(HashMap::new()),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    pub fn coordinator(&self) -> &TaskCoordinator {
        &self.inner.coordinator
    }

    pub fn lease_manager(&self) -> &LeaseManager {
        &self.inner.leases
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Register `body` to run on `schedule` under `id`.
    ///
    /// Fails fast with `ConflictingSchedule` when `id` is already known with a
    /// different schedule, in this process or in the store.
    pub fn schedule_task<F, Fut>(
        &self,
        id: &str,
        schedule: ScheduleDefinition,
        body: F,
    ) -> Result<TaskRegistration>
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let body: TaskBody = Arc::new(move |ctx| body(ctx).boxed());
        self.register(id, schedule, body)
    }

    fn register(
        &self,
        id: &str,
        schedule: ScheduleDefinition,
        body: TaskBody,
    ) -> Result<TaskRegistration> {
        validate_name(id)?;
        schedule.validate()?;

        let mut running = lock(&self.inner.running);
        let mut registry = lock(&self.inner.registry);

        if let Some(existing) = registry.get(id) {
            if existing.schedule.is_equivalent(&schedule) {
                debug!(task_id = %id, "task already registered, keeping the first body");
                return Ok(TaskRegistration {
                    inner: self.inner.clone(),
                    registration: existing.clone(),
                });
            }
            return Err(SchedulerError::ConflictingSchedule {
                id: id.to_string(),
                existing: existing.schedule.settings_json()?,
                requested: schedule.settings_json()?,
            });
        }

        let local_next_run = match schedule.scope {
            TaskScope::Global => {
                let outcome = self.inner.coordinator.register(
                    id,
                    &schedule,
                    self.inner.settings.replace_stored_settings,
                )?;
                info!(task_id = %id, ?outcome, "task registered");
                None
            }
            TaskScope::Local => {
                info!(task_id = %id, "local task registered");
                schedule
                    .initial_delay
                    .map(to_delta)
                    .transpose()?
                    .map(|delay| offset(self.inner.clock.now(), delay))
                    .transpose()?
            }
        };

        let registration = Arc::new(Registration {
            id: id.to_string(),
            schedule,
            body,
            cancel: CancellationToken::new(),
            local_next_run: Mutex::new(local_next_run),
            local_running: AtomicBool::new(false),
        });
        registry.insert(id.to_string(), registration.clone());

        if let Some(run) = running.as_mut() {
            run.loops.push(spawn_task_loop(
                self.inner.clone(),
                registration.clone(),
                run.shutdown.clone(),
            ));
        }

        Ok(TaskRegistration {
            inner: self.inner.clone(),
            registration,
        })
    }

    /// Bind `schedule` now and supply the body later.
    pub fn create_scheduled_task_runner(&self, schedule: ScheduleDefinition) -> Result<TaskRunner> {
        schedule.validate()?;
        Ok(TaskRunner {
            scheduler: self.clone(),
            schedule,
        })
    }

    /// Ad-hoc mutual exclusion on `id`, without cadence or bookkeeping.
    pub fn create_locked_worker(&self, id: &str, lease_duration: Duration) -> Result<LockedWorker> {
        LockedWorker::new(id, lease_duration, self.inner.leases.clone())
    }

    /// Spawn one loop per registered task plus the janitor.
    ///
    /// Must be called from within a Tokio runtime. A second call while
    /// running does nothing.
    pub fn start(&self) {
        let mut running = lock(&self.inner.running);
        if running.is_some() {
            warn!("scheduler already running");
            return;
        }

        let shutdown = CancellationToken::new();
        let registrations: Vec<Arc<Registration>> =
            lock(&self.inner.registry).values().cloned().collect();
        let mut loops = Vec::with_capacity(registrations.len() + 1);
        for registration in registrations {
            loops.push(spawn_task_loop(
                self.inner.clone(),
                registration,
                shutdown.clone(),
            ));
        }

        let janitor = Janitor::new(self.inner.coordinator.clone(), self.inner.leases.clone());
        loops.push(tokio::spawn(
            janitor.run(self.inner.settings.janitor_interval, shutdown.clone()),
        ));

        info!(
            instance = %self.inner.instance,
            tasks = loops.len() - 1,
            "scheduler started"
        );
        *running = Some(Running { shutdown, loops });
    }

    /// Cancel every loop and in-flight run, then wait for them to return.
    pub async fn stop(&self) {
        let running = lock(&self.inner.running).take();
        let Some(running) = running else {
            debug!("scheduler not running");
            return;
        };

        running.shutdown.cancel();
        for handle in running.loops {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop ended abnormally");
            }
        }
        info!(instance = %self.inner.instance, "scheduler stopped");
    }

    /// One due-check for a registered task: claim, run, report.
    pub async fn run_task_once(&self, id: &str) -> Result<TickOutcome> {
        let registration = lock(&self.inner.registry)
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotRegistered { id: id.to_string() })?;
        let shutdown = self.inner.shutdown_token();
        self.inner.tick(&registration, &shutdown).await
    }

    /// Make `id` due now.
    pub fn trigger_task(&self, id: &str) -> Result<()> {
        let registration = lock(&self.inner.registry).get(id).cloned();
        match registration {
            Some(r) if r.schedule.scope == TaskScope::Local => {
                if r.local_running.load(Ordering::Acquire) {
                    return Err(SchedulerError::TaskRunning { id: id.to_string() });
                }
                *lock(&r.local_next_run) = None;
                info!(task_id = %id, "local task triggered");
                Ok(())
            }
            _ => self.inner.coordinator.trigger(id),
        }
    }

    /// Every task registered with this instance, sorted by id.
    pub fn scheduled_tasks(&self) -> Vec<TaskDescriptor> {
        let mut tasks: Vec<TaskDescriptor> = lock(&self.inner.registry)
            .values()
            .map(|r| TaskDescriptor {
                id: r.id.clone(),
                scope: r.schedule.scope,
                settings: r.schedule.settings(),
            })
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }
}

impl Inner {
    fn shutdown_token(&self) -> CancellationToken {
        lock(&self.running)
            .as_ref()
            .map(|r| r.shutdown.clone())
            .unwrap_or_else(CancellationToken::new)
    }

    async fn tick(
        &self,
        registration: &Registration,
        shutdown: &CancellationToken,
    ) -> Result<TickOutcome> {
        match registration.schedule.scope {
            TaskScope::Global => self.tick_global(registration, shutdown).await,
            TaskScope::Local => self.tick_local(registration, shutdown).await,
        }
    }

    async fn tick_global(
        &self,
        registration: &Registration,
        shutdown: &CancellationToken,
    ) -> Result<TickOutcome> {
        let handle = match self
            .coordinator
            .attempt_run(&registration.id, &registration.schedule)?
        {
            RunAttempt::Claimed(handle) => handle,
            RunAttempt::NotDue { .. } => return Ok(TickOutcome::NotDue),
            RunAttempt::AlreadyRunning { .. } => return Ok(TickOutcome::AlreadyRunning),
        };

        let ctx = RunContext::new(registration, handle.ticket().clone(), Some(handle.clone()));
        let watchdog = spawn_watchdog(&ctx, registration.cancel.clone(), shutdown.clone());
        let report = self
            .coordinator
            .run_body(&handle, (registration.body)(ctx))
            .await;
        drop(watchdog);

        let report = report?;
        if report.recorded {
            Ok(TickOutcome::Ran(report.outcome))
        } else {
            warn!(
                task_id = %registration.id,
                ticket = %handle.ticket(),
                "run outlived its lease and was reclaimed, result discarded"
            );
            Ok(TickOutcome::Stale)
        }
    }

    async fn tick_local(
        &self,
        registration: &Registration,
        shutdown: &CancellationToken,
    ) -> Result<TickOutcome> {
        if registration
            .local_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(TickOutcome::AlreadyRunning);
        }
        let _running = LocalRunGuard(&registration.local_running);

        let next = *lock(&registration.local_next_run);
        if next.is_some_and(|next| next > self.clock.now()) {
            return Ok(TickOutcome::NotDue);
        }

        let ctx = RunContext::new(registration, Ticket::new(), None);
        debug!(task_id = %registration.id, "local run started");
        let watchdog = spawn_watchdog(&ctx, registration.cancel.clone(), shutdown.clone());
        let outcome = invoke_body(&registration.id, (registration.body)(ctx)).await;
        drop(watchdog);

        let next = next_run_after_outcome(
            &registration.schedule.frequency,
            self.settings.failure_policy,
            matches!(outcome, RunOutcome::Failed(_)),
            self.clock.now(),
        )?;
        *lock(&registration.local_next_run) = Some(next);
        info!(task_id = %registration.id, status = %outcome.status(), next_run_start_at = %next, "local run completed");
        Ok(TickOutcome::Ran(outcome))
    }
}

struct LocalRunGuard<'a>(&'a AtomicBool);

impl Drop for LocalRunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cancels the run's token on timeout (unless heartbeats keep pushing the
/// deadline), registration cancel, or shutdown. Dropping the guard ends it.
fn spawn_watchdog(
    ctx: &RunContext,
    registration_cancel: CancellationToken,
    shutdown: CancellationToken,
) -> DropGuard {
    let done = CancellationToken::new();
    let finished = done.clone();
    let run_cancel = ctx.cancel.clone();
    let deadline = ctx.deadline.clone();
    let task_id = ctx.task_id.clone();

    tokio::spawn(async move {
        loop {
            let at = *lock(&deadline);
            tokio::select! {
                _ = finished.cancelled() => return,
                _ = shutdown.cancelled() => {
                    run_cancel.cancel();
                    return;
                }
                _ = registration_cancel.cancelled() => {
                    run_cancel.cancel();
                    return;
                }
                _ = tokio::time::sleep_until(at) => {
                    if Instant::now() >= *lock(&deadline) {
                        warn!(task_id = %task_id, "run passed its timeout without a heartbeat, requesting cancellation");
                        run_cancel.cancel();
                        return;
                    }
                }
            }
        }
    });

    done.drop_guard()
}

fn spawn_task_loop(
    inner: Arc<Inner>,
    registration: Arc<Registration>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let every = inner
            .settings
            .poll_interval_for(&registration.schedule, inner.clock.now());
        info!(task_id = %registration.id, poll_ms = every.as_millis() as u64, "task loop started");

        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = registration.cancel.cancelled() => break,
                _ = interval.tick() => {
                    match inner.tick(&registration, &shutdown).await {
                        Ok(TickOutcome::Ran(outcome)) => {
                            debug!(task_id = %registration.id, status = %outcome.status(), "tick ran task");
                        }
                        Ok(_) => {}
                        Err(e) if e.is_transient() => {
                            warn!(task_id = %registration.id, error = %e, "due-check failed, retrying next cycle");
                        }
                        Err(e) => {
                            error!(task_id = %registration.id, error = %e, "due-check failed");
                        }
                    }
                }
            }
        }
        info!(task_id = %registration.id, "task loop stopped");
    })
}

/// Handle returned by [`Scheduler::schedule_task`].
#[derive(Clone)]
pub struct TaskRegistration {
    inner: Arc<Inner>,
    registration: Arc<Registration>,
}

impl TaskRegistration {
    pub fn id(&self) -> &str {
        &self.registration.id
    }

    pub fn schedule(&self) -> &ScheduleDefinition {
        &self.registration.schedule
    }

    pub fn is_cancelled(&self) -> bool {
        self.registration.cancel.is_cancelled()
    }

    /// Stop scheduling this task. In-flight runs are asked to wind down.
    /// The stored task row is left in place.
    pub fn cancel(&self) {
        if self.registration.cancel.is_cancelled() {
            return;
        }
        self.registration.cancel.cancel();

        let mut registry = lock(&self.inner.registry);
        let ours = registry
            .get(&self.registration.id)
            .is_some_and(|r| Arc::ptr_eq(r, &self.registration));
        if ours {
            registry.remove(&self.registration.id);
        }
        info!(task_id = %self.registration.id, "task registration cancelled");
    }
}

impl std::fmt::Debug for TaskRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistration")
            .field("id", &self.registration.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A schedule waiting for its body.
#[derive(Clone)]
pub struct TaskRunner {
    scheduler: Scheduler,
    schedule: ScheduleDefinition,
}

impl TaskRunner {
    pub fn schedule(&self) -> &ScheduleDefinition {
        &self.schedule
    }

    pub fn run<F, Fut>(&self, id: &str, body: F) -> Result<TaskRegistration>
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.scheduler.schedule_task(id, self.schedule.clone(), body)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
