//! `leasehold-scheduler` — distributed task scheduling over a shared SQLite store.
//!
//! # Overview
//!
//! Many instances of one service register the same named tasks. Each instance
//! runs a timer loop per task; on every tick it asks the store whether the
//! task is due and tries to claim it with a conditional `UPDATE`. Exactly one
//! claimant wins per lease window, runs the body, and reports completion with
//! its ticket. A report carrying a superseded ticket changes nothing.
//!
//! | Layer               | Type                                     |
//! |---------------------|------------------------------------------|
//! | Persistence         | [`db::Database`], [`lock_store::LockStore`], [`run_store::RunStore`] |
//! | Named mutexes       | [`lease::LeaseManager`], [`lease::LockedWorker`] |
//! | Task runs           | [`coordinator::TaskCoordinator`], [`coordinator::RunHandle`] |
//! | Lifecycle & timers  | [`engine::Scheduler`], [`janitor::Janitor`] |
//!
//! If a holder crashes, its lease expires and any instance may reclaim the
//! task on its next due-check. Runaway bodies are never killed; they get a
//! cancellation signal and can check [`engine::RunContext::still_holds`].

pub mod clock;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod iso8601;
pub mod janitor;
pub mod lease;
pub mod lock_store;
pub mod run_store;
pub mod schedule;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{RunAttempt, RunHandle, RunReport, TaskCoordinator};
pub use db::Database;
pub use engine::{
    RunContext, Scheduler, SchedulerSettings, TaskRegistration, TaskRunner, TickOutcome,
};
pub use error::{Result, SchedulerError};
pub use janitor::{Janitor, SweepReport};
pub use lease::{LeaseManager, LockedWorker};
pub use schedule::{Cadence, FailurePolicy, ScheduleDefinition, TaskScope};
pub use types::{Lease, MutexRecord, RunOutcome, RunStatus, TaskDescriptor, TaskRecord};
