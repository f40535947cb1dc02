use chrono::{DateTime, Utc};
use leasehold_core::Ticket;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schedule::{TaskScope, TaskSettings};

/// A persisted `mutexes` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexRecord {
    pub id: String,
    pub current_lock_ticket: Option<Ticket>,
    pub current_lock_acquired_at: Option<DateTime<Utc>>,
    pub current_lock_expires_at: Option<DateTime<Utc>>,
}

impl MutexRecord {
    /// A lease without a ticket, or whose expiry has passed, is free.
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.current_lock_ticket.is_some()
            && self.current_lock_expires_at.is_some_and(|exp| exp > now)
    }
}

/// A granted lease on a named mutex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub mutex_id: String,
    pub ticket: Ticket,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of the last finished run of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What a job body reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(String),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Succeeded => RunStatus::Succeeded,
            RunOutcome::Failed(_) => RunStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RunOutcome::Succeeded => None,
            RunOutcome::Failed(e) => Some(e),
        }
    }
}

/// A persisted `tasks` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Raw `settings_json`; see [`TaskRecord::settings`].
    pub settings_json: String,
    pub next_run_start_at: Option<DateTime<Utc>>,
    pub current_run_ticket: Option<Ticket>,
    pub current_run_started_at: Option<DateTime<Utc>>,
    pub current_run_expires_at: Option<DateTime<Utc>>,
    pub last_run_ended_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_error: Option<String>,
}

impl TaskRecord {
    pub fn settings(&self) -> Result<TaskSettings> {
        Ok(serde_json::from_str(&self.settings_json)?)
    }

    /// A stale ticket whose lease has expired does not count as running.
    pub fn is_running_at(&self, now: DateTime<Utc>) -> bool {
        self.current_run_ticket.is_some()
            && self.current_run_expires_at.is_some_and(|exp| exp > now)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.next_run_start_at.map_or(true, |next| next <= now)
    }
}

/// Store-level answer to a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed {
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    NotDue {
        next_run_start_at: Option<DateTime<Utc>>,
    },
    AlreadyRunning {
        expires_at: Option<DateTime<Utc>>,
    },
}

/// A task registered with this scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDescriptor {
    pub id: String,
    pub scope: TaskScope,
    pub settings: TaskSettings,
}
