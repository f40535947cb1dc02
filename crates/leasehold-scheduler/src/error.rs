use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Contention (someone else holds the lease, the task is not due yet, a
/// completion report arrived with a stale ticket) is never an error; those
/// come back as plain values from the stores and the coordinator.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A task id was registered again with a different schedule.
    #[error("Conflicting schedule for task {id}: registered {existing}, got {requested}")]
    ConflictingSchedule {
        id: String,
        existing: String,
        requested: String,
    },

    /// No task row with the given id exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// The task has a live run and cannot be triggered.
    #[error("Task is currently running: {id}")]
    TaskRunning { id: String },

    /// The task id was never registered with this scheduler instance.
    #[error("Task not registered with this scheduler: {id}")]
    NotRegistered { id: String },

    /// Lease parameters are unusable (zero duration).
    #[error("Invalid lease: {0}")]
    InvalidLease(String),

    /// Task or mutex name is not a usable primary key.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Stored settings JSON could not be read or written.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A thread panicked while holding the connection mutex.
    #[error("Store connection poisoned")]
    StorePoisoned,
}

impl SchedulerError {
    /// True for store failures worth retrying on the next cycle
    /// (locked/busy database, I/O hiccups).
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

impl From<leasehold_core::CoreError> for SchedulerError {
    fn from(e: leasehold_core::CoreError) -> Self {
        SchedulerError::InvalidName(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
