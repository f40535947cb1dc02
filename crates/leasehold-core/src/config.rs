use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000; // wait this long on a locked SQLite file
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000; // work-check frequency per task
pub const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 60;

/// Top-level config (leasehold.toml + LEASEHOLD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseholdConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Config-driven schedule definitions keyed by task id.
    #[serde(default)]
    pub schedules: BTreeMap<String, ScheduleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Timer loop and janitor tuning for one scheduler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often each task loop asks the store whether its task is due.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often expired run tickets and mutex leases are swept.
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,
    /// Overwrite stored task settings that differ from the registering
    /// definition instead of failing registration. Meant for rolling deploys
    /// where old and new instances briefly disagree.
    #[serde(default)]
    pub replace_stored_settings: bool,
    /// ISO-8601 delay before a failed run is retried. When unset, failures
    /// follow the regular cadence.
    #[serde(default)]
    pub failure_retry_after: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            janitor_interval_secs: DEFAULT_JANITOR_INTERVAL_SECS,
            replace_stored_settings: false,
            failure_retry_after: None,
        }
    }
}

/// Raw schedule as written in config. Parsed and validated by the scheduler.
///
/// ```toml
/// [schedules.refresh-catalog]
/// frequency = "PT30M"        # or a cron expression: "*/30 * * * *"
/// timeout = "PT3M"
/// initial_delay = "PT15S"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub frequency: String,
    pub timeout: String,
    #[serde(default)]
    pub initial_delay: Option<String>,
    #[serde(default)]
    pub scope: ScopeConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeConfig {
    #[default]
    Global,
    Local,
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.leasehold/leasehold.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_janitor_interval_secs() -> u64 {
    DEFAULT_JANITOR_INTERVAL_SECS
}

impl LeaseholdConfig {
    /// Load config from a TOML file with LEASEHOLD_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `LEASEHOLD_SCHEDULER__POLL_INTERVAL_MS=1000`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading config");

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LEASEHOLD_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.leasehold/leasehold.toml", home)
}
