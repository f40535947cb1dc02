use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leasehold_core::config::{ScheduleConfig, ScopeConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::iso8601::{format_duration, parse_duration};

/// Version tag written into `settings_json`.
pub const SETTINGS_VERSION: u32 = 2;

/// Timestamps are stored with millisecond precision; a shorter lease would
/// already be expired when written.
pub const MIN_LEASE: Duration = Duration::from_millis(1);

/// Upper bound on any span added to the clock (about 1000 years).
pub const MAX_SPAN: Duration = Duration::from_secs(1000 * 365 * 86_400);

/// How often a task should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed delay measured from the end of the previous run.
    Every(Duration),
    /// Cron expression, 5-field Unix or 6/7-field with seconds.
    Cron(String),
}

impl Cadence {
    /// Parse the string form used in settings and config: anything starting
    /// with `P` is an ISO-8601 duration, everything else is a cron expression.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with('P') {
            let d = parse_duration(s).map_err(SchedulerError::InvalidSchedule)?;
            Ok(Cadence::Every(d))
        } else {
            parse_cron(s)?;
            Ok(Cadence::Cron(s.to_string()))
        }
    }

    /// Canonical string form, inverse of [`Cadence::parse`].
    pub fn as_setting(&self) -> String {
        match self {
            Cadence::Every(d) => format_duration(*d),
            Cadence::Cron(expr) => expr.clone(),
        }
    }

    /// Gap between the next two occurrences after `from`.
    pub fn period_after(&self, from: DateTime<Utc>) -> Option<Duration> {
        match self {
            Cadence::Every(d) => Some(*d),
            Cadence::Cron(_) => {
                let first = compute_next_run(self, from).ok()?;
                let second = compute_next_run(self, first).ok()?;
                (second - first).to_std().ok()
            }
        }
    }
}

/// Whether a task is coordinated through the shared store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskScope {
    /// At most one run across every instance sharing the store.
    #[default]
    Global,
    /// Runs on each instance independently; never touches the `tasks` table.
    Local,
}

/// Full schedule for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDefinition {
    pub frequency: Cadence,
    /// Lease length of one run. A run that outlives it may be reclaimed.
    pub timeout: Duration,
    /// Delay before the very first run after the task row is created.
    pub initial_delay: Option<Duration>,
    pub scope: TaskScope,
}

impl ScheduleDefinition {
    pub fn every(frequency: Duration, timeout: Duration) -> Self {
        Self {
            frequency: Cadence::Every(frequency),
            timeout,
            initial_delay: None,
            scope: TaskScope::Global,
        }
    }

    pub fn cron(expression: &str, timeout: Duration) -> Result<Self> {
        parse_cron(expression)?;
        Ok(Self {
            frequency: Cadence::Cron(expression.trim().to_string()),
            timeout,
            initial_delay: None,
            scope: TaskScope::Global,
        })
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn with_scope(mut self, scope: TaskScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout < MIN_LEASE {
            return Err(SchedulerError::InvalidSchedule(format!(
                "timeout must be at least {MIN_LEASE:?}"
            )));
        }
        to_delta(self.timeout)?;
        if let Some(delay) = self.initial_delay {
            to_delta(delay)?;
        }
        match &self.frequency {
            Cadence::Every(d) if *d < MIN_LEASE => Err(SchedulerError::InvalidSchedule(format!(
                "frequency must be at least {MIN_LEASE:?}"
            ))),
            Cadence::Every(d) => to_delta(*d).map(|_| ()),
            Cadence::Cron(expr) => parse_cron(expr).map(|_| ()),
        }
    }

    /// Persisted form of this definition.
    pub fn settings(&self) -> TaskSettings {
        TaskSettings {
            version: SETTINGS_VERSION,
            cadence: self.frequency.as_setting(),
            timeout_after_duration: format_duration(self.timeout),
            initial_delay_duration: self.initial_delay.map(format_duration),
        }
    }

    pub fn settings_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.settings())?)
    }

    /// Two definitions are equivalent when they persist identically.
    pub fn is_equivalent(&self, other: &ScheduleDefinition) -> bool {
        self.scope == other.scope && self.settings() == other.settings()
    }

    pub fn timeout_delta(&self) -> Result<chrono::Duration> {
        to_delta(self.timeout)
    }
}

impl TryFrom<&ScheduleConfig> for ScheduleDefinition {
    type Error = SchedulerError;

    fn try_from(config: &ScheduleConfig) -> Result<Self> {
        let timeout = parse_duration(&config.timeout).map_err(SchedulerError::InvalidSchedule)?;
        let initial_delay = config
            .initial_delay
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map_err(SchedulerError::InvalidSchedule)?;
        let scope = match config.scope {
            ScopeConfig::Global => TaskScope::Global,
            ScopeConfig::Local => TaskScope::Local,
        };
        let def = ScheduleDefinition {
            frequency: Cadence::parse(&config.frequency)?,
            timeout,
            initial_delay,
            scope,
        };
        def.validate()?;
        Ok(def)
    }
}

/// JSON document stored in `tasks.settings_json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSettings {
    pub version: u32,
    pub cadence: String,
    pub timeout_after_duration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_duration: Option<String>,
}

impl TaskSettings {
    /// Rebuild the definition a stored row was registered with.
    pub fn to_definition(&self) -> Result<ScheduleDefinition> {
        if self.version != SETTINGS_VERSION {
            return Err(SchedulerError::InvalidSchedule(format!(
                "unsupported settings version {}",
                self.version
            )));
        }
        let timeout =
            parse_duration(&self.timeout_after_duration).map_err(SchedulerError::InvalidSchedule)?;
        let initial_delay = self
            .initial_delay_duration
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map_err(SchedulerError::InvalidSchedule)?;
        Ok(ScheduleDefinition {
            frequency: Cadence::parse(&self.cadence)?,
            timeout,
            initial_delay,
            scope: TaskScope::Global,
        })
    }
}

/// How a failed run is rescheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Same as success: next run follows the cadence.
    #[default]
    Cadence,
    /// Next run at completion time plus this delay.
    RetryAfter(Duration),
}

impl FailurePolicy {
    pub fn from_setting(retry_after: Option<&str>) -> Result<Self> {
        match retry_after {
            None => Ok(FailurePolicy::Cadence),
            Some(s) => {
                let d = parse_duration(s).map_err(SchedulerError::InvalidSchedule)?;
                to_delta(d)?;
                Ok(FailurePolicy::RetryAfter(d))
            }
        }
    }
}

/// Compute the next start time for `cadence`, strictly after `from`.
pub fn compute_next_run(cadence: &Cadence, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match cadence {
        Cadence::Every(d) => offset(from, to_delta(*d)?),
        Cadence::Cron(expr) => parse_cron(expr)?.after(&from).next().ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("cron expression has no future run: {expr}"))
        }),
    }
}

/// Next start after a finished run, honouring the failure policy.
pub fn next_run_after_outcome(
    cadence: &Cadence,
    policy: FailurePolicy,
    failed: bool,
    finished_at: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match (failed, policy) {
        (true, FailurePolicy::RetryAfter(d)) => offset(finished_at, to_delta(d)?),
        _ => compute_next_run(cadence, finished_at),
    }
}

pub(crate) fn to_delta(d: Duration) -> Result<chrono::Duration> {
    if d > MAX_SPAN {
        return Err(SchedulerError::InvalidSchedule(format!(
            "duration out of range: {d:?}"
        )));
    }
    chrono::Duration::from_std(d)
        .map_err(|_| SchedulerError::InvalidSchedule(format!("duration out of range: {d:?}")))
}

/// `from + delta`, or `InvalidSchedule` past the last representable instant.
pub(crate) fn offset(from: DateTime<Utc>, delta: chrono::Duration) -> Result<DateTime<Utc>> {
    from.checked_add_signed(delta).ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!("{from} + {delta} is out of range"))
    })
}

/// The `cron` crate wants a seconds field; plain Unix cron has five fields.
fn normalize_cron_expr(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron_expr(expr)).map_err(|e| {
        SchedulerError::InvalidSchedule(format!("invalid cron expression '{expr}': {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn cadence_parse_distinguishes_duration_and_cron() {
        assert_eq!(
            Cadence::parse("PT5M").unwrap(),
            Cadence::Every(Duration::from_secs(300))
        );
        assert_eq!(
            Cadence::parse("*/5 * * * *").unwrap(),
            Cadence::Cron("*/5 * * * *".to_string())
        );
        assert!(Cadence::parse("every five minutes").is_err());
    }

    #[test]
    fn interval_next_run_is_from_plus_frequency() {
        let next = compute_next_run(&Cadence::Every(Duration::from_secs(90)), at(10, 0, 0)).unwrap();
        assert_eq!(next, at(10, 1, 30));
    }

    #[test]
    fn cron_next_run_is_strictly_after() {
        let cadence = Cadence::Cron("0 * * * *".to_string());
        assert_eq!(compute_next_run(&cadence, at(10, 0, 0)).unwrap(), at(11, 0, 0));
        assert_eq!(compute_next_run(&cadence, at(10, 59, 59)).unwrap(), at(11, 0, 0));
    }

    #[test]
    fn six_field_cron_is_accepted_as_is() {
        let cadence = Cadence::Cron("30 0 * * * *".to_string());
        assert_eq!(compute_next_run(&cadence, at(10, 0, 0)).unwrap(), at(10, 0, 30));
    }

    #[test]
    fn zero_timeout_and_frequency_rejected() {
        let def = ScheduleDefinition::every(Duration::from_secs(60), Duration::ZERO);
        assert!(matches!(def.validate(), Err(SchedulerError::InvalidSchedule(_))));
        let def = ScheduleDefinition::every(Duration::ZERO, Duration::from_secs(60));
        assert!(matches!(def.validate(), Err(SchedulerError::InvalidSchedule(_))));
    }

    #[test]
    fn sub_millisecond_timeout_and_frequency_rejected() {
        let def = ScheduleDefinition::every(Duration::from_secs(60), Duration::from_micros(500));
        assert!(matches!(def.validate(), Err(SchedulerError::InvalidSchedule(_))));
        let def = ScheduleDefinition::every(Duration::from_micros(999), Duration::from_secs(60));
        assert!(matches!(def.validate(), Err(SchedulerError::InvalidSchedule(_))));
        let def = ScheduleDefinition::every(MIN_LEASE, MIN_LEASE);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn oversized_durations_rejected_instead_of_overflowing() {
        let huge = parse_duration("P1000000Y").unwrap();
        let def = ScheduleDefinition::every(huge, Duration::from_secs(60));
        assert!(matches!(def.validate(), Err(SchedulerError::InvalidSchedule(_))));
        let def = ScheduleDefinition::every(Duration::from_secs(60), huge);
        assert!(matches!(def.validate(), Err(SchedulerError::InvalidSchedule(_))));
        let def = ScheduleDefinition::every(Duration::from_secs(60), Duration::from_secs(60))
            .with_initial_delay(huge);
        assert!(matches!(def.validate(), Err(SchedulerError::InvalidSchedule(_))));

        assert!(compute_next_run(&Cadence::Every(huge), at(10, 0, 0)).is_err());
        let retry = FailurePolicy::RetryAfter(huge);
        let cadence = Cadence::Every(Duration::from_secs(60));
        assert!(next_run_after_outcome(&cadence, retry, true, at(10, 0, 0)).is_err());
    }

    #[test]
    fn next_run_past_the_calendar_is_an_error() {
        let late = Utc.with_ymd_and_hms(262_000, 1, 1, 0, 0, 0).unwrap();
        let cadence = Cadence::Every(MAX_SPAN);
        assert!(matches!(
            compute_next_run(&cadence, late),
            Err(SchedulerError::InvalidSchedule(_))
        ));
        assert!(next_run_after_outcome(&cadence, FailurePolicy::Cadence, false, late).is_err());
    }

    #[test]
    fn cron_period_is_gap_between_occurrences() {
        let every_second = Cadence::Cron("*/1 * * * * *".to_string());
        assert_eq!(every_second.period_after(at(10, 0, 0)), Some(Duration::from_secs(1)));
        let hourly = Cadence::Cron("0 * * * *".to_string());
        assert_eq!(hourly.period_after(at(10, 0, 0)), Some(Duration::from_secs(3600)));
        let every = Cadence::Every(Duration::from_secs(90));
        assert_eq!(every.period_after(at(10, 0, 0)), Some(Duration::from_secs(90)));
    }

    #[test]
    fn settings_json_uses_versioned_camel_case() {
        let def = ScheduleDefinition::every(Duration::from_secs(3600), Duration::from_secs(180))
            .with_initial_delay(Duration::from_secs(10));
        let json: serde_json::Value = serde_json::from_str(&def.settings_json().unwrap()).unwrap();
        assert_eq!(json["version"], 2);
        assert_eq!(json["cadence"], "PT1H");
        assert_eq!(json["timeoutAfterDuration"], "PT3M");
        assert_eq!(json["initialDelayDuration"], "PT10S");
    }

    #[test]
    fn settings_rebuild_the_definition() {
        let def = ScheduleDefinition::cron("0 9 * * 1", Duration::from_secs(600)).unwrap();
        assert_eq!(def.settings().to_definition().unwrap(), def);
    }

    #[test]
    fn equivalence_ignores_spelling() {
        let a = ScheduleDefinition::every(Duration::from_secs(3600), Duration::from_secs(60));
        let cfg = ScheduleConfig {
            frequency: "PT60M".to_string(),
            timeout: "PT1M".to_string(),
            initial_delay: None,
            scope: ScopeConfig::Global,
        };
        let b = ScheduleDefinition::try_from(&cfg).unwrap();
        assert!(a.is_equivalent(&b));

        let c = ScheduleDefinition::every(Duration::from_secs(3600), Duration::from_secs(120));
        assert!(!a.is_equivalent(&c));
    }

    #[test]
    fn failure_policy_retry_after_shortens_next_run() {
        let cadence = Cadence::Every(Duration::from_secs(3600));
        let policy = FailurePolicy::from_setting(Some("PT1M")).unwrap();
        let next = next_run_after_outcome(&cadence, policy, true, at(10, 0, 0)).unwrap();
        assert_eq!(next, at(10, 1, 0));
        let next = next_run_after_outcome(&cadence, policy, false, at(10, 0, 0)).unwrap();
        assert_eq!(next, at(11, 0, 0));
        let next =
            next_run_after_outcome(&cadence, FailurePolicy::Cadence, true, at(10, 0, 0)).unwrap();
        assert_eq!(next, at(11, 0, 0));
    }
}
