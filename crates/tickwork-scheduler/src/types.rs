use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Which of the two cadence rules a job follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceKind {
    Every,
    Daily,
}

/// How often a job should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Roughly every `interval`, measured from the end of the previous run.
    Every(Duration),
    /// Once per UTC day at `at` past midnight.
    Daily { at: Duration },
}

impl Cadence {
    pub fn kind(&self) -> CadenceKind {
        match self {
            Cadence::Every(_) => CadenceKind::Every,
            Cadence::Daily { .. } => CadenceKind::Daily,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            Cadence::Every(interval) => Some(*interval),
            Cadence::Daily { .. } => None,
        }
    }

    pub fn time_of_day(&self) -> Option<Duration> {
        match self {
            Cadence::Every(_) => None,
            Cadence::Daily { at } => Some(*at),
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Every(interval) => write!(f, "every {}s", interval.as_secs()),
            Cadence::Daily { at } => {
                let secs = at.as_secs();
                write!(f, "daily at {:02}:{:02} UTC", secs / 3600, (secs % 3600) / 60)
            }
        }
    }
}

/// Static schedule metadata a job declares alongside its definition.
///
/// ```
/// use std::time::Duration;
/// use tickwork_scheduler::ScheduleSpec;
///
/// let hourly = ScheduleSpec::every(Duration::from_secs(3600));
/// let nightly = ScheduleSpec::daily(Duration::from_secs(2 * 3600)).per_host();
/// # let _ = (hourly, nightly);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSpec {
    cadence: Cadence,
    per_host: bool,
    claim_ttl: Option<Duration>,
}

impl ScheduleSpec {
    pub fn every(interval: Duration) -> Self {
        Self {
            cadence: Cadence::Every(interval),
            per_host: false,
            claim_ttl: None,
        }
    }

    pub fn daily(at: Duration) -> Self {
        Self {
            cadence: Cadence::Daily { at },
            per_host: false,
            claim_ttl: None,
        }
    }

    /// Run once per host instead of once per fleet.
    pub fn per_host(mut self) -> Self {
        self.per_host = true;
        self
    }

    /// Claim expiry; should exceed the job's worst-case runtime.
    pub fn claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = Some(ttl);
        self
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn is_per_host(&self) -> bool {
        self.per_host
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.claim_ttl
    }

    /// Check the declaration for `job` is something the manager can plan.
    pub fn validate(&self, job: &str) -> Result<()> {
        let invalid = |reason: &str| SchedulerError::InvalidSchedule {
            job: job.to_string(),
            reason: reason.to_string(),
        };
        match self.cadence {
            Cadence::Every(interval) if interval.is_zero() => {
                return Err(invalid("interval must be greater than zero"))
            }
            Cadence::Daily { at } if at >= DAY => {
                return Err(invalid("time of day must be less than 24h"))
            }
            _ => {}
        }
        if self.claim_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(invalid("claim ttl must be greater than zero"));
        }
        Ok(())
    }
}

/// Outcome marker stored with a job's schedule record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunResult {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAILED")]
    Failed,
    /// Claimed and currently executing.
    #[serde(rename = "RUNNING")]
    Running,
    /// Was running on a manager that disappeared; requeued.
    #[serde(rename = "ORPHAN")]
    Orphan,
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunResult::Ok => "OK",
            RunResult::Failed => "FAILED",
            RunResult::Running => "RUNNING",
            RunResult::Orphan => "ORPHAN",
        };
        write!(f, "{s}")
    }
}

/// Persisted run state for one job, shared by every process in the fleet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    /// Start time of the last completed run.
    pub prev_run: Option<DateTime<Utc>>,
    /// Wall-clock seconds the last run took.
    pub prev_duration: Option<f64>,
    pub prev_result: Option<RunResult>,
    pub next_run: Option<DateTime<Utc>>,
    /// Identity of the manager executing the job while `prev_result` is `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_owner: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_exposes_exactly_one_parameter() {
        let every = Cadence::Every(Duration::from_secs(60));
        assert_eq!(every.kind(), CadenceKind::Every);
        assert_eq!(every.interval(), Some(Duration::from_secs(60)));
        assert!(every.time_of_day().is_none());

        let daily = Cadence::Daily {
            at: Duration::from_secs(7200),
        };
        assert_eq!(daily.kind(), CadenceKind::Daily);
        assert!(daily.interval().is_none());
        assert_eq!(daily.time_of_day(), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn cadence_display() {
        assert_eq!(Cadence::Every(Duration::from_secs(90)).to_string(), "every 90s");
        let daily = Cadence::Daily {
            at: Duration::from_secs(2 * 3600 + 30 * 60),
        };
        assert_eq!(daily.to_string(), "daily at 02:30 UTC");
    }

    #[test]
    fn spec_builder_sets_flags() {
        let spec = ScheduleSpec::every(Duration::from_secs(60))
            .per_host()
            .claim_ttl(Duration::from_secs(30));
        assert!(spec.is_per_host());
        assert_eq!(spec.ttl(), Some(Duration::from_secs(30)));
        assert!(spec.validate("job").is_ok());
    }

    #[test]
    fn spec_rejects_zero_interval() {
        let err = ScheduleSpec::every(Duration::ZERO).validate("job").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    }

    #[test]
    fn spec_rejects_time_of_day_past_midnight() {
        assert!(ScheduleSpec::daily(DAY).validate("job").is_err());
        assert!(ScheduleSpec::daily(DAY - Duration::from_secs(1))
            .validate("job")
            .is_ok());
    }

    #[test]
    fn spec_rejects_zero_ttl() {
        let spec = ScheduleSpec::every(Duration::from_secs(1)).claim_ttl(Duration::ZERO);
        assert!(spec.validate("job").is_err());
    }

    #[test]
    fn run_result_wire_format() {
        assert_eq!(serde_json::to_string(&RunResult::Ok).unwrap(), "\"OK\"");
        assert_eq!(serde_json::to_string(&RunResult::Failed).unwrap(), "\"FAILED\"");
        let parsed: RunResult = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(parsed, RunResult::Running);
        assert_eq!(RunResult::Orphan.to_string(), "ORPHAN");
    }

    #[test]
    fn schedule_info_omits_empty_owner() {
        let info = ScheduleInfo::default();
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("current_owner"));

        let parsed: ScheduleInfo =
            serde_json::from_str(r#"{"prev_run":null,"prev_duration":null,"prev_result":"OK","next_run":null}"#)
                .unwrap();
        assert_eq!(parsed.prev_result, Some(RunResult::Ok));
        assert!(parsed.current_owner.is_none());
    }
}
