use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_RANDOM_RATIO: f64 = 0.1;
pub const DEFAULT_FIRST_RUN_WINDOW_SECS: u64 = 300; // first-ever run lands within 5 min
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 600;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_QUEUE: usize = 1000;
pub const DEFAULT_SLOW_TASK_SECS: u64 = 90;

/// Top-level config (tickwork.toml + TICKWORK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickworkConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub defer: DeferConfig,
}

/// Location of the shared coordination store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Polling, jitter and claim settings for the periodic job manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Width of the random spread applied to every rescheduled run, as a
    /// fraction of the job interval.
    #[serde(default = "default_random_ratio")]
    pub random_ratio: f64,
    #[serde(default = "default_first_run_window_secs")]
    pub first_run_window_secs: u64,
    /// Claim expiry for jobs that do not declare their own.
    #[serde(default = "default_claim_ttl_secs")]
    pub default_claim_ttl_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Maximum number of job bodies running at once from non-blocking ticks.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            random_ratio: DEFAULT_RANDOM_RATIO,
            first_run_window_secs: DEFAULT_FIRST_RUN_WINDOW_SECS,
            default_claim_ttl_secs: DEFAULT_CLAIM_TTL_SECS,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            workers: DEFAULT_WORKERS,
            hostname: default_hostname(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn first_run_window(&self) -> Duration {
        Duration::from_secs(self.first_run_window_secs)
    }

    pub fn default_claim_ttl(&self) -> Duration {
        Duration::from_secs(self.default_claim_ttl_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Settings for the fire-and-forget background queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferConfig {
    /// When false, deferred work runs inline on the caller.
    #[serde(default = "bool_true")]
    pub async_mode: bool,
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_slow_task_secs")]
    pub slow_task_secs: u64,
}

impl Default for DeferConfig {
    fn default() -> Self {
        Self {
            async_mode: true,
            max_queue: DEFAULT_MAX_QUEUE,
            slow_task_secs: DEFAULT_SLOW_TASK_SECS,
        }
    }
}

impl DeferConfig {
    pub fn slow_task_threshold(&self) -> Duration {
        Duration::from_secs(self.slow_task_secs)
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_random_ratio() -> f64 {
    DEFAULT_RANDOM_RATIO
}
fn default_first_run_window_secs() -> u64 {
    DEFAULT_FIRST_RUN_WINDOW_SECS
}
fn default_claim_ttl_secs() -> u64 {
    DEFAULT_CLAIM_TTL_SECS
}
fn default_keep_alive_secs() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_max_queue() -> usize {
    DEFAULT_MAX_QUEUE
}
fn default_slow_task_secs() -> u64 {
    DEFAULT_SLOW_TASK_SECS
}
fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
fn default_store_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.db", home)
}

impl TickworkConfig {
    /// Load config from a TOML file with TICKWORK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.tickwork/tickwork.toml
    ///
    /// Nested keys use a double underscore, e.g. `TICKWORK_SCHEDULER__WORKERS=8`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TickworkConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TICKWORK_").split("__"))
            .extract()
            .map_err(|e| crate::error::TickworkError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let ratio = self.scheduler.random_ratio;
        if !(0.0..1.0).contains(&ratio) {
            return Err(crate::error::TickworkError::Config(format!(
                "scheduler.random_ratio must be in [0, 1), got {ratio}"
            )));
        }
        if self.scheduler.workers == 0 {
            return Err(crate::error::TickworkError::Config(
                "scheduler.workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let config = TickworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.scheduler.random_ratio, DEFAULT_RANDOM_RATIO);
        assert!(config.defer.async_mode);
        assert_eq!(config.defer.max_queue, DEFAULT_MAX_QUEUE);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let config = TickworkConfig::load(Some("/nonexistent/tickwork.toml")).unwrap();
        assert_eq!(config.scheduler.workers, DEFAULT_WORKERS);
        assert_eq!(config.scheduler.keep_alive_secs, DEFAULT_KEEP_ALIVE_SECS);
    }

    #[test]
    fn load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[store]\npath = \"/tmp/fleet.db\"\n\n[scheduler]\nworkers = 8\nrandom_ratio = 0.2\n\n[defer]\nasync_mode = false"
        )
        .unwrap();

        let config = TickworkConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.store.path, "/tmp/fleet.db");
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.scheduler.random_ratio, 0.2);
        assert_eq!(config.scheduler.tick_interval_secs, DEFAULT_TICK_INTERVAL_SECS);
        assert!(!config.defer.async_mode);
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        let mut config = TickworkConfig::default();
        config.scheduler.random_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = TickworkConfig::default();
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tick_interval_never_zero() {
        let config = SchedulerConfig {
            tick_interval_secs: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
    }
}
