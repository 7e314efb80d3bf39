//! Worker configuration, parsed from `indexer.toml` with environment
//! variable overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Full configuration for the index worker node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Task scheduler section.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Task scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum tasks simultaneously admitted but not yet picked up by a
    /// stage runner. Must be positive.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound on how long `enqueue` waits for queue space before
    /// rejecting with a full-queue error.
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,

    /// Stage runner count. Completion order matches admission order only
    /// at the default of 1.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_admission_timeout_ms() -> u64 {
    2000
}

fn default_workers() -> usize {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            admission_timeout_ms: default_admission_timeout_ms(),
            workers: default_workers(),
        }
    }
}

impl SchedulerConfig {
    /// Admission timeout as a [`Duration`].
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }
}

impl IndexerConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `VEKTOR_SCHEDULER_KEY` overrides `scheduler.key`.
    /// Examples:
    /// - `VEKTOR_SCHEDULER_QUEUE_CAPACITY` -> `scheduler.queue_capacity`
    /// - `VEKTOR_SCHEDULER_ADMISSION_TIMEOUT_MS` -> `scheduler.admission_timeout_ms`
    /// - `VEKTOR_SCHEDULER_WORKERS` -> `scheduler.workers`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VEKTOR_SCHEDULER_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.scheduler.queue_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("VEKTOR_SCHEDULER_ADMISSION_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.scheduler.admission_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("VEKTOR_SCHEDULER_WORKERS") {
            if let Ok(n) = v.parse() {
                self.scheduler.workers = n;
            }
        }
    }

    /// Check invariants that TOML cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.queue_capacity must be positive".into(),
            ));
        }
        if self.scheduler.workers == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
