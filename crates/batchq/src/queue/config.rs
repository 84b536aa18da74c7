use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::error::usage_error;
use crate::common::utils::time::{
    deserialize_human_duration, get_duration_from_env, serialize_human_duration,
};
use crate::driver::DriverKind;
use crate::queue::backoff::RetryBackoff;

/// What happens with a job whose runtime exceeded its limit once the backend confirms the kill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
    /// The job ends as killed, the timeout does not count as a failed attempt.
    #[default]
    Kill,
    /// The timeout counts as a failed attempt and the job is resubmitted.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Period of the scheduling loop.
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub tick_interval: Duration,
    /// Upper bound of a single driver call.
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub call_timeout: Duration,
    /// How long a killed job may keep running before the kill is considered lost.
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub kill_grace_period: Duration,
    pub max_concurrent_calls: usize,
    /// How many times a failed job is resubmitted.
    pub retry_limit: u32,
    /// Consecutive unknown statuses tolerated before the attempt is considered failed.
    pub max_unknown_polls: u32,
    /// Queue-wide cap of submitted and running jobs, 0 means unlimited.
    pub max_running: u32,
    pub backoff: RetryBackoff,
    pub on_timeout: TimeoutAction,
    /// Platform used to select platform specific executables.
    pub platform: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(60),
            kill_grace_period: Duration::from_secs(30),
            max_concurrent_calls: 8,
            retry_limit: 2,
            max_unknown_polls: 5,
            max_running: 0,
            backoff: RetryBackoff::default(),
            on_timeout: TimeoutAction::default(),
            platform: None,
        }
    }
}

impl QueueConfig {
    /// Refuses values the queue loop cannot work with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.tick_interval.is_zero() {
            return usage_error("tick_interval must be greater than zero".to_string());
        }
        if self.call_timeout.is_zero() {
            return usage_error("call_timeout must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Applies overrides from `BATCHQ_*` environment variables.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(duration) = get_duration_from_env("BATCHQ_TICK_INTERVAL_MS") {
            self.tick_interval = duration;
        }
        if let Some(duration) = get_duration_from_env("BATCHQ_CALL_TIMEOUT_MS") {
            self.call_timeout = duration;
        }
        if let Some(duration) = get_duration_from_env("BATCHQ_KILL_GRACE_PERIOD_MS") {
            self.kill_grace_period = duration;
        }
        if let Some(limit) = std::env::var("BATCHQ_RETRY_LIMIT")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
        {
            self.retry_limit = limit;
        }
        self
    }
}

/// `[driver]` table of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    pub kind: DriverKind,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Contents of a configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub queue: QueueConfig,
    pub driver: Option<DriverConfig>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.queue.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
