use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::utils::time::{deserialize_human_duration, serialize_human_duration};

/// Delay between a failed attempt and the next submission of the same job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum RetryBackoff {
    Fixed {
        #[serde(
            deserialize_with = "deserialize_human_duration",
            serialize_with = "serialize_human_duration"
        )]
        delay: Duration,
    },
    /// Doubles with every failure, up to `max`.
    Exponential {
        #[serde(
            deserialize_with = "deserialize_human_duration",
            serialize_with = "serialize_human_duration"
        )]
        initial: Duration,
        #[serde(
            deserialize_with = "deserialize_human_duration",
            serialize_with = "serialize_human_duration"
        )]
        max: Duration,
    },
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Fixed {
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryBackoff {
    /// Delay after `failures` failed attempts of a job.
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            RetryBackoff::Fixed { delay } => *delay,
            RetryBackoff::Exponential { initial, max } => {
                let exponent = failures.saturating_sub(1).min(31);
                initial.saturating_mul(1 << exponent).min(*max)
            }
        }
    }
}
