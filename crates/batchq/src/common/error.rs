use thiserror::Error;

use crate::common::error::BatchQueueError::GenericError;

#[derive(Debug, Error)]
pub enum BatchQueueError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error(transparent)]
    ConfigurationError(#[from] ConfigurationError),
    /// Caller or configuration bug. Never retried.
    #[error("Usage error: {0}")]
    UsageError(String),
    #[error("Queue service is not running")]
    ServiceStopped,
    #[error("Error: {0}")]
    GenericError(String),
}

/// Invalid driver configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Unknown option {option} for driver {driver}")]
    UnknownOption {
        driver: &'static str,
        option: String,
    },
    #[error("Option {option} of driver {driver} has no value and no default")]
    MissingValue {
        driver: &'static str,
        option: &'static str,
    },
    #[error("Driver {driver} refused value `{value}` of option {option}")]
    InvalidOption {
        driver: &'static str,
        option: String,
        value: String,
    },
}

/// Failure to hand a job over to a backend.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The backend received the submission and refused it.
    #[error("Submission rejected: {0:?}")]
    Rejected(anyhow::Error),
    /// The submission command could not be started or the backend could not be reached.
    #[error("Submission could not be delivered: {0:?}")]
    Spawn(anyhow::Error),
    #[error("Submission did not finish in {0:?}")]
    Timeout(std::time::Duration),
    /// The job or the driver is not usable at all, resubmitting cannot help.
    #[error("Submission is not possible: {0}")]
    Usage(String),
}

impl SubmitError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SubmitError::Usage(_))
    }
}

impl From<serde_json::error::Error> for BatchQueueError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for BatchQueueError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<toml::de::Error> for BatchQueueError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

pub fn usage_error<T>(message: String) -> crate::Result<T> {
    Err(BatchQueueError::UsageError(message))
}

impl From<String> for BatchQueueError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
