pub mod command;
pub mod local;
pub mod lsf;
pub mod method;
pub mod options;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::JobId;
use crate::common::error::{ConfigurationError, SubmitError};
use crate::driver::local::LocalDriver;
use crate::driver::lsf::LsfDriver;
use crate::jobspec::JobSpec;

pub use method::SubmissionMethod;

/// Identifier of a submitted job inside a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle(String);

impl BackendHandle {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BackendHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendStatus {
    Pending,
    Running,
    Done,
    Failed,
    /// The backend could not be asked or gave an answer that cannot be interpreted.
    Unknown,
}

/// Everything a driver needs to start one attempt of a job.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_id: JobId,
    /// Starts at 1.
    pub attempt: u32,
    pub spec: Arc<JobSpec>,
    /// Executable selected for the platform of the queue.
    pub executable: String,
}

/// Backend able to run jobs.
///
/// Drivers are configured through `&mut self` before they are shared with a queue. After that
/// they are only accessed through shared references and every method may be called
/// concurrently from multiple tasks.
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sets an option. Returns false if the option does not exist or the value is invalid,
    /// the previous configuration is kept in that case.
    fn configure(&mut self, name: &str, value: &str) -> bool;

    /// Returns the configured value of an option or its default.
    fn get_option(&self, name: &str) -> Result<String, ConfigurationError>;

    fn option_names(&self) -> Vec<&'static str>;

    fn submission_method(&self) -> SubmissionMethod;

    /// Hands the job over to the backend.
    fn submit<'a>(
        &'a self,
        request: &'a SubmitRequest,
    ) -> BoxFuture<'a, Result<BackendHandle, SubmitError>>;

    /// Asks the backend about the state of a job. Failures are reported as
    /// [`BackendStatus::Unknown`].
    fn poll<'a>(&'a self, handle: &'a BackendHandle) -> BoxFuture<'a, BackendStatus>;

    /// Requests termination of a job. Returns true if the backend accepted the request.
    fn kill<'a>(&'a self, handle: &'a BackendHandle) -> BoxFuture<'a, bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Local,
    Lsf,
}

pub fn create_driver(kind: DriverKind) -> Box<dyn Driver> {
    match kind {
        DriverKind::Local => Box::new(LocalDriver::new()),
        DriverKind::Lsf => Box::new(LsfDriver::new()),
    }
}

/// Applies a list of `(name, value)` options to a driver.
pub fn configure_driver<'a, I>(driver: &mut dyn Driver, options: I) -> crate::Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (name, value) in options {
        if !driver.configure(name, value) {
            return Err(ConfigurationError::InvalidOption {
                driver: driver.name(),
                option: name.to_string(),
                value: value.to_string(),
            }
            .into());
        }
    }
    Ok(())
}
