//! Driver for LSF style batch schedulers.
//!
//! Depending on `LSF_SERVER` the driver either calls an in-process LSF library, runs the LSF
//! commands locally or runs them on the server host through a remote shell.
pub mod command;
pub mod transport;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::common::error::{ConfigurationError, SubmitError};
use crate::driver::lsf::command::LsfSubmission;
use crate::driver::lsf::transport::{
    ApiTransport, LsfCommands, LsfTransport, RemoteShell, ShellTransport,
};
use crate::driver::options::{DriverOptions, OptionKey};
use crate::driver::{BackendHandle, BackendStatus, Driver, SubmissionMethod, SubmitRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LsfOption {
    BsubCmd,
    BjobsCmd,
    BkillCmd,
    RshCmd,
    LoginShell,
    Server,
    Queue,
    /// Resource request used for jobs that do not specify their own.
    Resource,
}

impl OptionKey for LsfOption {
    const DRIVER: &'static str = "lsf";

    fn all() -> &'static [Self] {
        &[
            LsfOption::BsubCmd,
            LsfOption::BjobsCmd,
            LsfOption::BkillCmd,
            LsfOption::RshCmd,
            LsfOption::LoginShell,
            LsfOption::Server,
            LsfOption::Queue,
            LsfOption::Resource,
        ]
    }

    fn name(&self) -> &'static str {
        match self {
            LsfOption::BsubCmd => "BSUB_CMD",
            LsfOption::BjobsCmd => "BJOBS_CMD",
            LsfOption::BkillCmd => "BKILL_CMD",
            LsfOption::RshCmd => "LSF_RSH_CMD",
            LsfOption::LoginShell => "LSF_LOGIN_SHELL",
            LsfOption::Server => "LSF_SERVER",
            LsfOption::Queue => "LSF_QUEUE",
            LsfOption::Resource => "LSF_RESOURCE",
        }
    }

    fn default_value(&self) -> Option<&'static str> {
        match self {
            LsfOption::BsubCmd => Some("bsub"),
            LsfOption::BjobsCmd => Some("bjobs"),
            LsfOption::BkillCmd => Some("bkill"),
            LsfOption::RshCmd => Some("/usr/bin/ssh"),
            LsfOption::LoginShell
            | LsfOption::Server
            | LsfOption::Queue
            | LsfOption::Resource => None,
        }
    }

    fn validate(&self, value: &str) -> bool {
        match self {
            LsfOption::BsubCmd | LsfOption::BjobsCmd | LsfOption::BkillCmd | LsfOption::RshCmd => {
                !value.trim().is_empty()
            }
            LsfOption::LoginShell
            | LsfOption::Server
            | LsfOption::Queue
            | LsfOption::Resource => true,
        }
    }
}

/// Blocking interface of an in-process LSF library.
pub trait LsfApi: Send + Sync {
    /// Submits a job and returns its LSF id.
    fn submit(&self, submission: &LsfSubmission) -> anyhow::Result<String>;

    /// Returns the LSF state name of a job (`PEND`, `RUN`, `DONE`, ...).
    fn job_state(&self, job_id: &str) -> anyhow::Result<String>;

    fn kill(&self, job_id: &str) -> anyhow::Result<()>;
}

pub struct LsfDriver {
    options: DriverOptions<LsfOption>,
    api: Option<Arc<dyn LsfApi>>,
    transport: Box<dyn LsfTransport>,
}

impl Default for LsfDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LsfDriver {
    pub fn new() -> Self {
        Self::create(None)
    }

    /// Creates a driver that uses `api` when no `LSF_SERVER` is configured.
    pub fn with_api(api: Arc<dyn LsfApi>) -> Self {
        Self::create(Some(api))
    }

    fn create(api: Option<Arc<dyn LsfApi>>) -> Self {
        let options = DriverOptions::default();
        let transport = create_transport(&options, api.clone());
        Self {
            options,
            api,
            transport,
        }
    }

    fn option(&self, key: LsfOption) -> Option<String> {
        self.options
            .get(key)
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
    }

    fn create_submission(&self, request: &SubmitRequest) -> LsfSubmission {
        let spec = &request.spec;
        let name = spec.name().to_string();
        LsfSubmission {
            queue: self.option(LsfOption::Queue),
            resource: spec
                .resource_request()
                .map(|resource| resource.to_string())
                .or_else(|| self.option(LsfOption::Resource)),
            login_shell: self.option(LsfOption::LoginShell),
            stdin: spec.stdin_file().map(|file| file.to_string()),
            stdout: spec
                .stdout_file()
                .map(|file| file.to_string())
                .unwrap_or_else(|| format!("{name}.LSF-stdout")),
            stderr: spec
                .stderr_file()
                .map(|file| file.to_string())
                .unwrap_or_else(|| format!("{name}.LSF-stderr")),
            executable: request.executable.clone(),
            arguments: spec.arguments().to_vec(),
            environment: spec.environment().clone(),
            name,
        }
    }
}

fn option_or_default(options: &DriverOptions<LsfOption>, key: LsfOption) -> String {
    options.get(key).unwrap_or_default().to_string()
}

fn create_transport(
    options: &DriverOptions<LsfOption>,
    api: Option<Arc<dyn LsfApi>>,
) -> Box<dyn LsfTransport> {
    let server = options.get(LsfOption::Server);
    let commands = LsfCommands {
        bsub: option_or_default(options, LsfOption::BsubCmd),
        bjobs: option_or_default(options, LsfOption::BjobsCmd),
        bkill: option_or_default(options, LsfOption::BkillCmd),
    };
    match (SubmissionMethod::resolve(server), server) {
        (SubmissionMethod::RemoteShell, Some(host)) => Box::new(ShellTransport::remote(
            commands,
            RemoteShell {
                rsh: option_or_default(options, LsfOption::RshCmd),
                host: host.to_string(),
            },
        )),
        (SubmissionMethod::LocalShell, _) => Box::new(ShellTransport::local(commands)),
        _ => Box::new(ApiTransport::new(api)),
    }
}

impl Driver for LsfDriver {
    fn name(&self) -> &'static str {
        LsfOption::DRIVER
    }

    fn configure(&mut self, name: &str, value: &str) -> bool {
        if !self.options.set(name, value) {
            return false;
        }
        self.transport = create_transport(&self.options, self.api.clone());
        true
    }

    fn get_option(&self, name: &str) -> Result<String, ConfigurationError> {
        self.options.get_by_name(name)
    }

    fn option_names(&self) -> Vec<&'static str> {
        DriverOptions::<LsfOption>::names()
    }

    fn submission_method(&self) -> SubmissionMethod {
        SubmissionMethod::resolve(self.options.get(LsfOption::Server))
    }

    fn submit<'a>(
        &'a self,
        request: &'a SubmitRequest,
    ) -> BoxFuture<'a, Result<BackendHandle, SubmitError>> {
        Box::pin(async move {
            let submission = self.create_submission(request);
            let job_id = self.transport.submit(&submission).await?;
            log::info!(
                "Job {} ({}) submitted to LSF as {job_id}",
                request.job_id,
                submission.name
            );
            Ok(BackendHandle::new(job_id))
        })
    }

    fn poll<'a>(&'a self, handle: &'a BackendHandle) -> BoxFuture<'a, BackendStatus> {
        Box::pin(async move {
            match self.transport.status(handle.as_str()).await {
                Ok(status) => status,
                Err(error) => {
                    log::warn!("Cannot get status of LSF job {handle}: {error:?}");
                    BackendStatus::Unknown
                }
            }
        })
    }

    fn kill<'a>(&'a self, handle: &'a BackendHandle) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self.transport.kill(handle.as_str()).await {
                Ok(()) => true,
                Err(error) => {
                    log::warn!("Cannot kill LSF job {handle}: {error:?}");
                    false
                }
            }
        })
    }
}
