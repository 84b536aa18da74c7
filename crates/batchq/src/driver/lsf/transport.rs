use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use futures::future::BoxFuture;
use tokio::process::Command;

use crate::common::error::SubmitError;
use crate::driver::BackendStatus;
use crate::driver::command::{
    check_command_output, create_command, shell_command_line, shell_quote, stdout_str,
};
use crate::driver::lsf::LsfApi;
use crate::driver::lsf::command::{
    LsfSubmission, build_bjobs_arguments, build_bkill_arguments, build_bsub_arguments,
    parse_bjobs_output, parse_bsub_job_id, parse_lsf_state,
};

/// The way LSF commands reach the scheduler.
pub trait LsfTransport: Send + Sync {
    /// Returns the LSF job id.
    fn submit<'a>(
        &'a self,
        submission: &'a LsfSubmission,
    ) -> BoxFuture<'a, Result<String, SubmitError>>;

    fn status<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, anyhow::Result<BackendStatus>>;

    fn kill<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Debug, Clone)]
pub struct LsfCommands {
    pub bsub: String,
    pub bjobs: String,
    pub bkill: String,
}

#[derive(Debug, Clone)]
pub struct RemoteShell {
    pub rsh: String,
    pub host: String,
}

/// Runs `bsub`/`bjobs`/`bkill` as subprocesses, either directly or through a remote shell.
pub struct ShellTransport {
    commands: LsfCommands,
    remote: Option<RemoteShell>,
}

impl ShellTransport {
    pub fn local(commands: LsfCommands) -> Self {
        Self {
            commands,
            remote: None,
        }
    }

    pub fn remote(commands: LsfCommands, remote: RemoteShell) -> Self {
        Self {
            commands,
            remote: Some(remote),
        }
    }

    /// LSF commands are killed when their future is dropped, e.g. after a call timeout.
    fn command(&self, arguments: &[String], environment: &BTreeMap<String, String>) -> Command {
        let mut command = self.create(arguments, environment);
        command.kill_on_drop(true);
        command
    }

    fn create(&self, arguments: &[String], environment: &BTreeMap<String, String>) -> Command {
        match &self.remote {
            None => {
                log::debug!("Running LSF command `{}`", arguments.join(" "));
                let mut command = create_command(arguments, None);
                command.envs(environment);
                command
            }
            Some(remote) => {
                let command_line = remote_command_line(arguments, environment);
                log::debug!(
                    "Running LSF command `{command_line}` on {} through {}",
                    remote.host,
                    remote.rsh
                );
                create_command(
                    &[remote.rsh.as_str(), remote.host.as_str(), command_line.as_str()],
                    None,
                )
            }
        }
    }

    async fn run(&self, arguments: Vec<String>) -> anyhow::Result<String> {
        let program = arguments.first().cloned().unwrap_or_default();
        let output = self
            .command(&arguments, &BTreeMap::new())
            .output()
            .await
            .with_context(|| format!("{program} start failed"))?;
        let output =
            check_command_output(output).with_context(|| format!("{program} execution failed"))?;
        stdout_str(&output, &program)
    }

    async fn run_submit(&self, submission: &LsfSubmission) -> Result<String, SubmitError> {
        let arguments = build_bsub_arguments(&self.commands.bsub, submission);
        let output = self
            .command(&arguments, &submission.environment)
            .output()
            .await
            .with_context(|| format!("{} start failed", self.commands.bsub))
            .map_err(SubmitError::Spawn)?;
        let output = check_command_output(output)
            .with_context(|| format!("{} execution failed", self.commands.bsub))
            .map_err(SubmitError::Rejected)?;
        let stdout = stdout_str(&output, &self.commands.bsub).map_err(SubmitError::Rejected)?;
        parse_bsub_job_id(&stdout).map_err(SubmitError::Rejected)
    }
}

/// `env K=V ... 'bsub' '-J' ...` with every token single-quoted.
pub fn remote_command_line(
    arguments: &[String],
    environment: &BTreeMap<String, String>,
) -> String {
    let command_line = shell_command_line(arguments);
    if environment.is_empty() {
        return command_line;
    }
    let assignments = environment
        .iter()
        .map(|(key, value)| shell_quote(&format!("{key}={value}")))
        .collect::<Vec<_>>()
        .join(" ");
    format!("env {assignments} {command_line}")
}

impl LsfTransport for ShellTransport {
    fn submit<'a>(
        &'a self,
        submission: &'a LsfSubmission,
    ) -> BoxFuture<'a, Result<String, SubmitError>> {
        Box::pin(self.run_submit(submission))
    }

    fn status<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, anyhow::Result<BackendStatus>> {
        Box::pin(async move {
            let output = self
                .run(build_bjobs_arguments(&self.commands.bjobs, job_id))
                .await?;
            log::trace!("bjobs output for job {job_id}\n{output}");
            parse_bjobs_output(&output, job_id)
        })
    }

    fn kill<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.run(build_bkill_arguments(&self.commands.bkill, job_id))
                .await?;
            Ok(())
        })
    }
}

/// Calls an in-process LSF library on the blocking thread pool.
pub struct ApiTransport {
    api: Option<Arc<dyn LsfApi>>,
}

impl ApiTransport {
    pub fn new(api: Option<Arc<dyn LsfApi>>) -> Self {
        Self { api }
    }

    fn api(&self) -> anyhow::Result<Arc<dyn LsfApi>> {
        self.api
            .clone()
            .ok_or_else(|| anyhow::anyhow!("LSF library is not available"))
    }
}

async fn run_blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("LSF library call panicked")?
}

impl LsfTransport for ApiTransport {
    fn submit<'a>(
        &'a self,
        submission: &'a LsfSubmission,
    ) -> BoxFuture<'a, Result<String, SubmitError>> {
        Box::pin(async move {
            let Some(api) = self.api.clone() else {
                return Err(SubmitError::Usage(
                    "LSF_SERVER is not set and no LSF library is available".to_string(),
                ));
            };
            let submission = submission.clone();
            run_blocking(move || api.submit(&submission))
                .await
                .map_err(SubmitError::Rejected)
        })
    }

    fn status<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, anyhow::Result<BackendStatus>> {
        Box::pin(async move {
            let api = self.api()?;
            let job_id = job_id.to_string();
            let state = run_blocking(move || api.job_state(&job_id)).await?;
            Ok(parse_lsf_state(&state))
        })
    }

    fn kill<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let api = self.api()?;
            let job_id = job_id.to_string();
            run_blocking(move || api.kill(&job_id)).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::remote_command_line;
    use std::collections::BTreeMap;

    #[test]
    fn remote_line_without_environment() {
        let args = vec!["bjobs".to_string(), "-a".to_string(), "12".to_string()];
        assert_eq!(
            remote_command_line(&args, &BTreeMap::new()),
            "'bjobs' '-a' '12'"
        );
    }

    #[test]
    fn remote_line_with_environment() {
        let args = vec!["bsub".to_string(), "-J".to_string(), "it's".to_string()];
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "1 2".to_string());
        env.insert("B".to_string(), "x".to_string());
        insta::assert_snapshot!(remote_command_line(&args, &env), @r"env 'A=1 2' 'B=x' 'bsub' '-J' 'it'\''s'");
    }
}
