use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use futures::future::BoxFuture;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::Map;
use crate::common::error::{ConfigurationError, SubmitError};
use crate::driver::command::create_command;
use crate::driver::options::{DriverOptions, OptionKey};
use crate::driver::{BackendHandle, BackendStatus, Driver, SubmissionMethod, SubmitRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalOption {
    /// Working directory of started processes. Relative job files are resolved against it.
    RunPath,
}

impl OptionKey for LocalOption {
    const DRIVER: &'static str = "local";

    fn all() -> &'static [Self] {
        &[LocalOption::RunPath]
    }

    fn name(&self) -> &'static str {
        match self {
            LocalOption::RunPath => "RUN_PATH",
        }
    }

    fn default_value(&self) -> Option<&'static str> {
        match self {
            LocalOption::RunPath => Some("."),
        }
    }

    fn validate(&self, value: &str) -> bool {
        !value.is_empty()
    }
}

struct LocalProcess {
    child: Child,
    target_file: Option<PathBuf>,
    /// Set once the process has been reaped.
    finished: Option<BackendStatus>,
}

impl LocalProcess {
    fn refresh(&mut self) -> BackendStatus {
        if let Some(status) = self.finished {
            return status;
        }
        match self.child.try_wait() {
            Ok(None) => BackendStatus::Running,
            Ok(Some(exit)) => {
                let status = if !exit.success() {
                    log::debug!("Local process exited with {exit}");
                    BackendStatus::Failed
                } else if let Some(target) = self.target_file.as_ref().filter(|t| !t.exists()) {
                    log::warn!(
                        "Local process finished, but target file {} was not created",
                        target.display()
                    );
                    BackendStatus::Failed
                } else {
                    BackendStatus::Done
                };
                self.finished = Some(status);
                status
            }
            Err(error) => {
                log::warn!("Cannot query local process: {error}");
                BackendStatus::Unknown
            }
        }
    }
}

/// Runs jobs as child processes of the current process.
pub struct LocalDriver {
    options: DriverOptions<LocalOption>,
    processes: Mutex<Map<BackendHandle, LocalProcess>>,
    process_counter: AtomicU64,
}

impl Default for LocalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDriver {
    pub fn new() -> Self {
        Self {
            options: Default::default(),
            processes: Mutex::new(Default::default()),
            process_counter: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    async fn process_count(&self) -> usize {
        self.processes.lock().await.len()
    }

    fn run_path(&self) -> PathBuf {
        PathBuf::from(self.options.get(LocalOption::RunPath).unwrap_or("."))
    }

    async fn spawn(&self, request: &SubmitRequest) -> Result<BackendHandle, SubmitError> {
        let spec = &request.spec;
        let run_path = self.run_path();

        if let Some(start_file) = spec.start_file() {
            let start_file = run_path.join(start_file);
            if !start_file.exists() {
                return Err(SubmitError::Rejected(anyhow::anyhow!(
                    "Start file {} does not exist",
                    start_file.display()
                )));
            }
        }

        let mut command = create_command(&[request.executable.as_str()], Some(&run_path));
        command
            .args(spec.arguments())
            .envs(spec.environment())
            .stdin(open_stdio(&run_path, spec.stdin_file(), false).map_err(SubmitError::Spawn)?)
            .stdout(open_stdio(&run_path, spec.stdout_file(), true).map_err(SubmitError::Spawn)?)
            .stderr(open_stdio(&run_path, spec.stderr_file(), true).map_err(SubmitError::Spawn)?);

        let child = command
            .spawn()
            .with_context(|| format!("Cannot start {}", request.executable))
            .map_err(SubmitError::Spawn)?;

        let counter = self.process_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = BackendHandle::new(match child.id() {
            Some(pid) => format!("{counter}.{pid}"),
            None => counter.to_string(),
        });
        log::debug!(
            "Job {} started locally as {handle}: {} {}",
            request.job_id,
            request.executable,
            spec.arglist_string()
        );

        let process = LocalProcess {
            child,
            target_file: spec.target_file().map(|target| run_path.join(target)),
            finished: None,
        };
        self.processes.lock().await.insert(handle.clone(), process);
        Ok(handle)
    }
}

fn open_stdio(run_path: &Path, file: Option<&str>, write: bool) -> anyhow::Result<Stdio> {
    let Some(file) = file else {
        return Ok(Stdio::null());
    };
    let path = run_path.join(file);
    let file = if write {
        File::create(&path)
    } else {
        File::open(&path)
    }
    .with_context(|| format!("Cannot open {}", path.display()))?;
    Ok(Stdio::from(file))
}

impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        LocalOption::DRIVER
    }

    fn configure(&mut self, name: &str, value: &str) -> bool {
        self.options.set(name, value)
    }

    fn get_option(&self, name: &str) -> Result<String, ConfigurationError> {
        self.options.get_by_name(name)
    }

    fn option_names(&self) -> Vec<&'static str> {
        DriverOptions::<LocalOption>::names()
    }

    fn submission_method(&self) -> SubmissionMethod {
        SubmissionMethod::LocalShell
    }

    fn submit<'a>(
        &'a self,
        request: &'a SubmitRequest,
    ) -> BoxFuture<'a, Result<BackendHandle, SubmitError>> {
        Box::pin(self.spawn(request))
    }

    fn poll<'a>(&'a self, handle: &'a BackendHandle) -> BoxFuture<'a, BackendStatus> {
        Box::pin(async move {
            let mut processes = self.processes.lock().await;
            let Some(process) = processes.get_mut(handle) else {
                log::warn!("Unknown local process {handle}");
                return BackendStatus::Unknown;
            };
            let status = process.refresh();
            // A finished process is reported once, later polls of its handle are unknown.
            if matches!(status, BackendStatus::Done | BackendStatus::Failed) {
                processes.remove(handle);
            }
            status
        })
    }

    fn kill<'a>(&'a self, handle: &'a BackendHandle) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut processes = self.processes.lock().await;
            let Some(process) = processes.get_mut(handle) else {
                return false;
            };
            if process.refresh() != BackendStatus::Running {
                return false;
            }
            let Some(pid) = process.child.id() else {
                return false;
            };
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    log::debug!("Sent SIGTERM to local process {handle}");
                    true
                }
                Err(error) => {
                    log::warn!("Cannot kill local process {handle}: {error}");
                    false
                }
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::LocalDriver;
    use crate::JobId;
    use crate::common::error::SubmitError;
    use crate::driver::{BackendHandle, BackendStatus, Driver, SubmitRequest};
    use crate::jobspec::JobSpec;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request(spec: JobSpec, executable: &str) -> SubmitRequest {
        SubmitRequest {
            job_id: JobId::new(1),
            attempt: 1,
            spec: Arc::new(spec),
            executable: executable.to_string(),
        }
    }

    fn driver(dir: &TempDir) -> LocalDriver {
        let mut driver = LocalDriver::new();
        assert!(driver.configure("RUN_PATH", dir.path().to_str().unwrap()));
        driver
    }

    async fn wait_for_exit(driver: &LocalDriver, handle: &BackendHandle) -> BackendStatus {
        for _ in 0..500 {
            let status = driver.poll(handle).await;
            if status != BackendStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Process did not finish");
    }

    #[test]
    fn run_path_option() {
        let mut driver = LocalDriver::new();
        assert_eq!(driver.get_option("RUN_PATH").unwrap(), ".");
        assert!(!driver.configure("RUN_PATH", ""));
        assert!(!driver.configure("BSUB_CMD", "bsub"));
        assert_eq!(driver.option_names(), vec!["RUN_PATH"]);
    }

    #[tokio::test]
    async fn run_with_redirections_and_env() {
        let dir = TempDir::with_prefix("batchq").unwrap();
        std::fs::write(dir.path().join("input"), "from stdin\n").unwrap();

        let mut spec = JobSpec::new("echo");
        spec.set_arguments(["-c", "cat; echo \"$GREETING\"; echo err >&2"]);
        spec.add_environment("GREETING", "hello world");
        spec.set_stdin_file("input");
        spec.set_stdout_file("out");
        spec.set_stderr_file("err");

        let driver = driver(&dir);
        let request = request(spec, "sh");
        let handle = driver.submit(&request).await.unwrap();
        assert_eq!(wait_for_exit(&driver, &handle).await, BackendStatus::Done);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out")).unwrap(),
            "from stdin\nhello world\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("err")).unwrap(),
            "err\n"
        );
    }

    #[tokio::test]
    async fn failing_process() {
        let dir = TempDir::with_prefix("batchq").unwrap();
        let mut spec = JobSpec::new("fail");
        spec.set_arguments(["-c", "exit 1"]);
        let driver = driver(&dir);
        let handle = driver.submit(&request(spec, "sh")).await.unwrap();
        assert_eq!(wait_for_exit(&driver, &handle).await, BackendStatus::Failed);
    }

    #[tokio::test]
    async fn missing_start_file_is_retryable() {
        let dir = TempDir::with_prefix("batchq").unwrap();
        let mut spec = JobSpec::new("wait");
        spec.set_start_file("READY");
        let driver = driver(&dir);
        let error = driver.submit(&request(spec, "true")).await.unwrap_err();
        assert!(matches!(error, SubmitError::Rejected(_)));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let dir = TempDir::with_prefix("batchq").unwrap();
        let driver = driver(&dir);
        let error = driver
            .submit(&request(JobSpec::new("x"), "/non/existing/binary"))
            .await
            .unwrap_err();
        assert!(matches!(error, SubmitError::Spawn(_)));
    }

    #[tokio::test]
    async fn missing_target_file_fails() {
        let dir = TempDir::with_prefix("batchq").unwrap();
        let mut spec = JobSpec::new("target");
        spec.set_target_file("RESULT");
        let driver = driver(&dir);
        let handle = driver.submit(&request(spec.clone(), "true")).await.unwrap();
        assert_eq!(wait_for_exit(&driver, &handle).await, BackendStatus::Failed);

        spec.set_arguments(["RESULT"]);
        let handle = driver.submit(&request(spec, "touch")).await.unwrap();
        assert_eq!(wait_for_exit(&driver, &handle).await, BackendStatus::Done);
    }

    #[tokio::test]
    async fn kill_running_process() {
        let dir = TempDir::with_prefix("batchq").unwrap();
        let mut spec = JobSpec::new("sleep");
        spec.set_arguments(["30"]);
        let driver = driver(&dir);
        let handle = driver.submit(&request(spec, "sleep")).await.unwrap();
        assert_eq!(driver.poll(&handle).await, BackendStatus::Running);
        assert!(driver.kill(&handle).await);
        assert_eq!(wait_for_exit(&driver, &handle).await, BackendStatus::Failed);
        assert!(!driver.kill(&handle).await);
    }

    #[tokio::test]
    async fn finished_processes_are_released() {
        let dir = TempDir::with_prefix("batchq").unwrap();
        let driver = driver(&dir);
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(driver.submit(&request(JobSpec::new("t"), "true")).await.unwrap());
        }
        assert_eq!(driver.process_count().await, 3);
        for handle in &handles {
            assert_eq!(wait_for_exit(&driver, handle).await, BackendStatus::Done);
        }
        assert_eq!(driver.process_count().await, 0);
        assert_eq!(driver.poll(&handles[0]).await, BackendStatus::Unknown);
    }

    #[tokio::test]
    async fn poll_unknown_handle() {
        let driver = LocalDriver::new();
        let handle = BackendHandle::new("42");
        assert_eq!(driver.poll(&handle).await, BackendStatus::Unknown);
        assert!(!driver.kill(&handle).await);
    }
}
