//! Definitions of runnable job steps.
pub mod arglist;
pub mod catalog;
pub mod record;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::error::usage_error;
use crate::jobspec::arglist::{format_arglist, parse_arglist};

/// Immutable description of one runnable unit.
///
/// A spec is built with the setters below and then handed to the queue, which shares it
/// between all attempts of the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    name: String,
    executable: Option<String>,
    /// Executable overrides keyed by platform name.
    platform_exe: BTreeMap<String, String>,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
    stdin_file: Option<String>,
    stdout_file: Option<String>,
    stderr_file: Option<String>,
    start_file: Option<String>,
    target_file: Option<String>,
    config_file: Option<String>,
    resource_request: Option<String>,
    /// 0 means unlimited.
    max_running: u32,
    /// 0 means no timeout.
    max_running_minutes: u32,
    private: bool,
}

impl JobSpec {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Creates a spec without a name. It has to be named before it is persisted or enqueued.
    pub fn unnamed() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        self.name = name.into();
    }

    pub fn has_name(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn executable(&self) -> Option<&str> {
        self.executable.as_deref()
    }

    pub fn set_executable<S: Into<String>>(&mut self, executable: S) {
        self.executable = Some(executable.into());
    }

    pub fn add_platform_exe<P: Into<String>, E: Into<String>>(&mut self, platform: P, exe: E) {
        self.platform_exe.insert(platform.into(), exe.into());
    }

    pub fn clear_platform_exe(&mut self) {
        self.platform_exe.clear();
    }

    pub fn platform_exe(&self) -> &BTreeMap<String, String> {
        &self.platform_exe
    }

    /// Returns the executable that should be started on `platform`.
    /// A platform specific override wins over the default executable.
    pub fn executable_for(&self, platform: Option<&str>) -> Option<&str> {
        platform
            .and_then(|platform| self.platform_exe.get(platform))
            .map(|exe| exe.as_str())
            .or(self.executable.as_deref())
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn set_arguments<I, S>(&mut self, arguments: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(|arg| arg.into()).collect();
    }

    pub fn arglist_string(&self) -> String {
        format_arglist(&self.arguments)
    }

    pub fn set_arglist_from_string(&mut self, arglist: &str) -> crate::Result<()> {
        self.arguments = parse_arglist(arglist)?;
        Ok(())
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Sets an environment variable, overwriting a previous value of the same key.
    pub fn add_environment<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.environment.insert(key.into(), value.into());
    }

    pub fn clear_environment(&mut self) {
        self.environment.clear();
    }

    pub fn stdin_file(&self) -> Option<&str> {
        self.stdin_file.as_deref()
    }

    pub fn set_stdin_file<S: Into<String>>(&mut self, path: S) {
        self.stdin_file = Some(path.into());
    }

    pub fn stdout_file(&self) -> Option<&str> {
        self.stdout_file.as_deref()
    }

    pub fn set_stdout_file<S: Into<String>>(&mut self, path: S) {
        self.stdout_file = Some(path.into());
    }

    pub fn stderr_file(&self) -> Option<&str> {
        self.stderr_file.as_deref()
    }

    pub fn set_stderr_file<S: Into<String>>(&mut self, path: S) {
        self.stderr_file = Some(path.into());
    }

    pub fn start_file(&self) -> Option<&str> {
        self.start_file.as_deref()
    }

    pub fn set_start_file<S: Into<String>>(&mut self, path: S) {
        self.start_file = Some(path.into());
    }

    pub fn target_file(&self) -> Option<&str> {
        self.target_file.as_deref()
    }

    pub fn set_target_file<S: Into<String>>(&mut self, path: S) {
        self.target_file = Some(path.into());
    }

    pub fn config_file(&self) -> Option<&str> {
        self.config_file.as_deref()
    }

    pub fn set_config_file<S: Into<String>>(&mut self, path: S) {
        self.config_file = Some(path.into());
    }

    pub fn resource_request(&self) -> Option<&str> {
        self.resource_request.as_deref()
    }

    pub fn set_resource_request<S: Into<String>>(&mut self, request: S) {
        self.resource_request = Some(request.into());
    }

    pub fn max_running(&self) -> u32 {
        self.max_running
    }

    pub fn set_max_running(&mut self, max_running: u32) {
        self.max_running = max_running;
    }

    pub fn max_running_minutes(&self) -> u32 {
        self.max_running_minutes
    }

    pub fn set_max_running_minutes(&mut self, minutes: u32) {
        self.max_running_minutes = minutes;
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn is_shared(&self) -> bool {
        !self.private
    }

    pub fn set_private(&mut self, private: bool) {
        self.private = private;
    }

    /// Checks that the spec can be handed to a driver at all.
    pub fn validate_for_submit(&self) -> crate::Result<()> {
        if !self.has_name() {
            return usage_error("Cannot submit a job without a name".to_string());
        }
        if self.executable.is_none() && self.platform_exe.is_empty() {
            return usage_error(format!("Job {} has no executable", self.name));
        }
        Ok(())
    }
}
