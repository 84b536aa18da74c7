//! Persisted key/value form of a [`JobSpec`].
//!
//! Every line holds one `KEY value` pair. Blank lines and lines starting with `--` are
//! ignored. `PLATFORM_EXE` and `ENV` may repeat, a repeated single-value key overrides the
//! previous occurrence.
//!
//! `ARGLIST`, `PLATFORM_EXE` and `ENV` values are quoted like an argument list, so empty values
//! and values with spaces survive a save and load. Values spanning several lines and single
//! values with surrounding whitespace cannot be stored and are refused when persisting.
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;

use crate::common::error::{BatchQueueError, usage_error};
use crate::common::parser::{consume_all, p_u32};
use crate::jobspec::JobSpec;
use crate::jobspec::arglist::{format_arglist, parse_arglist};

const COMMENT_PREFIX: &str = "--";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKey {
    Name,
    Executable,
    PlatformExe,
    Stdin,
    Stdout,
    Stderr,
    StartFile,
    TargetFile,
    ConfigFile,
    Arglist,
    Env,
    LsfResources,
    MaxRunning,
    MaxRunningMinutes,
    Private,
}

impl RecordKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKey::Name => "NAME",
            RecordKey::Executable => "EXECUTABLE",
            RecordKey::PlatformExe => "PLATFORM_EXE",
            RecordKey::Stdin => "STDIN",
            RecordKey::Stdout => "STDOUT",
            RecordKey::Stderr => "STDERR",
            RecordKey::StartFile => "START_FILE",
            RecordKey::TargetFile => "TARGET_FILE",
            RecordKey::ConfigFile => "CONFIG_FILE",
            RecordKey::Arglist => "ARGLIST",
            RecordKey::Env => "ENV",
            RecordKey::LsfResources => "LSF_RESOURCES",
            RecordKey::MaxRunning => "MAX_RUNNING",
            RecordKey::MaxRunningMinutes => "MAX_RUNNING_MINUTES",
            RecordKey::Private => "PRIVATE",
        }
    }
}

impl FromStr for RecordKey {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key = match value {
            "NAME" => RecordKey::Name,
            "EXECUTABLE" => RecordKey::Executable,
            "PLATFORM_EXE" => RecordKey::PlatformExe,
            "STDIN" => RecordKey::Stdin,
            "STDOUT" => RecordKey::Stdout,
            "STDERR" => RecordKey::Stderr,
            "START_FILE" => RecordKey::StartFile,
            "TARGET_FILE" => RecordKey::TargetFile,
            "CONFIG_FILE" => RecordKey::ConfigFile,
            "ARGLIST" => RecordKey::Arglist,
            "ENV" => RecordKey::Env,
            "LSF_RESOURCES" => RecordKey::LsfResources,
            "MAX_RUNNING" => RecordKey::MaxRunning,
            "MAX_RUNNING_MINUTES" => RecordKey::MaxRunningMinutes,
            "PRIVATE" => RecordKey::Private,
            _ => anyhow::bail!("Unknown job record key `{value}`"),
        };
        Ok(key)
    }
}

/// Ordered list of record entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRecord {
    entries: Vec<(RecordKey, String)>,
}

impl JobRecord {
    /// Converts a spec into its record. Unnamed specs cannot be persisted.
    pub fn from_spec(spec: &JobSpec) -> crate::Result<Self> {
        if !spec.has_name() {
            return usage_error("Cannot persist a job without a name".to_string());
        }

        let mut record = JobRecord::default();
        record.push_single(RecordKey::Name, spec.name())?;
        if let Some(executable) = spec.executable() {
            record.push_single(RecordKey::Executable, executable)?;
        }
        for (platform, exe) in spec.platform_exe() {
            record.push_pair(RecordKey::PlatformExe, platform, exe)?;
        }

        let files = [
            (RecordKey::Stdin, spec.stdin_file()),
            (RecordKey::Stdout, spec.stdout_file()),
            (RecordKey::Stderr, spec.stderr_file()),
            (RecordKey::StartFile, spec.start_file()),
            (RecordKey::TargetFile, spec.target_file()),
            (RecordKey::ConfigFile, spec.config_file()),
        ];
        for (key, value) in files {
            if let Some(value) = value {
                record.push_single(key, value)?;
            }
        }

        if !spec.arguments().is_empty() {
            for argument in spec.arguments() {
                check_single_line(RecordKey::Arglist, argument)?;
            }
            record.push(RecordKey::Arglist, spec.arglist_string());
        }
        for (key, value) in spec.environment() {
            record.push_pair(RecordKey::Env, key, value)?;
        }
        if let Some(resources) = spec.resource_request() {
            record.push_single(RecordKey::LsfResources, resources)?;
        }
        if spec.max_running() > 0 {
            record.push(RecordKey::MaxRunning, spec.max_running().to_string());
        }
        if spec.max_running_minutes() > 0 {
            record.push(
                RecordKey::MaxRunningMinutes,
                spec.max_running_minutes().to_string(),
            );
        }
        record.push(
            RecordKey::Private,
            if spec.is_private() { "TRUE" } else { "FALSE" },
        );
        Ok(record)
    }

    pub fn parse(text: &str) -> crate::Result<Self> {
        let mut record = JobRecord::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(COMMENT_PREFIX) {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };
            let key = key.parse::<RecordKey>().map_err(|e| {
                BatchQueueError::DeserializationError(format!("line {}: {e}", index + 1))
            })?;
            if value.is_empty() && key != RecordKey::Arglist {
                return Err(BatchQueueError::DeserializationError(format!(
                    "line {}: key {} has no value",
                    index + 1,
                    key.as_str()
                )));
            }
            record.push(key, value);
        }
        Ok(record)
    }

    /// Builds a spec out of the record. `default_name` is used when the record has no `NAME`.
    pub fn to_spec(&self, default_name: Option<&str>) -> crate::Result<JobSpec> {
        let mut spec = JobSpec::unnamed();
        if let Some(name) = default_name {
            spec.set_name(name);
        }

        for (key, value) in &self.entries {
            let value = value.as_str();
            match key {
                RecordKey::Name => spec.set_name(value),
                RecordKey::Executable => spec.set_executable(value),
                RecordKey::PlatformExe => {
                    let (platform, exe) = parse_pair(*key, value)?;
                    spec.add_platform_exe(platform, exe);
                }
                RecordKey::Stdin => spec.set_stdin_file(value),
                RecordKey::Stdout => spec.set_stdout_file(value),
                RecordKey::Stderr => spec.set_stderr_file(value),
                RecordKey::StartFile => spec.set_start_file(value),
                RecordKey::TargetFile => spec.set_target_file(value),
                RecordKey::ConfigFile => spec.set_config_file(value),
                RecordKey::Arglist => spec.set_arglist_from_string(value).map_err(|e| {
                    BatchQueueError::DeserializationError(format!("ARGLIST: {e}"))
                })?,
                RecordKey::Env => {
                    let (name, env_value) = parse_pair(*key, value)?;
                    spec.add_environment(name, env_value);
                }
                RecordKey::LsfResources => spec.set_resource_request(value),
                RecordKey::MaxRunning => spec.set_max_running(parse_count(*key, value)?),
                RecordKey::MaxRunningMinutes => {
                    spec.set_max_running_minutes(parse_count(*key, value)?)
                }
                RecordKey::Private => spec.set_private(parse_bool(*key, value)?),
            }
        }
        Ok(spec)
    }

    pub fn get(&self, key: RecordKey) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, value)| value.as_str())
    }

    fn push<S: Into<String>>(&mut self, key: RecordKey, value: S) {
        self.entries.push((key, value.into()));
    }

    fn push_single(&mut self, key: RecordKey, value: &str) -> crate::Result<()> {
        check_single_line(key, value)?;
        if value.is_empty() || value.trim() != value {
            return usage_error(format!(
                "{} value {value:?} cannot be empty or have surrounding whitespace",
                key.as_str()
            ));
        }
        self.push(key, value);
        Ok(())
    }

    fn push_pair(&mut self, key: RecordKey, first: &str, second: &str) -> crate::Result<()> {
        check_single_line(key, first)?;
        check_single_line(key, second)?;
        if first.is_empty() {
            return usage_error(format!("{} needs a non-empty name", key.as_str()));
        }
        self.push(key, format_arglist(&[first, second]));
        Ok(())
    }
}

impl Display for JobRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (key, value) in &self.entries {
            writeln!(f, "{} {}", key.as_str(), value)?;
        }
        Ok(())
    }
}

fn check_single_line(key: RecordKey, value: &str) -> crate::Result<()> {
    if value.contains(['\n', '\r']) {
        return usage_error(format!(
            "{} value {value:?} cannot span several lines",
            key.as_str()
        ));
    }
    Ok(())
}

/// Unquoted tokens after the first one are joined by a single space.
fn parse_pair(key: RecordKey, value: &str) -> crate::Result<(String, String)> {
    let mut tokens = parse_arglist(value)
        .map_err(|e| BatchQueueError::DeserializationError(format!("{}: {e}", key.as_str())))?;
    if tokens.len() < 2 {
        return Err(BatchQueueError::DeserializationError(format!(
            "{} expects two values, got `{value}`",
            key.as_str()
        )));
    }
    let rest = tokens.split_off(1);
    let first = tokens.remove(0);
    Ok((first, rest.join(" ")))
}

fn parse_count(key: RecordKey, value: &str) -> crate::Result<u32> {
    consume_all(p_u32, value).map_err(|e| {
        BatchQueueError::DeserializationError(format!("{}: {e}", key.as_str()))
    })
}

fn parse_bool(key: RecordKey, value: &str) -> crate::Result<bool> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(BatchQueueError::DeserializationError(format!(
            "{} expects TRUE or FALSE, got `{value}`",
            key.as_str()
        )))
    }
}

/// Writes the spec into `<directory>/<name>` and returns the path of the file.
pub fn save_spec(spec: &JobSpec, directory: &Path) -> crate::Result<PathBuf> {
    let record = JobRecord::from_spec(spec)?;
    let path = directory.join(spec.name());
    std::fs::write(&path, record.to_string())?;
    log::debug!("Job {} saved into {}", spec.name(), path.display());
    Ok(path)
}

/// Loads a spec from a record file.
///
/// Records without `NAME` get `name`, or the file name when `name` is `None`.
/// `private` overrides the `PRIVATE` key of the record when set.
pub fn load_spec(path: &Path, name: Option<&str>, private: Option<bool>) -> crate::Result<JobSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read job file {}", path.display()))?;
    let record = JobRecord::parse(&text)?;
    let default_name = name.or_else(|| path.file_name().and_then(|name| name.to_str()));
    let mut spec = record.to_spec(default_name)?;
    if let Some(private) = private {
        spec.set_private(private);
    }
    Ok(spec)
}
