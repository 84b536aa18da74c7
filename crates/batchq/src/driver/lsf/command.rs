use std::collections::BTreeMap;

use crate::driver::BackendStatus;

/// One submission as seen by LSF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsfSubmission {
    pub name: String,
    pub queue: Option<String>,
    pub resource: Option<String>,
    pub login_shell: Option<String>,
    pub stdin: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub executable: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

/// `bsub [-q queue] [-R resource] [-L shell] -J name [-i stdin] -o stdout -e stderr exe args...`
pub fn build_bsub_arguments(bsub: &str, submission: &LsfSubmission) -> Vec<String> {
    let mut arguments = vec![bsub.to_string()];
    let mut push_flag = |flag: &str, value: &str| {
        arguments.push(flag.to_string());
        arguments.push(value.to_string());
    };

    if let Some(queue) = &submission.queue {
        push_flag("-q", queue);
    }
    if let Some(resource) = &submission.resource {
        push_flag("-R", resource);
    }
    if let Some(shell) = &submission.login_shell {
        push_flag("-L", shell);
    }
    push_flag("-J", &submission.name);
    if let Some(stdin) = &submission.stdin {
        push_flag("-i", stdin);
    }
    push_flag("-o", &submission.stdout);
    push_flag("-e", &submission.stderr);

    arguments.push(submission.executable.clone());
    arguments.extend(submission.arguments.iter().cloned());
    arguments
}

/// Extracts the job id out of `Job <1234> is submitted to queue <normal>.`
pub fn parse_bsub_job_id(output: &str) -> anyhow::Result<String> {
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix("Job <") else {
            continue;
        };
        let Some((id, tail)) = rest.split_once('>') else {
            continue;
        };
        if tail.trim_start().starts_with("is submitted")
            && !id.is_empty()
            && id.chars().all(|c| c.is_ascii_digit())
        {
            return Ok(id.to_string());
        }
    }
    Err(anyhow::anyhow!("Cannot find job id in bsub output `{output}`"))
}

pub fn build_bjobs_arguments(bjobs: &str, job_id: &str) -> Vec<String> {
    vec![bjobs.to_string(), "-a".to_string(), job_id.to_string()]
}

pub fn build_bkill_arguments(bkill: &str, job_id: &str) -> Vec<String> {
    vec![bkill.to_string(), job_id.to_string()]
}

pub fn parse_lsf_state(state: &str) -> BackendStatus {
    match state {
        "PEND" | "PSUSP" => BackendStatus::Pending,
        "RUN" | "USUSP" | "SSUSP" => BackendStatus::Running,
        "DONE" => BackendStatus::Done,
        "EXIT" => BackendStatus::Failed,
        state => {
            log::debug!("Unknown LSF job state {state}");
            BackendStatus::Unknown
        }
    }
}

/// Finds the state of `job_id` in the tabular output of `bjobs -a`.
pub fn parse_bjobs_output(output: &str, job_id: &str) -> anyhow::Result<BackendStatus> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty bjobs output"))?;
    let state_column = header
        .split_whitespace()
        .position(|column| column == "STAT")
        .ok_or_else(|| anyhow::anyhow!("Missing STAT column in bjobs output `{header}`"))?;

    for line in lines {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.first() == Some(&job_id) {
            let state = columns.get(state_column).ok_or_else(|| {
                anyhow::anyhow!("Missing state of job {job_id} in bjobs line `{line}`")
            })?;
            return Ok(parse_lsf_state(state));
        }
    }
    Err(anyhow::anyhow!("Job {job_id} not found in bjobs output"))
}
