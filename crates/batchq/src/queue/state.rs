use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::common::error::{SubmitError, usage_error};
use crate::common::utils::time::saturating_add;
use crate::driver::{BackendHandle, BackendStatus, Driver, SubmitRequest};
use crate::jobspec::JobSpec;
use crate::queue::config::{QueueConfig, TimeoutAction};
use crate::{JobId, Map};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    NotSubmitted,
    Submitted,
    Running,
    Done,
    Failed,
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Killed)
    }

    /// The job holds a slot in the backend.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Submitted | JobState::Running)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::NotSubmitted => "NOT_SUBMITTED",
            JobState::Submitted => "SUBMITTED",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Killed => "KILLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Cancel,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct PendingKill {
    pub reason: KillReason,
    pub requested_at: Instant,
    /// The backend accepted the kill request.
    pub accepted: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct InFlight {
    submit: bool,
    poll: bool,
    kill: bool,
}

pub struct Job {
    id: JobId,
    spec: Arc<JobSpec>,
    executable: String,
    driver: Option<Arc<dyn Driver>>,
    state: JobState,
    /// Number of failed attempts.
    attempt_count: u32,
    /// Number of started submissions. Outcomes of older submissions are ignored.
    generation: u32,
    enqueued_at: Instant,
    submitted_at: Option<Instant>,
    submitted_at_utc: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    backend_handle: Option<BackendHandle>,
    unknown_polls: u32,
    retry_at: Option<Instant>,
    pending_kill: Option<PendingKill>,
    cancel_requested: bool,
    in_flight: InFlight,
    error: Option<String>,
}

impl Job {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn spec(&self) -> &Arc<JobSpec> {
        &self.spec
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn submitted_at(&self) -> Option<Instant> {
        self.submitted_at
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn backend_handle(&self) -> Option<&BackendHandle> {
        self.backend_handle.as_ref()
    }

    pub fn pending_kill(&self) -> Option<&PendingKill> {
        self.pending_kill.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn timeout(&self) -> Option<Duration> {
        match self.spec.max_running_minutes() {
            0 => None,
            minutes => Some(Duration::from_secs(u64::from(minutes) * 60)),
        }
    }

    /// Counts against `max_running` limits.
    fn occupies_slot(&self) -> bool {
        self.state.is_active() || self.in_flight.submit
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            name: self.spec.name().to_string(),
            state: self.state,
            attempt_count: self.attempt_count,
            backend_handle: self.backend_handle.as_ref().map(|h| h.to_string()),
            submitted_at: self.submitted_at_utc,
            error: self.error.clone(),
        }
    }
}

pub enum DriverCall {
    Submit(SubmitRequest),
    Poll(BackendHandle),
    Kill(BackendHandle),
}

/// Driver call requested by the state machine.
pub struct Dispatch {
    pub job_id: JobId,
    pub generation: u32,
    pub driver: Arc<dyn Driver>,
    pub call: DriverCall,
}

#[derive(Debug)]
pub enum CallResult {
    Submitted(Result<BackendHandle, SubmitError>),
    Polled(BackendStatus),
    Killed(bool),
}

/// Result of a driver call.
#[derive(Debug)]
pub struct CallOutcome {
    pub job_id: JobId,
    pub generation: u32,
    pub result: CallResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub backend_handle: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub jobs: Vec<JobSummary>,
    /// Every job reached a terminal state.
    pub complete: bool,
}

impl QueueSummary {
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|job| job.state == state).count()
    }

    pub fn all_done(&self) -> bool {
        self.jobs.iter().all(|job| job.state == JobState::Done)
    }
}

/// Identity of a spec for `max_running` limits.
///
/// A name identifies a spec within its visibility scope, so a private spec does not share its
/// limit with a shared spec of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SpecKey {
    private: bool,
    name: String,
}

impl SpecKey {
    fn of(spec: &JobSpec) -> Self {
        Self {
            private: spec.is_private(),
            name: spec.name().to_string(),
        }
    }
}

/// Job table and the state machine driving its jobs.
///
/// The table is only mutated through [`QueueState::tick`], [`QueueState::on_outcome`] and the
/// explicit job operations; driver calls are returned as [`Dispatch`]es and their results are
/// fed back as [`CallOutcome`]s.
pub struct QueueState {
    config: QueueConfig,
    driver: Arc<dyn Driver>,
    jobs: BTreeMap<JobId, Job>,
    id_counter: u32,
    cancelled: bool,
}

impl QueueState {
    pub fn new(config: QueueConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            config,
            driver,
            jobs: Default::default(),
            id_counter: 0,
            cancelled: false,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn add_job(&mut self, spec: Arc<JobSpec>, now: Instant) -> crate::Result<JobId> {
        if self.cancelled {
            return usage_error("Queue has been cancelled, no jobs can be added".to_string());
        }
        spec.validate_for_submit()?;
        let platform = self.config.platform.as_deref();
        let Some(executable) = spec.executable_for(platform) else {
            return usage_error(format!(
                "Job {} has no executable for platform {}",
                spec.name(),
                platform.unwrap_or("<none>")
            ));
        };
        let executable = executable.to_string();

        self.id_counter += 1;
        let id = JobId::new(self.id_counter);
        log::debug!("Job {id} ({}) added to queue", spec.name());
        self.jobs.insert(
            id,
            Job {
                id,
                spec,
                executable,
                driver: None,
                state: JobState::NotSubmitted,
                attempt_count: 0,
                generation: 0,
                enqueued_at: now,
                submitted_at: None,
                submitted_at_utc: None,
                started_at: None,
                backend_handle: None,
                unknown_polls: 0,
                retry_at: None,
                pending_kill: None,
                cancel_requested: false,
                in_flight: InFlight::default(),
                error: None,
            },
        );
        Ok(id)
    }

    pub fn get_job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Marks a job for cancellation. It is handled during the next tick.
    pub fn cancel_job(&mut self, id: JobId) -> crate::Result<()> {
        let Some(job) = self.jobs.get_mut(&id) else {
            return usage_error(format!("Job {id} does not exist"));
        };
        if !job.state.is_terminal() {
            log::debug!("Job {id} marked for cancellation");
            job.cancel_requested = true;
        }
        Ok(())
    }

    /// Marks every job for cancellation and refuses new jobs.
    pub fn cancel_all(&mut self) {
        if !self.cancelled {
            log::info!("Cancelling all jobs");
        }
        self.cancelled = true;
        for job in self.jobs.values_mut() {
            if !job.state.is_terminal() {
                job.cancel_requested = true;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.jobs.values().all(|job| job.state.is_terminal())
    }

    /// Declares every remaining job killed.
    pub fn force_kill_remaining(&mut self) {
        for job in self.jobs.values_mut() {
            if !job.state.is_terminal() {
                log::warn!("Job {} did not terminate in time, marking it killed", job.id);
                set_terminal(job, JobState::Killed);
            }
        }
    }

    pub fn summary(&self) -> QueueSummary {
        QueueSummary {
            jobs: self.jobs.values().map(|job| job.summary()).collect(),
            complete: self.is_finished(),
        }
    }

    pub fn tick(&mut self, now: Instant) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        self.process_cancellations(now, &mut dispatches);
        self.admit_jobs(now, &mut dispatches);
        self.poll_jobs(&mut dispatches);
        self.check_timeouts(now, &mut dispatches);
        self.resolve_expired_kills(now);
        dispatches
    }

    fn process_cancellations(&mut self, now: Instant, dispatches: &mut Vec<Dispatch>) {
        for job in self.jobs.values_mut() {
            if !job.cancel_requested || job.state.is_terminal() {
                continue;
            }
            match job.state {
                JobState::NotSubmitted if !job.in_flight.submit => {
                    log::info!("Job {} cancelled before submission", job.id);
                    job.error = Some("Cancelled".to_string());
                    set_terminal(job, JobState::Killed);
                }
                JobState::Submitted | JobState::Running => {
                    match job.pending_kill.as_mut() {
                        Some(kill) if kill.reason == KillReason::Cancel => {}
                        // A running timeout kill is turned into a cancellation.
                        Some(kill) => kill.reason = KillReason::Cancel,
                        None => {
                            job.pending_kill = Some(PendingKill {
                                reason: KillReason::Cancel,
                                requested_at: now,
                                accepted: false,
                            });
                            dispatches.extend(create_kill(job));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn admit_jobs(&mut self, now: Instant, dispatches: &mut Vec<Dispatch>) {
        let mut active_per_spec: Map<SpecKey, u32> = Map::new();
        let mut active_total = 0;
        for job in self.jobs.values().filter(|job| job.occupies_slot()) {
            *active_per_spec.entry(SpecKey::of(&job.spec)).or_default() += 1;
            active_total += 1;
        }

        let mut admitted = Vec::new();
        for job in self.jobs.values() {
            if job.state != JobState::NotSubmitted
                || job.in_flight.submit
                || job.cancel_requested
                || job.retry_at.is_some_and(|retry_at| retry_at > now)
            {
                continue;
            }
            if self.config.max_running > 0 && active_total >= self.config.max_running {
                break;
            }
            let spec_limit = job.spec.max_running();
            let active = active_per_spec.entry(SpecKey::of(&job.spec)).or_default();
            if spec_limit > 0 && *active >= spec_limit {
                continue;
            }
            *active += 1;
            active_total += 1;
            admitted.push(job.id);
        }

        for id in admitted {
            if let Some(job) = self.jobs.get_mut(&id) {
                dispatches.push(create_submit(job, &self.driver));
            }
        }
    }

    fn poll_jobs(&mut self, dispatches: &mut Vec<Dispatch>) {
        for job in self.jobs.values_mut() {
            if !job.state.is_active() || job.in_flight.poll {
                continue;
            }
            let (Some(driver), Some(handle)) = (&job.driver, &job.backend_handle) else {
                continue;
            };
            dispatches.push(Dispatch {
                job_id: job.id,
                generation: job.generation,
                driver: driver.clone(),
                call: DriverCall::Poll(handle.clone()),
            });
            job.in_flight.poll = true;
        }
    }

    fn check_timeouts(&mut self, now: Instant, dispatches: &mut Vec<Dispatch>) {
        for job in self.jobs.values_mut() {
            if job.state != JobState::Running || job.pending_kill.is_some() {
                continue;
            }
            let (Some(timeout), Some(started_at)) = (job.timeout(), job.started_at) else {
                continue;
            };
            if now.duration_since(started_at) >= timeout {
                log::warn!(
                    "Job {} exceeded its runtime limit of {} minute(s), killing it",
                    job.id,
                    job.spec.max_running_minutes()
                );
                job.pending_kill = Some(PendingKill {
                    reason: KillReason::Timeout,
                    requested_at: now,
                    accepted: false,
                });
                dispatches.extend(create_kill(job));
            }
        }
    }

    fn resolve_expired_kills(&mut self, now: Instant) {
        let grace_period = self.config.kill_grace_period;
        let mut expired = Vec::new();
        for job in self.jobs.values() {
            if let Some(kill) = &job.pending_kill {
                if !job.state.is_terminal() && now.duration_since(kill.requested_at) >= grace_period
                {
                    expired.push((job.id, kill.reason));
                }
            }
        }

        for (id, reason) in expired {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            match reason {
                KillReason::Cancel => {
                    log::warn!("Job {id} was not confirmed killed in time, marking it killed");
                    job.error = Some("Cancelled".to_string());
                    set_terminal(job, JobState::Killed);
                }
                KillReason::Timeout => {
                    let message = "Runtime limit exceeded and the job could not be killed";
                    on_failure(job, &self.config, message.to_string(), now);
                }
            }
        }
    }

    /// Applies the result of a driver call.
    pub fn on_outcome(&mut self, outcome: CallOutcome, now: Instant) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        let Some(job) = self.jobs.get_mut(&outcome.job_id) else {
            log::warn!("Outcome for unknown job {}", outcome.job_id);
            return dispatches;
        };
        if outcome.generation != job.generation {
            log::debug!(
                "Ignoring outcome of job {} from submission {}, current submission is {}",
                job.id,
                outcome.generation,
                job.generation
            );
            return dispatches;
        }
        match outcome.result {
            CallResult::Submitted(result) => {
                job.in_flight.submit = false;
                if job.state.is_terminal() {
                    return dispatches;
                }
                self.on_submitted(outcome.job_id, result, now, &mut dispatches);
            }
            CallResult::Polled(status) => {
                job.in_flight.poll = false;
                if job.state.is_active() {
                    on_polled(job, &self.config, status, now);
                }
            }
            CallResult::Killed(accepted) => {
                job.in_flight.kill = false;
                if let Some(kill) = job.pending_kill.as_mut() {
                    kill.accepted = accepted;
                    if accepted {
                        log::debug!("Kill of job {} accepted", job.id);
                    } else {
                        log::warn!("Backend refused to kill job {}", job.id);
                    }
                }
            }
        }
        dispatches
    }

    fn on_submitted(
        &mut self,
        id: JobId,
        result: Result<BackendHandle, SubmitError>,
        now: Instant,
        dispatches: &mut Vec<Dispatch>,
    ) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        match result {
            Ok(handle) => {
                log::info!(
                    "Job {id} ({}) submitted as {handle}, attempt {}",
                    job.spec.name(),
                    job.generation
                );
                job.state = JobState::Submitted;
                job.backend_handle = Some(handle);
                job.submitted_at = Some(now);
                job.submitted_at_utc = Some(Utc::now());
                job.unknown_polls = 0;
                job.retry_at = None;
                if job.cancel_requested {
                    job.pending_kill = Some(PendingKill {
                        reason: KillReason::Cancel,
                        requested_at: now,
                        accepted: false,
                    });
                    dispatches.extend(create_kill(job));
                }
            }
            Err(error) if job.cancel_requested => {
                log::debug!("Submission of cancelled job {id} failed: {error}");
                job.error = Some("Cancelled".to_string());
                set_terminal(job, JobState::Killed);
            }
            Err(error) if error.is_retryable() => {
                on_failure(job, &self.config, format!("{error:#}"), now);
            }
            Err(error) => {
                log::error!("Job {id} cannot be submitted: {error}");
                job.error = Some(error.to_string());
                set_terminal(job, JobState::Failed);
            }
        }
    }
}

fn create_submit(job: &mut Job, driver: &Arc<dyn Driver>) -> Dispatch {
    job.generation += 1;
    job.in_flight = InFlight {
        submit: true,
        poll: false,
        kill: false,
    };
    job.driver = Some(driver.clone());
    log::debug!(
        "Submitting job {} ({}), attempt {}",
        job.id,
        job.spec.name(),
        job.generation
    );
    Dispatch {
        job_id: job.id,
        generation: job.generation,
        driver: driver.clone(),
        call: DriverCall::Submit(SubmitRequest {
            job_id: job.id,
            attempt: job.generation,
            spec: job.spec.clone(),
            executable: job.executable.clone(),
        }),
    }
}

fn create_kill(job: &mut Job) -> Option<Dispatch> {
    if job.in_flight.kill {
        return None;
    }
    let (Some(driver), Some(handle)) = (&job.driver, &job.backend_handle) else {
        return None;
    };
    let dispatch = Dispatch {
        job_id: job.id,
        generation: job.generation,
        driver: driver.clone(),
        call: DriverCall::Kill(handle.clone()),
    };
    job.in_flight.kill = true;
    Some(dispatch)
}

fn on_polled(job: &mut Job, config: &QueueConfig, status: BackendStatus, now: Instant) {
    if status != BackendStatus::Unknown {
        job.unknown_polls = 0;
    }
    match status {
        BackendStatus::Pending => {}
        BackendStatus::Running => {
            if job.state == JobState::Submitted {
                log::debug!("Job {} is running", job.id);
                job.state = JobState::Running;
                job.started_at = Some(now);
            }
        }
        BackendStatus::Done => {
            log::info!("Job {} ({}) finished", job.id, job.spec.name());
            set_terminal(job, JobState::Done);
        }
        BackendStatus::Failed => match job.pending_kill.as_ref().map(|kill| kill.reason) {
            Some(KillReason::Cancel) => {
                log::info!("Job {} killed", job.id);
                job.error = Some("Cancelled".to_string());
                set_terminal(job, JobState::Killed);
            }
            Some(KillReason::Timeout) => match config.on_timeout {
                TimeoutAction::Kill => {
                    log::info!("Job {} killed after exceeding its runtime limit", job.id);
                    job.error = Some("Runtime limit exceeded".to_string());
                    set_terminal(job, JobState::Killed);
                }
                TimeoutAction::Retry => {
                    on_failure(job, config, "Runtime limit exceeded".to_string(), now);
                }
            },
            None => on_failure(job, config, "Job failed in the backend".to_string(), now),
        },
        BackendStatus::Unknown => {
            job.unknown_polls += 1;
            if job.unknown_polls > config.max_unknown_polls {
                let message = format!(
                    "Status of the job was unknown {} times in a row",
                    job.unknown_polls
                );
                on_failure(job, config, message, now);
            } else {
                log::debug!(
                    "Status of job {} is unknown ({}/{})",
                    job.id,
                    job.unknown_polls,
                    config.max_unknown_polls
                );
            }
        }
    }
}

/// Records a failed attempt and either schedules a resubmission or fails the job.
fn on_failure(job: &mut Job, config: &QueueConfig, reason: String, now: Instant) {
    job.attempt_count += 1;
    job.backend_handle = None;
    job.pending_kill = None;
    job.started_at = None;
    job.unknown_polls = 0;

    if job.cancel_requested {
        log::info!("Job {} failed after cancellation: {reason}", job.id);
        job.error = Some(reason);
        set_terminal(job, JobState::Killed);
    } else if job.attempt_count <= config.retry_limit {
        let delay = config.backoff.delay(job.attempt_count);
        log::warn!(
            "Job {} ({}) failed: {reason}; retrying in {} ({}/{})",
            job.id,
            job.spec.name(),
            humantime::format_duration(delay),
            job.attempt_count,
            config.retry_limit
        );
        job.error = Some(reason);
        job.state = JobState::NotSubmitted;
        job.retry_at = Some(saturating_add(now, delay));
    } else {
        log::error!(
            "Job {} ({}) failed after {} attempt(s): {reason}",
            job.id,
            job.spec.name(),
            job.attempt_count
        );
        job.error = Some(reason);
        set_terminal(job, JobState::Failed);
    }
}

fn set_terminal(job: &mut Job, state: JobState) {
    debug_assert!(state.is_terminal());
    job.state = state;
    job.pending_kill = None;
    job.retry_at = None;
    if state == JobState::Done {
        job.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::{CallOutcome, CallResult, Dispatch, DriverCall, JobState, QueueState};
    use crate::common::error::SubmitError;
    use crate::driver::{BackendHandle, BackendStatus};
    use crate::jobspec::JobSpec;
    use crate::queue::config::{QueueConfig, TimeoutAction};
    use crate::tests::driver::ScriptedDriver;
    use crate::tests::utils::{TestConfigBuilder, spec};
    use crate::{Error, JobId};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn create_state(config: QueueConfig) -> QueueState {
        QueueState::new(config, Arc::new(ScriptedDriver::default()))
    }

    fn add(state: &mut QueueState, spec: JobSpec, now: Instant) -> JobId {
        state.add_job(Arc::new(spec), now).unwrap()
    }

    /// One submission of a job, used to address outcomes.
    #[derive(Clone, Copy)]
    struct Attempt {
        job_id: JobId,
        generation: u32,
    }

    impl Attempt {
        fn of(dispatch: &Dispatch) -> Self {
            Self {
                job_id: dispatch.job_id,
                generation: dispatch.generation,
            }
        }

        fn outcome(self, result: CallResult) -> CallOutcome {
            CallOutcome {
                job_id: self.job_id,
                generation: self.generation,
                result,
            }
        }

        fn polled(self, status: BackendStatus) -> CallOutcome {
            self.outcome(CallResult::Polled(status))
        }
    }

    fn outcome(dispatch: &Dispatch, result: CallResult) -> CallOutcome {
        Attempt::of(dispatch).outcome(result)
    }

    fn submitted(dispatch: &Dispatch) -> CallOutcome {
        let handle = BackendHandle::new(format!("b{}", dispatch.job_id));
        outcome(dispatch, CallResult::Submitted(Ok(handle)))
    }

    fn submits(dispatches: &[Dispatch]) -> Vec<&Dispatch> {
        dispatches
            .iter()
            .filter(|d| matches!(d.call, DriverCall::Submit(_)))
            .collect()
    }

    fn polls(dispatches: &[Dispatch]) -> Vec<&Dispatch> {
        dispatches
            .iter()
            .filter(|d| matches!(d.call, DriverCall::Poll(_)))
            .collect()
    }

    fn kills(dispatches: &[Dispatch]) -> Vec<&Dispatch> {
        dispatches
            .iter()
            .filter(|d| matches!(d.call, DriverCall::Kill(_)))
            .collect()
    }

    fn active_count(state: &QueueState) -> usize {
        state.jobs().filter(|job| job.occupies_slot()).count()
    }

    /// Submits the first admitted job and makes it running. A poll of the job stays in flight.
    fn start_job(state: &mut QueueState, now: Instant) -> Attempt {
        let dispatches = state.tick(now);
        let submit = submits(&dispatches)[0];
        let job_id = submit.job_id;
        state.on_outcome(submitted(submit), now);

        let dispatches = state.tick(now);
        let poll = polls(&dispatches)
            .into_iter()
            .find(|d| d.job_id == job_id)
            .unwrap();
        let attempt = Attempt::of(poll);
        state.on_outcome(attempt.polled(BackendStatus::Running), now);
        assert_eq!(state.get_job(job_id).unwrap().state(), JobState::Running);

        let dispatches = state.tick(now);
        assert!(polls(&dispatches).iter().any(|d| d.job_id == job_id));
        attempt
    }

    #[test]
    fn fifo_admission() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let a = add(&mut state, spec("a"), now);
        let b = add(&mut state, spec("b"), now);
        let dispatches = state.tick(now);
        let ids: Vec<JobId> = submits(&dispatches).iter().map(|d| d.job_id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(state.tick(now).is_empty());
    }

    #[test]
    fn spec_max_running_is_respected() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let mut limited = spec("sim");
        limited.set_max_running(2);
        for _ in 0..5 {
            add(&mut state, limited.clone(), now);
        }

        let mut finished = 0;
        let mut pending = state.tick(now);
        let mut time = now;
        while finished < 5 {
            assert!(active_count(&state) <= 2);
            let mut next = Vec::new();
            for dispatch in pending {
                let result = match &dispatch.call {
                    DriverCall::Submit(_) => {
                        CallResult::Submitted(Ok(BackendHandle::new(dispatch.job_id.to_string())))
                    }
                    DriverCall::Poll(_) => {
                        finished += 1;
                        CallResult::Polled(BackendStatus::Done)
                    }
                    DriverCall::Kill(_) => CallResult::Killed(true),
                };
                next.extend(state.on_outcome(outcome(&dispatch, result), time));
                assert!(active_count(&state) <= 2);
            }
            time += Duration::from_secs(1);
            next.extend(state.tick(time));
            assert!(submits(&next).len() <= 2);
            pending = next;
        }
        assert!(state.is_finished());
        assert_eq!(state.summary().count(JobState::Done), 5);
    }

    #[test]
    fn queue_max_running_is_respected() {
        let now = Instant::now();
        let mut state = create_state(TestConfigBuilder::default().max_running(1).build());
        add(&mut state, spec("a"), now);
        add(&mut state, spec("b"), now);
        assert_eq!(submits(&state.tick(now)).len(), 1);
        assert!(submits(&state.tick(now)).is_empty());
    }

    #[test]
    fn private_and_shared_specs_have_separate_limits() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let mut shared = spec("sim");
        shared.set_max_running(1);
        let mut private = shared.clone();
        private.set_private(true);
        let shared = add(&mut state, shared, now);
        add(&mut state, spec_with_limit("sim", 1), now);
        let private = add(&mut state, private, now);

        let ids: Vec<JobId> = submits(&state.tick(now)).iter().map(|d| d.job_id).collect();
        assert_eq!(ids, vec![shared, private]);
    }

    fn spec_with_limit(name: &str, limit: u32) -> JobSpec {
        let mut spec = spec(name);
        spec.set_max_running(limit);
        spec
    }

    #[test]
    fn per_spec_limit_does_not_block_other_specs() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let mut limited = spec("limited");
        limited.set_max_running(1);
        add(&mut state, limited.clone(), now);
        add(&mut state, limited, now);
        let free = add(&mut state, spec("free"), now);
        let dispatches = state.tick(now);
        let ids: Vec<JobId> = submits(&dispatches).iter().map(|d| d.job_id).collect();
        assert_eq!(ids, vec![JobId::new(1), free]);
    }

    #[test]
    fn unnamed_spec_is_refused() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let mut unnamed = JobSpec::unnamed();
        unnamed.set_executable("/bin/true");
        assert!(matches!(
            state.add_job(Arc::new(unnamed), now),
            Err(Error::UsageError(_))
        ));
        assert_eq!(state.jobs().count(), 0);
    }

    #[test]
    fn missing_platform_executable_is_refused() {
        let now = Instant::now();
        let mut state = create_state(
            TestConfigBuilder::default()
                .platform(Some("ppc".to_string()))
                .build(),
        );
        let mut job = JobSpec::new("only_x86");
        job.add_platform_exe("x86_64", "/opt/x86/bin");
        assert!(state.add_job(Arc::new(job), now).is_err());
    }

    #[test]
    fn platform_executable_is_used() {
        let now = Instant::now();
        let mut state = create_state(
            TestConfigBuilder::default()
                .platform(Some("x86_64".to_string()))
                .build(),
        );
        let mut job = spec("eclipse");
        job.add_platform_exe("x86_64", "/opt/x86/eclipse");
        add(&mut state, job, now);
        let dispatches = state.tick(now);
        let DriverCall::Submit(request) = &dispatches[0].call else {
            panic!("Expected submit");
        };
        assert_eq!(request.executable, "/opt/x86/eclipse");
        assert_eq!(request.attempt, 1);
    }

    #[test]
    fn retry_until_limit() {
        let now = Instant::now();
        let mut state = create_state(TestConfigBuilder::default().retry_limit(2).build());
        let id = add(&mut state, spec("flaky"), now);
        let mut time = now;
        for attempt in 1..=3 {
            let dispatches = state.tick(time);
            let submit = submits(&dispatches)[0];
            let error = SubmitError::Rejected(anyhow::anyhow!("queue closed"));
            state.on_outcome(outcome(submit, CallResult::Submitted(Err(error))), time);
            assert_eq!(state.get_job(id).unwrap().attempt_count(), attempt);
            // backoff has not elapsed yet
            assert!(submits(&state.tick(time)).is_empty());
            time += Duration::from_secs(1);
        }
        let job = state.get_job(id).unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.error().unwrap().contains("queue closed"));
        assert!(submits(&state.tick(time)).is_empty());
    }

    #[test]
    fn huge_retry_delay_is_saturated() {
        let now = Instant::now();
        let config = TestConfigBuilder::default()
            .retry_delay(Duration::MAX)
            .build();
        let mut state = create_state(config);
        let id = add(&mut state, spec("job"), now);
        let dispatches = state.tick(now);
        let error = SubmitError::Spawn(anyhow::anyhow!("ssh hangs"));
        state.on_outcome(outcome(&dispatches[0], CallResult::Submitted(Err(error))), now);
        assert_eq!(state.get_job(id).unwrap().state(), JobState::NotSubmitted);
        assert!(submits(&state.tick(now + Duration::from_secs(86400))).is_empty());
    }

    #[test]
    fn fatal_submit_error_is_not_retried() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let id = add(&mut state, spec("job"), now);
        let dispatches = state.tick(now);
        let error = SubmitError::Usage("no library".to_string());
        state.on_outcome(outcome(&dispatches[0], CallResult::Submitted(Err(error))), now);
        let job = state.get_job(id).unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.attempt_count(), 0);
    }

    #[test]
    fn backend_failure_is_retried() {
        let now = Instant::now();
        let mut state = create_state(TestConfigBuilder::default().retry_limit(1).build());
        let id = add(&mut state, spec("job"), now);
        let poll = start_job(&mut state, now);
        state.on_outcome(poll.polled(BackendStatus::Failed), now);
        let job = state.get_job(id).unwrap();
        assert_eq!(job.state(), JobState::NotSubmitted);
        assert_eq!(job.attempt_count(), 1);
        assert!(job.backend_handle().is_none());

        let later = now + Duration::from_secs(1);
        let dispatches = state.tick(later);
        let submit = submits(&dispatches)[0];
        let DriverCall::Submit(request) = &submit.call else {
            unreachable!()
        };
        assert_eq!(request.attempt, 2);
    }

    #[test]
    fn stale_outcome_is_ignored() {
        let now = Instant::now();
        let mut state = create_state(TestConfigBuilder::default().retry_limit(1).build());
        let id = add(&mut state, spec("job"), now);
        let poll = start_job(&mut state, now);
        state.on_outcome(poll.polled(BackendStatus::Failed), now);
        let dispatches = state.tick(now + Duration::from_secs(1));
        assert_eq!(submits(&dispatches).len(), 1);

        // Answer to a poll of the first submission arriving late
        state.on_outcome(poll.polled(BackendStatus::Done), now);
        let job = state.get_job(id).unwrap();
        assert_eq!(job.state(), JobState::NotSubmitted);
        assert_eq!(job.attempt_count(), 1);
    }

    #[test]
    fn unknown_status_threshold() {
        let now = Instant::now();
        let mut state = create_state(
            TestConfigBuilder::default()
                .max_unknown_polls(2)
                .retry_limit(0)
                .build(),
        );
        let id = add(&mut state, spec("job"), now);
        let poll = start_job(&mut state, now);
        for _ in 0..2 {
            state.on_outcome(poll.polled(BackendStatus::Unknown), now);
            assert_eq!(state.get_job(id).unwrap().state(), JobState::Running);
            assert_eq!(polls(&state.tick(now)).len(), 1);
        }
        state.on_outcome(poll.polled(BackendStatus::Unknown), now);
        assert_eq!(state.get_job(id).unwrap().state(), JobState::Failed);
    }

    #[test]
    fn known_status_resets_unknown_counter() {
        let now = Instant::now();
        let mut state = create_state(TestConfigBuilder::default().max_unknown_polls(1).build());
        let id = add(&mut state, spec("job"), now);
        let poll = start_job(&mut state, now);
        for status in [
            BackendStatus::Unknown,
            BackendStatus::Running,
            BackendStatus::Unknown,
            BackendStatus::Running,
        ] {
            state.on_outcome(poll.polled(status), now);
            state.tick(now);
        }
        assert_eq!(state.get_job(id).unwrap().attempt_count(), 0);
    }

    fn timed_spec() -> JobSpec {
        let mut job = spec("slow");
        job.set_max_running_minutes(1);
        job
    }

    #[test]
    fn timeout_kill_confirmed() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let id = add(&mut state, timed_spec(), now);
        let poll = start_job(&mut state, now);
        state.on_outcome(poll.polled(BackendStatus::Running), now);

        assert!(kills(&state.tick(now + Duration::from_secs(30))).is_empty());
        let later = now + Duration::from_secs(60);
        let dispatches = state.tick(later);
        let kill = kills(&dispatches)[0];
        state.on_outcome(outcome(kill, CallResult::Killed(true)), later);
        state.on_outcome(poll.polled(BackendStatus::Failed), later);

        let job = state.get_job(id).unwrap();
        assert_eq!(job.state(), JobState::Killed);
        assert_eq!(job.attempt_count(), 0);
    }

    #[test]
    fn timeout_with_retry_action() {
        let now = Instant::now();
        let mut state = create_state(
            TestConfigBuilder::default()
                .on_timeout(TimeoutAction::Retry)
                .build(),
        );
        let id = add(&mut state, timed_spec(), now);
        let poll = start_job(&mut state, now);
        state.on_outcome(poll.polled(BackendStatus::Running), now);
        let later = now + Duration::from_secs(60);
        state.tick(later);
        state.on_outcome(poll.polled(BackendStatus::Failed), later);

        let job = state.get_job(id).unwrap();
        assert_eq!(job.state(), JobState::NotSubmitted);
        assert_eq!(job.attempt_count(), 1);
    }

    #[test]
    fn unconfirmed_timeout_kill_fails_after_retries() {
        let now = Instant::now();
        let config = TestConfigBuilder::default()
            .retry_limit(1)
            .kill_grace_period(Duration::from_secs(10))
            .build();
        let mut state = create_state(config);
        let id = add(&mut state, timed_spec(), now);
        let mut time = now;

        for attempt in 1..=2 {
            let poll = start_job(&mut state, time);
            state.on_outcome(poll.polled(BackendStatus::Running), time);

            time += Duration::from_secs(60);
            let dispatches = state.tick(time);
            let kill = kills(&dispatches)[0];
            state.on_outcome(outcome(kill, CallResult::Killed(false)), time);

            time += Duration::from_secs(5);
            state.tick(time);
            assert!(state.get_job(id).unwrap().pending_kill().is_some());

            time += Duration::from_secs(5);
            state.tick(time);
            let job = state.get_job(id).unwrap();
            assert_eq!(job.attempt_count(), attempt);
            time += Duration::from_secs(1);
        }
        assert_eq!(state.get_job(id).unwrap().state(), JobState::Failed);
    }

    #[test]
    fn done_wins_over_pending_kill() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let id = add(&mut state, timed_spec(), now);
        let poll = start_job(&mut state, now);
        state.on_outcome(poll.polled(BackendStatus::Running), now);
        let later = now + Duration::from_secs(60);
        assert_eq!(kills(&state.tick(later)).len(), 1);
        state.on_outcome(poll.polled(BackendStatus::Done), later);
        assert_eq!(state.get_job(id).unwrap().state(), JobState::Done);
    }

    #[test]
    fn cancel_not_submitted_job() {
        let now = Instant::now();
        let mut state = create_state(TestConfigBuilder::default().max_running(1).build());
        add(&mut state, spec("a"), now);
        let waiting = add(&mut state, spec("b"), now);
        state.tick(now);
        state.cancel_job(waiting).unwrap();
        assert!(state.tick(now).is_empty());
        assert_eq!(state.get_job(waiting).unwrap().state(), JobState::Killed);
        assert!(state.cancel_job(JobId::new(100)).is_err());
    }

    #[test]
    fn cancel_running_job() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let id = add(&mut state, spec("job"), now);
        let poll = start_job(&mut state, now);
        state.cancel_job(id).unwrap();
        let dispatches = state.tick(now);
        assert_eq!(kills(&dispatches).len(), 1);
        // kill is requested only once
        assert!(kills(&state.tick(now)).is_empty());
        state.on_outcome(poll.polled(BackendStatus::Failed), now);
        let job = state.get_job(id).unwrap();
        assert_eq!(job.state(), JobState::Killed);
        assert_eq!(job.attempt_count(), 0);
    }

    #[test]
    fn cancel_grace_expiry() {
        let now = Instant::now();
        let mut state = create_state(
            TestConfigBuilder::default()
                .kill_grace_period(Duration::from_secs(10))
                .build(),
        );
        let id = add(&mut state, spec("job"), now);
        start_job(&mut state, now);
        state.cancel_all();
        state.tick(now);
        state.tick(now + Duration::from_secs(9));
        assert_eq!(state.get_job(id).unwrap().state(), JobState::Running);
        state.tick(now + Duration::from_secs(10));
        assert_eq!(state.get_job(id).unwrap().state(), JobState::Killed);
        assert!(state.is_finished());
    }

    #[test]
    fn cancel_during_submission() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        let id = add(&mut state, spec("job"), now);
        let dispatches = state.tick(now);
        state.cancel_all();
        assert!(state.tick(now).is_empty());
        assert_eq!(state.get_job(id).unwrap().state(), JobState::NotSubmitted);

        let dispatches = state.on_outcome(submitted(&dispatches[0]), now);
        assert_eq!(kills(&dispatches).len(), 1);
        assert_eq!(state.get_job(id).unwrap().state(), JobState::Submitted);
    }

    #[test]
    fn cancelled_queue_refuses_jobs() {
        let now = Instant::now();
        let mut state = create_state(QueueConfig::default());
        state.cancel_all();
        assert!(matches!(
            state.add_job(Arc::new(spec("late")), now),
            Err(Error::UsageError(_))
        ));
    }

    #[test]
    fn summary() {
        let now = Instant::now();
        let mut state = create_state(TestConfigBuilder::default().max_running(1).build());
        add(&mut state, spec("first"), now);
        add(&mut state, spec("second"), now);
        let poll = start_job(&mut state, now);
        assert_eq!(poll.job_id, JobId::new(1));

        let summary = state.summary();
        assert!(!summary.complete);
        assert_eq!(summary.jobs.len(), 2);
        assert_eq!(summary.jobs[1].name, "second");
        assert_eq!(summary.count(JobState::Running), 1);
        assert_eq!(summary.count(JobState::NotSubmitted), 1);
        assert_eq!(summary.jobs[0].backend_handle.as_deref(), Some("b1"));
        assert!(summary.jobs[0].submitted_at.is_some());
        assert!(summary.jobs[1].submitted_at.is_none());
    }
}
