use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::common::error::SubmitError;
use crate::driver::{BackendStatus, Driver};
use crate::queue::state::{CallOutcome, CallResult, Dispatch, DriverCall};

/// Runs driver calls as tokio tasks.
///
/// At most `max_concurrent_calls` calls run at the same time, each one is bounded by
/// `call_timeout`. Results are sent back through the channel returned by [`WorkerPool::new`].
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    call_timeout: Duration,
    sender: UnboundedSender<CallOutcome>,
}

impl WorkerPool {
    pub fn new(
        max_concurrent_calls: usize,
        call_timeout: Duration,
    ) -> (Self, UnboundedReceiver<CallOutcome>) {
        let (sender, receiver) = unbounded_channel();
        let pool = Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            call_timeout,
            sender,
        };
        (pool, receiver)
    }

    pub fn dispatch(&self, dispatch: Dispatch) {
        let semaphore = self.semaphore.clone();
        let sender = self.sender.clone();
        let call_timeout = self.call_timeout;
        let Dispatch {
            job_id,
            generation,
            driver,
            call,
        } = dispatch;

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let result = run_call(driver.as_ref(), &call, call_timeout).await;
            if sender
                .send(CallOutcome {
                    job_id,
                    generation,
                    result,
                })
                .is_err()
            {
                log::debug!("Result of a driver call for job {job_id} was dropped, queue has ended");
            }
        });
    }
}

async fn run_call(driver: &dyn Driver, call: &DriverCall, call_timeout: Duration) -> CallResult {
    match call {
        DriverCall::Submit(request) => {
            match tokio::time::timeout(call_timeout, driver.submit(request)).await {
                Ok(result) => CallResult::Submitted(result),
                Err(_) => {
                    log::warn!(
                        "Submission of job {} did not finish in {call_timeout:?}",
                        request.job_id
                    );
                    CallResult::Submitted(Err(SubmitError::Timeout(call_timeout)))
                }
            }
        }
        DriverCall::Poll(handle) => {
            match tokio::time::timeout(call_timeout, driver.poll(handle)).await {
                Ok(status) => CallResult::Polled(status),
                Err(_) => {
                    log::warn!("Status query of {handle} did not finish in {call_timeout:?}");
                    CallResult::Polled(BackendStatus::Unknown)
                }
            }
        }
        DriverCall::Kill(handle) => {
            match tokio::time::timeout(call_timeout, driver.kill(handle)).await {
                Ok(accepted) => CallResult::Killed(accepted),
                Err(_) => {
                    log::warn!("Kill of {handle} did not finish in {call_timeout:?}");
                    CallResult::Killed(false)
                }
            }
        }
    }
}
