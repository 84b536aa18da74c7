use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::common::rpc::{ResponseToken, RpcReceiver};
use crate::common::utils::time::saturating_add;
use crate::queue::pool::WorkerPool;
use crate::queue::service::{CancelTarget, QueueMessage};
use crate::queue::state::{JobState, QueueState, QueueSummary};

const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Scheduling loop of a queue.
///
/// Ends after a stop request (or after every [`crate::queue::service::QueueService`] handle has
/// been dropped) once all jobs are terminal, or at the latest `kill_grace_period + call_timeout`
/// after the request, when the remaining jobs are declared killed.
pub async fn queue_process(mut state: QueueState, mut receiver: RpcReceiver<QueueMessage>) {
    let config = state.config().clone();
    let (pool, mut outcomes) = WorkerPool::new(config.max_concurrent_calls, config.call_timeout);

    let mut tick_interval =
        tokio::time::interval(config.tick_interval.max(MIN_TICK_INTERVAL));
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut waiters: Vec<ResponseToken<QueueSummary>> = Vec::new();
    let mut shutdown_deadline: Option<Instant> = None;
    let mut receiver_open = true;

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                for dispatch in state.tick(Instant::now()) {
                    pool.dispatch(dispatch);
                }
            }
            Some(outcome) = outcomes.recv() => {
                for dispatch in state.on_outcome(outcome, Instant::now()) {
                    pool.dispatch(dispatch);
                }
            }
            message = receiver.recv(), if receiver_open => {
                let stop = match message {
                    Some(QueueMessage::Stop) => {
                        log::debug!("Queue stop requested");
                        true
                    }
                    Some(message) => {
                        handle_message(&mut state, &mut waiters, message);
                        false
                    }
                    None => {
                        log::debug!("Queue service was dropped, stopping the queue");
                        receiver_open = false;
                        true
                    }
                };
                if stop && shutdown_deadline.is_none() {
                    state.cancel_all();
                    let grace = config.kill_grace_period.saturating_add(config.call_timeout);
                    shutdown_deadline = Some(saturating_add(Instant::now(), grace));
                }
            }
        }

        waiters.retain(|waiter| !waiter.is_closed());
        if state.is_finished() && !waiters.is_empty() {
            let summary = state.summary();
            for waiter in waiters.drain(..) {
                waiter.respond(summary.clone());
            }
        }

        if let Some(deadline) = shutdown_deadline {
            if state.is_finished() {
                break;
            }
            if Instant::now() >= deadline {
                state.force_kill_remaining();
                break;
            }
        }
    }

    let summary = state.summary();
    log::info!(
        "Queue finished: {} done, {} failed, {} killed",
        summary.count(JobState::Done),
        summary.count(JobState::Failed),
        summary.count(JobState::Killed)
    );
    for waiter in waiters {
        waiter.respond(summary.clone());
    }
}

fn handle_message(
    state: &mut QueueState,
    waiters: &mut Vec<ResponseToken<QueueSummary>>,
    message: QueueMessage,
) {
    log::trace!("Handling message {message:?}");
    match message {
        QueueMessage::Enqueue { spec, response } => {
            response.respond(state.add_job(spec, Instant::now()));
        }
        QueueMessage::Cancel { target, response } => {
            let result = match target {
                CancelTarget::Job(id) => state.cancel_job(id),
                CancelTarget::All => {
                    state.cancel_all();
                    Ok(())
                }
            };
            response.respond(result);
        }
        QueueMessage::QueryState(id, response) => {
            response.respond(state.get_job(id).map(|job| job.state()));
        }
        QueueMessage::Summary(response) => response.respond(state.summary()),
        QueueMessage::WaitUntilDone(response) => {
            if state.is_finished() {
                response.respond(state.summary());
            } else {
                waiters.push(response);
            }
        }
        QueueMessage::Stop => {}
    }
}
