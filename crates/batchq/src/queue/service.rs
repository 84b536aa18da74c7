use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::common::error::{BatchQueueError, usage_error};
use crate::common::rpc::{ResponseToken, RpcSender, initiate_request, make_rpc_queue};
use crate::driver::Driver;
use crate::jobspec::JobSpec;
use crate::jobspec::catalog::JobCatalog;
use crate::queue::config::QueueConfig;
use crate::queue::process::queue_process;
use crate::queue::state::{JobState, QueueState, QueueSummary};
use crate::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    Job(JobId),
    All,
}

#[derive(Debug)]
pub enum QueueMessage {
    Enqueue {
        spec: Arc<JobSpec>,
        response: ResponseToken<crate::Result<JobId>>,
    },
    Cancel {
        target: CancelTarget,
        response: ResponseToken<crate::Result<()>>,
    },
    QueryState(JobId, ResponseToken<Option<JobState>>),
    Summary(ResponseToken<QueueSummary>),
    /// Answered once every job is terminal.
    WaitUntilDone(ResponseToken<QueueSummary>),
    Stop,
}

/// Handle of a running queue.
pub struct QueueService {
    sender: RpcSender<QueueMessage>,
    catalog: JobCatalog,
}

impl QueueService {
    pub fn catalog(&self) -> &JobCatalog {
        &self.catalog
    }

    pub fn enqueue(&self, spec: JobSpec) -> impl Future<Output = crate::Result<JobId>> + use<> {
        self.enqueue_shared(Arc::new(spec))
    }

    /// Enqueues a spec found in the catalog.
    pub fn enqueue_named(&self, name: &str) -> impl Future<Output = crate::Result<JobId>> + use<> {
        let fut = self
            .catalog
            .lookup(name)
            .map(|spec| self.enqueue_shared(spec));
        let name = name.to_string();
        async move {
            match fut {
                Some(fut) => fut.await,
                None => usage_error(format!("Job {name} not found in catalog")),
            }
        }
    }

    fn enqueue_shared(
        &self,
        spec: Arc<JobSpec>,
    ) -> impl Future<Output = crate::Result<JobId>> + use<> {
        let fut = initiate_request(|token| {
            self.sender.send(QueueMessage::Enqueue {
                spec,
                response: token,
            })
        });
        async move { fut.await.map_err(|_| BatchQueueError::ServiceStopped)? }
    }

    pub fn cancel(&self, target: CancelTarget) -> impl Future<Output = crate::Result<()>> + use<> {
        let fut = initiate_request(|token| {
            self.sender.send(QueueMessage::Cancel {
                target,
                response: token,
            })
        });
        async move { fut.await.map_err(|_| BatchQueueError::ServiceStopped)? }
    }

    pub fn query_state(
        &self,
        id: JobId,
    ) -> impl Future<Output = crate::Result<Option<JobState>>> + use<> {
        let fut = initiate_request(|token| self.sender.send(QueueMessage::QueryState(id, token)));
        async move { fut.await.map_err(|_| BatchQueueError::ServiceStopped) }
    }

    pub fn summary(&self) -> impl Future<Output = crate::Result<QueueSummary>> + use<> {
        let fut = initiate_request(|token| self.sender.send(QueueMessage::Summary(token)));
        async move { fut.await.map_err(|_| BatchQueueError::ServiceStopped) }
    }

    /// Waits until every job is terminal. After `timeout` elapses, the current (incomplete)
    /// summary is returned instead.
    pub async fn wait_until_done(&self, timeout: Option<Duration>) -> crate::Result<QueueSummary> {
        let fut = initiate_request(|token| self.sender.send(QueueMessage::WaitUntilDone(token)));
        let Some(timeout) = timeout else {
            return fut.await.map_err(|_| BatchQueueError::ServiceStopped);
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(summary) => summary.map_err(|_| BatchQueueError::ServiceStopped),
            Err(_) => {
                log::debug!("Queue did not finish in {timeout:?}");
                self.summary().await
            }
        }
    }

    /// Cancels all jobs and ends the queue loop once they are terminal or the kill grace
    /// period has passed.
    pub fn stop(&self) {
        if self.sender.send(QueueMessage::Stop).is_err() {
            log::debug!("Queue has already stopped");
        }
    }
}

pub fn create_queue_service(
    config: QueueConfig,
    driver: Arc<dyn Driver>,
    catalog: JobCatalog,
) -> (QueueService, impl Future<Output = ()>) {
    let (tx, rx) = make_rpc_queue();
    let state = QueueState::new(config, driver);
    let process = queue_process(state, rx);
    let service = QueueService {
        sender: tx,
        catalog,
    };
    (service, process)
}
