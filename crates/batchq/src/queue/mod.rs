pub mod backoff;
pub mod config;
pub mod pool;
pub mod process;
pub mod service;
pub mod state;

pub use config::{QueueConfig, TimeoutAction};
pub use service::{CancelTarget, QueueService, create_queue_service};
pub use state::{JobState, JobSummary, QueueSummary};
