use std::time::Duration;

use derive_builder::Builder;

use crate::jobspec::JobSpec;
use crate::queue::backoff::RetryBackoff;
use crate::queue::config::{QueueConfig, TimeoutAction};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Named spec running `/bin/true`.
pub fn spec(name: &str) -> JobSpec {
    let mut spec = JobSpec::new(name);
    spec.set_executable("/bin/true");
    spec
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct TestConfig {
    #[builder(default = "Duration::from_secs(1)")]
    tick_interval: Duration,
    #[builder(default = "Duration::from_secs(60)")]
    call_timeout: Duration,
    #[builder(default = "Duration::from_secs(30)")]
    kill_grace_period: Duration,
    #[builder(default = "8")]
    max_concurrent_calls: usize,
    #[builder(default = "2")]
    retry_limit: u32,
    #[builder(default = "5")]
    max_unknown_polls: u32,
    #[builder(default)]
    max_running: u32,
    #[builder(default = "Duration::from_secs(1)")]
    retry_delay: Duration,
    #[builder(default)]
    on_timeout: TimeoutAction,
    #[builder(default)]
    platform: Option<String>,
}

impl TestConfigBuilder {
    pub fn build(self) -> QueueConfig {
        let TestConfig {
            tick_interval,
            call_timeout,
            kill_grace_period,
            max_concurrent_calls,
            retry_limit,
            max_unknown_polls,
            max_running,
            retry_delay,
            on_timeout,
            platform,
        } = self.finish().unwrap();
        QueueConfig {
            tick_interval,
            call_timeout,
            kill_grace_period,
            max_concurrent_calls,
            retry_limit,
            max_unknown_polls,
            max_running,
            backoff: RetryBackoff::Fixed { delay: retry_delay },
            on_timeout,
            platform,
        }
    }
}
