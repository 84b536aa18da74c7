use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use batchq::common::setup::setup_logging;
use batchq::common::utils::time::parse_human_time;
use batchq::driver::{Driver, DriverKind, configure_driver, create_driver};
use batchq::jobspec::catalog::{JobCatalog, JobPool};
use batchq::jobspec::record::load_spec;
use batchq::output::{Outputs, print_summary};
use batchq::queue::config::ConfigFile;
use batchq::queue::{QueueSummary, create_queue_service};

/// Runs batch jobs through a local or LSF backend and waits for them.
#[derive(Parser)]
#[command(author, about, version = batchq::BATCHQ_VERSION)]
struct Opts {
    /// Enables debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file with `[queue]` and `[driver]` tables
    #[arg(long, value_hint = clap::ValueHint::FilePath, env = "BATCHQ_CONFIG")]
    config: Option<PathBuf>,

    /// Driver used to run the jobs. Overrides the kind from the configuration file.
    #[arg(long, value_enum)]
    driver: Option<DriverKind>,

    /// Driver option in the form `NAME=VALUE`. Can be used multiple times.
    #[arg(short = 'o', long = "option", value_parser = parse_driver_option)]
    options: Vec<(String, String)>,

    /// Directory whose job records can be referenced by name
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    job_dir: Vec<PathBuf>,

    /// Platform used to select platform specific executables
    #[arg(long)]
    platform: Option<String>,

    /// Jobs that did not finish within this duration (e.g. `30m`) are cancelled
    #[arg(long, value_parser = parse_human_time)]
    timeout: Option<Duration>,

    #[arg(long, value_enum, default_value_t)]
    output: Outputs,

    /// Path to a job record or a name of a job from one of the job directories
    #[arg(required = true)]
    jobs: Vec<String>,
}

fn parse_driver_option(text: &str) -> anyhow::Result<(String, String)> {
    match text.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(anyhow::anyhow!(
            "Invalid driver option `{text}`, expected NAME=VALUE"
        )),
    }
}

fn create_configured_driver(
    opts: &Opts,
    file: &ConfigFile,
) -> batchq::Result<Arc<dyn Driver>> {
    let kind = opts
        .driver
        .or(file.driver.as_ref().map(|driver| driver.kind))
        .unwrap_or(DriverKind::Local);
    let mut driver = create_driver(kind);

    if let Some(config) = &file.driver {
        if config.kind == kind {
            configure_driver(
                driver.as_mut(),
                config
                    .options
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            )?;
        } else {
            log::warn!(
                "Ignoring options of the {:?} driver from the configuration file",
                config.kind
            );
        }
    }
    configure_driver(
        driver.as_mut(),
        opts.options
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str())),
    )?;
    log::debug!(
        "Using {} driver with submission method {}",
        driver.name(),
        driver.submission_method()
    );
    Ok(Arc::from(driver))
}

async fn run(opts: Opts) -> batchq::Result<QueueSummary> {
    let file = match &opts.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    let mut config = file.queue.clone().with_env_overrides();
    if opts.platform.is_some() {
        config.platform = opts.platform.clone();
    }
    config.validate()?;
    let driver = create_configured_driver(&opts, &file)?;

    let mut pool = JobPool::default();
    for directory in &opts.job_dir {
        let count = pool.load_dir(directory, false)?;
        log::debug!("Loaded {count} job(s) from {}", directory.display());
    }
    let catalog = JobCatalog::new(Arc::new(pool));

    let (service, process) = create_queue_service(config, driver, catalog);
    let process = tokio::spawn(process);

    for job in &opts.jobs {
        let path = Path::new(job);
        let id = if path.is_file() {
            service.enqueue(load_spec(path, None, Some(true))?).await?
        } else {
            service.enqueue_named(job).await?
        };
        log::debug!("Job {job} enqueued with id {id}");
    }

    let summary = tokio::select! {
        summary = service.wait_until_done(opts.timeout) => summary?,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted");
            service.summary().await?
        }
    };
    let summary = if summary.complete {
        summary
    } else {
        log::warn!("Cancelling unfinished jobs");
        service.stop();
        service.wait_until_done(None).await?
    };

    service.stop();
    drop(service);
    if let Err(error) = process.await {
        log::error!("Queue loop ended abnormally: {error}");
    }
    Ok(summary)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> batchq::Result<()> {
    let opts = Opts::parse();
    setup_logging(opts.verbose);
    let output = opts.output;

    match run(opts).await {
        Ok(summary) => {
            print_summary(&summary, output)?;
            if !summary.all_done() {
                std::process::exit(1);
            }
        }
        Err(error) => {
            log::error!("{error}");
            std::process::exit(1);
        }
    }
    Ok(())
}
