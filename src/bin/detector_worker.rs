//! detector_worker - job consumer for one detector kind
//!
//! This daemon:
//! 1. Polls the detector's queue
//! 2. Runs each keyframe through the detector's service
//! 3. Merges the verdict into the stream's annotation record
//! 4. Stops cleanly on Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use framewatch::{
    AnnotationAggregator, DetectorKind, DetectorRegistry, FilesystemObjectStore, JobConsumer,
    PipelineConfig, SqliteAnnotationStore, SqliteJobQueue,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Detector kind: person, fall, fire or vehicle.
    #[arg(long, env = "FRAMEWATCH_DETECTOR")]
    kind: String,
    /// Override the configured detection endpoint.
    #[arg(long)]
    endpoint: Option<String>,
    /// Exit once the queue has nothing visible instead of polling.
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = PipelineConfig::load()?;

    let kind: DetectorKind = args.kind.parse()?;
    let mut settings = config
        .detector(kind)
        .cloned()
        .ok_or_else(|| anyhow!("detector '{}' is not configured", kind))?;
    if let Some(endpoint) = args.endpoint {
        settings.endpoint = endpoint;
    }

    let registry = DetectorRegistry::from_settings(
        std::slice::from_ref(&settings),
        config.consumer.detection_timeout,
    )?;
    let detector = registry.require(kind)?;
    let queue = SqliteJobQueue::open(
        &config.queue.db_path,
        &settings.queue,
        config.queue.visibility_timeout,
    )
    .with_context(|| format!("open queue {}", settings.queue))?
    .with_max_receives(config.queue.max_receives);
    let objects = FilesystemObjectStore::new(&config.storage.root)
        .with_context(|| format!("open object store {}", config.storage.root.display()))?;
    let annotations = SqliteAnnotationStore::open(&config.storage.annotations_db)
        .with_context(|| format!("open annotations {}", config.storage.annotations_db))?;

    let consumer = JobConsumer::new(
        kind,
        Arc::new(queue),
        Arc::new(objects),
        detector,
        AnnotationAggregator::new(Arc::new(annotations)),
    )
    .with_poll_interval(config.consumer.poll_interval);

    log::info!("detector_worker: {} via {}", kind, settings.endpoint);

    let stats = if args.once {
        consumer.run_until_idle()?
    } else {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .context("error setting Ctrl-C handler")?;
        consumer.run(&shutdown)
    };

    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}
