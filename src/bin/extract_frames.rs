//! extract_frames - keyframe extraction for one uploaded video
//!
//! This tool:
//! 1. Uploads a local video into the object store (or uses one already there)
//! 2. Selects keyframes and uploads them to the output bucket
//! 3. Announces every keyframe on each configured detector queue
//! 4. Prints the extraction report as JSON

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use framewatch::{
    DetectorSubscription, Dispatcher, FilesystemObjectStore, FrameExtractor, JobQueue,
    ObjectStore, PipelineConfig, SqliteJobQueue,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Local video file to upload before extraction.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Bucket holding the source video.
    #[arg(long, default_value = "uploads")]
    bucket: String,
    /// Object key of the source video (defaults to the input file name).
    #[arg(long)]
    key: Option<String>,
    /// Select and upload keyframes without notifying detector queues.
    #[arg(long)]
    no_dispatch: bool,
    /// Write the report here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = PipelineConfig::load()?;

    let objects = Arc::new(
        FilesystemObjectStore::new(&config.storage.root)
            .with_context(|| format!("open object store {}", config.storage.root.display()))?,
    );

    let key = match (&args.key, &args.input) {
        (Some(key), _) => key.clone(),
        (None, Some(path)) => path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("input path {} has no file name", path.display()))?,
        (None, None) => return Err(anyhow!("either --input or --key is required")),
    };

    if let Some(path) = &args.input {
        let video =
            std::fs::read(path).with_context(|| format!("read video {}", path.display()))?;
        objects
            .put(&args.bucket, &key, &video, "application/octet-stream")
            .with_context(|| format!("upload {} to {}/{}", path.display(), args.bucket, key))?;
    }

    let extractor = FrameExtractor::new(
        objects.clone(),
        config.keyframe_selector(),
        &config.storage.output_bucket,
    );
    let report = extractor
        .extract(&args.bucket, &key)
        .with_context(|| format!("extract keyframes from {}/{}", args.bucket, key))?;

    if !args.no_dispatch {
        let mut subscriptions = Vec::with_capacity(config.detectors.len());
        for detector in &config.detectors {
            let queue: Arc<dyn JobQueue> = Arc::new(
                SqliteJobQueue::open(
                    &config.queue.db_path,
                    &detector.queue,
                    config.queue.visibility_timeout,
                )
                .with_context(|| format!("open queue {}", detector.queue))?,
            );
            subscriptions.push(DetectorSubscription {
                kind: detector.kind,
                queue,
            });
        }
        let dispatch = Dispatcher::new(subscriptions).dispatch(&report.events());
        if !dispatch.is_complete() {
            for failure in &dispatch.failures {
                log::error!(
                    "{} notification for {} on {} failed: {}",
                    failure.kind,
                    failure.key,
                    failure.queue,
                    failure.error
                );
            }
            return Err(anyhow!(
                "{} of {} notifications failed",
                dispatch.failures.len(),
                dispatch.failures.len() + dispatch.sent
            ));
        }
    }

    let json = serde_json::to_string_pretty(&report)?;
    match &args.out {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
            log::info!("report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
