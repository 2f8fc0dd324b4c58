use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectorKind;
use crate::keyframe::{
    KeyframeSelector, RetentionPolicy, DEFAULT_ABS_DIFF_THRESHOLD, DEFAULT_JPEG_QUALITY,
    DEFAULT_SIMILARITY_THRESHOLD,
};

const DEFAULT_STORE_ROOT: &str = "framewatch-data";
const DEFAULT_OUTPUT_BUCKET: &str = "keyframes";
const DEFAULT_ANNOTATIONS_DB: &str = "annotations.db";
const DEFAULT_QUEUE_DB: &str = "queue.db";
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DETECTION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_DETECTOR_ENDPOINT: &str = "stub://clear";

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    storage: Option<StorageConfigFile>,
    queue: Option<QueueConfigFile>,
    keyframes: Option<KeyframeConfigFile>,
    consumer: Option<ConsumerConfigFile>,
    detectors: Option<Vec<DetectorConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    root: Option<PathBuf>,
    output_bucket: Option<String>,
    annotations_db: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    db_path: Option<String>,
    visibility_timeout_secs: Option<u64>,
    max_receives: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct KeyframeConfigFile {
    abs_diff_threshold: Option<f64>,
    similarity_threshold: Option<f64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct ConsumerConfigFile {
    detection_timeout_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DetectorConfigFile {
    kind: String,
    queue: Option<String>,
    endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub storage: StorageSettings,
    pub queue: QueueSettings,
    pub keyframes: KeyframeSettings,
    pub consumer: ConsumerSettings,
    pub detectors: Vec<DetectorSettings>,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Root directory of the filesystem object store.
    pub root: PathBuf,
    /// Bucket keyframes are uploaded to.
    pub output_bucket: String,
    pub annotations_db: String,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub db_path: String,
    pub visibility_timeout: Duration,
    /// 0 disables dead-lettering.
    pub max_receives: u32,
}

#[derive(Debug, Clone)]
pub struct KeyframeSettings {
    pub policy: RetentionPolicy,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub detection_timeout: Duration,
    pub poll_interval: Duration,
}

/// A detector kind subscribed to a queue, served by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub queue: String,
    /// `http(s)://` inference endpoint or `stub://…`.
    pub endpoint: String,
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAMEWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let storage = file.storage.unwrap_or_default();
        let queue = file.queue.unwrap_or_default();
        let keyframes = file.keyframes.unwrap_or_default();
        let consumer = file.consumer.unwrap_or_default();

        let detectors = match file.detectors {
            Some(entries) => entries
                .into_iter()
                .map(|entry| -> Result<DetectorSettings> {
                    let kind: DetectorKind = entry.kind.parse()?;
                    Ok(DetectorSettings {
                        kind,
                        queue: entry.queue.unwrap_or_else(|| default_queue_name(kind)),
                        endpoint: entry
                            .endpoint
                            .unwrap_or_else(|| DEFAULT_DETECTOR_ENDPOINT.to_string()),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => DetectorKind::ALL
                .iter()
                .map(|&kind| DetectorSettings {
                    kind,
                    queue: default_queue_name(kind),
                    endpoint: DEFAULT_DETECTOR_ENDPOINT.to_string(),
                })
                .collect(),
        };

        Ok(Self {
            storage: StorageSettings {
                root: storage
                    .root
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_ROOT)),
                output_bucket: storage
                    .output_bucket
                    .unwrap_or_else(|| DEFAULT_OUTPUT_BUCKET.to_string()),
                annotations_db: storage
                    .annotations_db
                    .unwrap_or_else(|| DEFAULT_ANNOTATIONS_DB.to_string()),
            },
            queue: QueueSettings {
                db_path: queue
                    .db_path
                    .unwrap_or_else(|| DEFAULT_QUEUE_DB.to_string()),
                visibility_timeout: Duration::from_secs(
                    queue
                        .visibility_timeout_secs
                        .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS),
                ),
                max_receives: queue.max_receives.unwrap_or(0),
            },
            keyframes: KeyframeSettings {
                policy: RetentionPolicy {
                    abs_diff_threshold: keyframes
                        .abs_diff_threshold
                        .unwrap_or(DEFAULT_ABS_DIFF_THRESHOLD),
                    similarity_threshold: keyframes
                        .similarity_threshold
                        .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
                },
                jpeg_quality: keyframes.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            consumer: ConsumerSettings {
                detection_timeout: Duration::from_secs(
                    consumer
                        .detection_timeout_secs
                        .unwrap_or(DEFAULT_DETECTION_TIMEOUT_SECS),
                ),
                poll_interval: Duration::from_millis(
                    consumer.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
            },
            detectors,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("FRAMEWATCH_STORE_ROOT") {
            if !root.trim().is_empty() {
                self.storage.root = PathBuf::from(root);
            }
        }
        if let Ok(path) = std::env::var("FRAMEWATCH_ANNOTATIONS_DB") {
            if !path.trim().is_empty() {
                self.storage.annotations_db = path;
            }
        }
        if let Ok(path) = std::env::var("FRAMEWATCH_QUEUE_DB") {
            if !path.trim().is_empty() {
                self.queue.db_path = path;
            }
        }
        if let Ok(bucket) = std::env::var("FRAMEWATCH_OUTPUT_BUCKET") {
            if !bucket.trim().is_empty() {
                self.storage.output_bucket = bucket.trim().to_string();
            }
        }
        if let Ok(secs) = std::env::var("FRAMEWATCH_VISIBILITY_TIMEOUT_SECS") {
            let seconds: u64 = secs.trim().parse().map_err(|_| {
                anyhow!("FRAMEWATCH_VISIBILITY_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.queue.visibility_timeout = Duration::from_secs(seconds);
        }
        if let Ok(secs) = std::env::var("FRAMEWATCH_DETECTION_TIMEOUT_SECS") {
            let seconds: u64 = secs.trim().parse().map_err(|_| {
                anyhow!("FRAMEWATCH_DETECTION_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.consumer.detection_timeout = Duration::from_secs(seconds);
        }
        if let Ok(value) = std::env::var("FRAMEWATCH_ABS_DIFF_THRESHOLD") {
            self.keyframes.policy.abs_diff_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("FRAMEWATCH_ABS_DIFF_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("FRAMEWATCH_SIMILARITY_THRESHOLD") {
            self.keyframes.policy.similarity_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("FRAMEWATCH_SIMILARITY_THRESHOLD must be a number"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let policy = &self.keyframes.policy;
        if !(0.0..=255.0).contains(&policy.abs_diff_threshold) {
            return Err(anyhow!("abs_diff_threshold must be within [0, 255]"));
        }
        if !(-1.0..=1.0).contains(&policy.similarity_threshold) {
            return Err(anyhow!("similarity_threshold must be within [-1, 1]"));
        }
        if !(1u8..=100).contains(&self.keyframes.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within [1, 100]"));
        }
        if self.queue.visibility_timeout.is_zero() {
            return Err(anyhow!("visibility timeout must be greater than zero"));
        }
        if self.consumer.detection_timeout.is_zero() {
            return Err(anyhow!("detection timeout must be greater than zero"));
        }
        if self.storage.output_bucket.is_empty() {
            return Err(anyhow!("output bucket cannot be empty"));
        }

        let mut kinds = BTreeSet::new();
        for detector in &self.detectors {
            if !kinds.insert(detector.kind) {
                return Err(anyhow!("detector '{}' configured more than once", detector.kind));
            }
            if detector.queue.trim().is_empty() {
                return Err(anyhow!("detector '{}' has an empty queue name", detector.kind));
            }
            if detector.endpoint.trim().is_empty() {
                return Err(anyhow!("detector '{}' has an empty endpoint", detector.kind));
            }
        }
        Ok(())
    }

    pub fn detector(&self, kind: DetectorKind) -> Option<&DetectorSettings> {
        self.detectors.iter().find(|detector| detector.kind == kind)
    }

    pub fn keyframe_selector(&self) -> KeyframeSelector {
        KeyframeSelector::new(self.keyframes.policy).with_jpeg_quality(self.keyframes.jpeg_quality)
    }
}

fn default_queue_name(kind: DetectorKind) -> String {
    format!("{}-detections", kind)
}

/// TOML unless the file name ends in `.json`.
fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
