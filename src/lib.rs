//! Framewatch
//!
//! Keyframe sampling, detector fan-out and annotation aggregation for
//! uploaded video.
//!
//! # Pipeline
//!
//! 1. **Extract**: an uploaded video is decoded; frames that differ enough
//!    from their predecessor are kept as keyframes and uploaded as JPEG.
//! 2. **Dispatch**: every keyframe upload is announced, as a storage-event
//!    envelope, on one queue per configured detector.
//! 3. **Consume**: each detector's consumer fetches the keyframe, calls its
//!    detection service and merges the normalized verdict into the stream's
//!    annotation record. A job is acknowledged only after the merge.
//! 4. **Aggregate**: merges are atomic and field-scoped, so detectors never
//!    overwrite each other and redelivered jobs are harmless.
//!
//! # Module Structure
//!
//! - `metric`: change metrics between two frames
//! - `keyframe`: decoding and keyframe selection
//! - `identity`: object key → `(stream, frame)`
//! - `ingest`: fetch, select and upload for one video
//! - `dispatch`: fan-out to detector queues
//! - `queue`: job queues and the storage-event envelope
//! - `detect`: detector kinds and detection services
//! - `consumer`: the per-detector job consumer
//! - `aggregate`: annotation records and their stores
//! - `storage`: object stores
//! - `config`: pipeline configuration

pub mod aggregate;
pub mod config;
pub mod consumer;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod keyframe;
pub mod metric;
pub mod queue;
pub mod storage;

pub use aggregate::{
    AnnotationAggregator, AnnotationRecord, AnnotationStore, CasAnnotationStore,
    InMemoryAnnotationStore, SqliteAnnotationStore,
};
pub use config::PipelineConfig;
pub use consumer::{ConsumeOutcome, ConsumerStats, JobConsumer, JobState};
pub use detect::{
    DetectionOutcome, DetectionService, DetectorKind, DetectorRegistry, HttpDetectionService,
    StubDetectionService,
};
pub use dispatch::{DetectorSubscription, DispatchReport, Dispatcher};
pub use error::{PipelineError, Result};
pub use identity::{resolve, FrameIdentity, Resolution};
pub use ingest::{ExtractionReport, FrameExtractor};
pub use keyframe::{Frame, FrameMetrics, Keyframe, KeyframeSelector, KeyframeSet, RetentionPolicy};
pub use metric::ChangeMetrics;
pub use queue::{Delivery, InMemoryJobQueue, JobQueue, SqliteJobQueue, StorageEvent};
pub use storage::{
    ConditionalPut, FilesystemObjectStore, InMemoryObjectStore, ObjectStore, VersionedBlobStore,
};
