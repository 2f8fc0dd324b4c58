//! Video ingestion.
//!
//! `FrameExtractor` turns one uploaded video into keyframe objects:
//! - Fetch the source video from the object store
//! - Select keyframes (see `keyframe`)
//! - Upload every retained frame as `image/jpeg` to the output bucket
//!
//! The extractor MUST NOT:
//! - Report success when any upload failed
//! - Keep a local copy of the video after returning

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::keyframe::{Frame, FrameMetrics, KeyframeSelector};
use crate::queue::StorageEvent;
use crate::storage::{ObjectStore, JPEG_CONTENT_TYPE};

/// What one extraction produced.
#[derive(Clone, Debug, Serialize)]
pub struct ExtractionReport {
    pub source_bucket: String,
    pub source_key: String,
    pub output_bucket: String,
    pub stream_id: String,
    pub frames_decoded: u64,
    /// Uploaded keyframes in decode order; `blob_ref` holds the object key.
    pub keyframes: Vec<Frame>,
    /// Change metrics for every non-first decoded frame.
    pub metrics: Vec<FrameMetrics>,
}

impl ExtractionReport {
    pub fn frames_retained(&self) -> usize {
        self.keyframes.len()
    }

    /// One storage event per uploaded keyframe, ready for dispatch.
    pub fn events(&self) -> Vec<StorageEvent> {
        self.keyframes
            .iter()
            .filter_map(|frame| frame.blob_ref.as_deref())
            .map(|key| StorageEvent::new(self.output_bucket.as_str(), key))
            .collect()
    }
}

pub struct FrameExtractor {
    objects: Arc<dyn ObjectStore>,
    selector: KeyframeSelector,
    output_bucket: String,
}

impl FrameExtractor {
    pub fn new(objects: Arc<dyn ObjectStore>, selector: KeyframeSelector, output_bucket: &str) -> Self {
        Self {
            objects,
            selector,
            output_bucket: output_bucket.to_string(),
        }
    }

    /// Fetch `bucket/key` and extract its keyframes.
    pub fn extract(&self, bucket: &str, key: &str) -> Result<ExtractionReport> {
        let video = self.objects.get(bucket, key)?;
        log::info!("ingest: fetched {}/{} ({} bytes)", bucket, key, video.len());
        self.extract_bytes(bucket, key, &video)
    }

    /// Extract keyframes from an already-fetched video.
    pub fn extract_bytes(&self, bucket: &str, key: &str, video: &[u8]) -> Result<ExtractionReport> {
        let set = self.selector.process(key, video)?;

        let mut keyframes = Vec::with_capacity(set.retained.len());
        for keyframe in set.retained {
            if let Some(object_key) = keyframe.frame.blob_ref.as_deref() {
                self.objects
                    .put(&self.output_bucket, object_key, &keyframe.jpeg, JPEG_CONTENT_TYPE)?;
                log::debug!("ingest: uploaded {}/{}", self.output_bucket, object_key);
            }
            keyframes.push(keyframe.frame);
        }

        log::info!(
            "ingest: {} -> {} keyframes of {} decoded",
            key,
            keyframes.len(),
            set.frames_decoded
        );
        Ok(ExtractionReport {
            source_bucket: bucket.to_string(),
            source_key: key.to_string(),
            output_bucket: self.output_bucket.clone(),
            stream_id: set.stream_id,
            frames_decoded: set.frames_decoded,
            keyframes,
            metrics: set.metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::keyframe::MjpegDecoder;
    use crate::storage::InMemoryObjectStore;
    use image::{Rgb, RgbImage};

    fn jpeg(value: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(16, 16, Rgb([value, value, value]));
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 95)
            .encode_image(&image)
            .unwrap();
        out
    }

    /// Accepts reads, fails every write.
    struct ReadOnlyStore(InMemoryObjectStore);

    impl ObjectStore for ReadOnlyStore {
        fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.0.get(bucket, key)
        }

        fn put(&self, _: &str, _: &str, _: &[u8], _: &str) -> Result<()> {
            Err(PipelineError::transient("bucket is read-only"))
        }
    }

    #[test]
    fn uploads_retained_frames_and_reports_events() {
        let store = Arc::new(InMemoryObjectStore::new());
        let frames = [jpeg(10), jpeg(10), jpeg(200)];
        let video = MjpegDecoder::encode_stream(frames.iter().map(Vec::as_slice));
        store.put("videos", "uploads/gate.mjpeg", &video, "video/x-motion-jpeg").unwrap();

        let extractor = FrameExtractor::new(store.clone(), KeyframeSelector::default(), "frames");
        let report = extractor.extract("videos", "uploads/gate.mjpeg").unwrap();

        assert_eq!(report.frames_decoded, 3);
        assert_eq!(report.frames_retained(), 2);
        assert_eq!(report.metrics.len(), 2);
        assert_eq!(
            store.keys("frames"),
            vec!["gate/frame_0000.jpg".to_string(), "gate/frame_0002.jpg".to_string()]
        );
        assert_eq!(
            store.content_type("frames", "gate/frame_0002.jpg").as_deref(),
            Some(JPEG_CONTENT_TYPE)
        );
        let events = report.events();
        assert_eq!(events[1], StorageEvent::new("frames", "gate/frame_0002.jpg"));
    }

    #[test]
    fn failed_upload_fails_extraction() {
        let inner = InMemoryObjectStore::new();
        let video = MjpegDecoder::encode_stream([jpeg(10).as_slice()]);
        inner.put("videos", "a.mjpeg", &video, "video/x-motion-jpeg").unwrap();
        let extractor = FrameExtractor::new(
            Arc::new(ReadOnlyStore(inner)),
            KeyframeSelector::default(),
            "frames",
        );
        let err = extractor.extract("videos", "a.mjpeg").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn garbage_video_is_unreadable() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("videos", "x.mp4", b"not a video", "video/mp4").unwrap();
        let extractor = FrameExtractor::new(store, KeyframeSelector::default(), "frames");
        let err = extractor.extract("videos", "x.mp4").unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnreadable(_)));
    }
}
