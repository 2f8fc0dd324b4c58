//! Keyframe selection.
//!
//! A video is decoded front to back. Every decoded frame is compared with the
//! frame decoded immediately before it (not with the last retained one), and
//! kept when the change crosses the retention policy. The first decoded frame
//! is always kept. Because the baseline moves with every frame, a slow drift
//! can pass without any single frame being retained; retained frames are not
//! evenly spaced.
//!
//! Decoders:
//! - motion-JPEG (concatenated JPEG images), always available
//! - FFmpeg container decoding (feature: ingest-file-ffmpeg)

mod decoder;
#[cfg(feature = "ingest-file-ffmpeg")]
mod ffmpeg;
mod mjpeg;

use std::io::Write;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::identity;
use crate::metric::{self, ChangeMetrics};

pub use decoder::{open_decoder, DecodedFrames};
pub use mjpeg::MjpegDecoder;

pub const DEFAULT_ABS_DIFF_THRESHOLD: f64 = 50.0;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.95;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Decides whether a frame differs enough from its predecessor to be kept.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Retain when `absolute_difference >= abs_diff_threshold`.
    pub abs_diff_threshold: f64,
    /// Retain when `similarity <= similarity_threshold`.
    pub similarity_threshold: f64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            abs_diff_threshold: DEFAULT_ABS_DIFF_THRESHOLD,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl RetentionPolicy {
    pub fn should_retain(&self, metrics: &ChangeMetrics) -> bool {
        metrics.absolute_difference >= self.abs_diff_threshold
            || metrics.similarity <= self.similarity_threshold
    }
}

/// One decoded frame that was kept.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: String,
    pub stream_id: String,
    /// 0-based decode order.
    pub sequence_number: u64,
    /// Object key the frame is uploaded under.
    pub blob_ref: Option<String>,
    /// Change relative to the previous decoded frame; `None` for frame 0.
    pub change_metrics: Option<ChangeMetrics>,
}

#[derive(Clone, Debug)]
pub struct Keyframe {
    pub frame: Frame,
    pub jpeg: Vec<u8>,
}

/// Metrics for one non-first decoded frame, retained or not.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub frame_index: u64,
    #[serde(flatten)]
    pub metrics: ChangeMetrics,
    pub retained: bool,
}

#[derive(Clone, Debug)]
pub struct KeyframeSet {
    pub stream_id: String,
    pub frames_decoded: u64,
    pub retained: Vec<Keyframe>,
    pub metrics: Vec<FrameMetrics>,
}

impl KeyframeSet {
    pub fn retained_indices(&self) -> Vec<u64> {
        self.retained
            .iter()
            .map(|kf| kf.frame.sequence_number)
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct KeyframeSelector {
    policy: RetentionPolicy,
    jpeg_quality: u8,
    scratch_dir: Option<PathBuf>,
}

impl Default for KeyframeSelector {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl KeyframeSelector {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            scratch_dir: None,
        }
    }

    /// Directory for the scratch copy of the source video (system temp dir
    /// by default).
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Decode `video` and select its keyframes.
    ///
    /// `video_name` is the uploaded object's key; its base name (directory
    /// and extension stripped) names the stream and prefixes every keyframe
    /// key. The scratch copy of the video is deleted before returning.
    pub fn process(&self, video_name: &str, video: &[u8]) -> Result<KeyframeSet> {
        let mut scratch = match &self.scratch_dir {
            Some(dir) => tempfile::Builder::new()
                .prefix("framewatch-")
                .suffix(&scratch_suffix(video_name))
                .tempfile_in(dir)?,
            None => tempfile::Builder::new()
                .prefix("framewatch-")
                .suffix(&scratch_suffix(video_name))
                .tempfile()?,
        };
        scratch.write_all(video)?;
        scratch.flush()?;

        let selected = open_decoder(scratch.path())
            .and_then(|frames| self.select(video_name, frames));

        // Remove the scratch copy whether or not decoding succeeded.
        let cleanup = scratch.close();
        let set = selected?;
        cleanup?;
        Ok(set)
    }

    /// Run selection over an already-decoded frame sequence.
    pub fn select<I>(&self, video_name: &str, frames: I) -> Result<KeyframeSet>
    where
        I: IntoIterator<Item = RgbImage>,
    {
        let base_name = video_base_name(video_name);
        let mut retained = Vec::new();
        let mut metrics = Vec::new();
        let mut previous: Option<RgbImage> = None;
        let mut sequence: u64 = 0;

        for frame in frames {
            let change = previous.as_ref().map(|prev| metric::compare(prev, &frame));
            let keep = match change {
                None => true,
                Some(change) => {
                    let keep = self.policy.should_retain(&change);
                    metrics.push(FrameMetrics {
                        frame_index: sequence,
                        metrics: change,
                        retained: keep,
                    });
                    keep
                }
            };

            if keep {
                retained.push(self.keyframe(&base_name, sequence, &frame, change)?);
            } else {
                log::debug!("{}: frame {} below retention threshold", base_name, sequence);
            }
            previous = Some(frame);
            sequence += 1;
        }

        if sequence == 0 {
            return Err(PipelineError::unreadable(format!(
                "no decodable frames in {}",
                video_name
            )));
        }

        let stream_id = retained
            .first()
            .map(|kf| kf.frame.stream_id.clone())
            .unwrap_or_else(|| base_name.clone());

        log::info!(
            "{}: decoded {} frames, retained {}",
            base_name,
            sequence,
            retained.len()
        );

        Ok(KeyframeSet {
            stream_id,
            frames_decoded: sequence,
            retained,
            metrics,
        })
    }

    fn keyframe(
        &self,
        base_name: &str,
        sequence: u64,
        frame: &RgbImage,
        change: Option<ChangeMetrics>,
    ) -> Result<Keyframe> {
        let key = keyframe_key(base_name, sequence);
        let identity = identity::resolve(&key);
        let jpeg = encode_jpeg(frame, self.jpeg_quality)?;
        Ok(Keyframe {
            frame: Frame {
                frame_id: identity.frame_id,
                stream_id: identity.stream_id,
                sequence_number: sequence,
                blob_ref: Some(key),
                change_metrics: change,
            },
            jpeg,
        })
    }
}

/// `<videoBaseName>/frame_<seq:04d>.jpg`
pub fn keyframe_key(video_base_name: &str, sequence: u64) -> String {
    format!("{}/frame_{:04}.jpg", video_base_name, sequence)
}

/// File name of `video_name` without directories or the final extension.
pub fn video_base_name(video_name: &str) -> String {
    let file_name = video_name.rsplit('/').next().unwrap_or(video_name);
    identity::strip_extension(file_name).to_string()
}

fn scratch_suffix(video_name: &str) -> String {
    Path::new(video_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(frame)
        .map_err(|e| PipelineError::unreadable(format!("jpeg encode: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(value: u8) -> RgbImage {
        RgbImage::from_pixel(8, 8, Rgb([value, value, value]))
    }

    fn textured(offset: u8) -> RgbImage {
        RgbImage::from_fn(8, 8, |x, y| {
            let v = (x * 10 + y * 5) as u8 + offset;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn first_frame_is_always_retained() {
        let set = KeyframeSelector::default()
            .select("uploads/cam.mp4", vec![solid(0)])
            .unwrap();
        assert_eq!(set.retained_indices(), vec![0]);
        assert!(set.metrics.is_empty());
        assert_eq!(set.retained[0].frame.change_metrics, None);
    }

    #[test]
    fn baseline_is_previous_decoded_frame() {
        // Each step brightens the same texture by 30 levels: below the 50
        // threshold even though frame 3 is 90 levels away from frame 0.
        let frames = vec![textured(0), textured(30), textured(60), textured(90)];
        let set = KeyframeSelector::default().select("drift.mp4", frames).unwrap();
        assert_eq!(set.retained_indices(), vec![0]);
        assert_eq!(set.metrics.len(), 3);
        assert!(set
            .metrics
            .iter()
            .all(|m| m.metrics.absolute_difference == 30.0 && !m.retained));
    }

    #[test]
    fn keyframes_are_keyed_under_the_video_base_name() {
        let set = KeyframeSelector::default()
            .select("incoming/2024/lobby.cam.mp4", vec![solid(0), solid(200)])
            .unwrap();
        let keys: Vec<_> = set
            .retained
            .iter()
            .map(|kf| kf.frame.blob_ref.clone().unwrap())
            .collect();
        assert_eq!(keys, vec!["lobby.cam/frame_0000.jpg", "lobby.cam/frame_0001.jpg"]);
        assert_eq!(set.stream_id, "lobby.cam");
        assert_eq!(set.retained[1].frame.frame_id, "frame_0001");
    }

    #[test]
    fn dot_file_video_keeps_its_name() {
        assert_eq!(video_base_name("uploads/.mjpeg"), ".mjpeg");
        let set = KeyframeSelector::default()
            .select("uploads/.mjpeg", vec![solid(0)])
            .unwrap();
        assert_eq!(set.stream_id, ".mjpeg");
        assert_eq!(
            set.retained[0].frame.blob_ref.as_deref(),
            Some(".mjpeg/frame_0000.jpg")
        );
    }

    #[test]
    fn empty_sequence_is_unreadable() {
        let err = KeyframeSelector::default()
            .select("empty.mp4", Vec::<RgbImage>::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnreadable(_)));
    }

    #[test]
    fn policy_thresholds_are_inclusive() {
        let policy = RetentionPolicy::default();
        assert!(policy.should_retain(&ChangeMetrics {
            absolute_difference: 50.0,
            similarity: 1.0
        }));
        assert!(policy.should_retain(&ChangeMetrics {
            absolute_difference: 0.0,
            similarity: 0.95
        }));
        assert!(!policy.should_retain(&ChangeMetrics {
            absolute_difference: 49.9,
            similarity: 0.951
        }));
    }
}
