use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// What a detection service reports for one image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetectionOutcome {
    /// Presence/absence verdict.
    Flag(bool),
    /// Detector-specific findings. Their content is never interpreted here,
    /// only whether the list is empty.
    Findings(Vec<Value>),
}

impl DetectionOutcome {
    pub fn is_positive(&self) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::Findings(findings) => !findings.is_empty(),
        }
    }
}

/// Detection service for one detector kind.
///
/// Implementations receive the raw encoded image bytes and must be callable
/// from several consumer threads at once. Errors are reported as
/// `PipelineError::DetectionService`, with `permanent` set only when the
/// provider rejected the input itself.
pub trait DetectionService: Send + Sync {
    /// Service identifier (for logs).
    fn name(&self) -> &str;

    /// Run detection on one encoded image.
    fn detect(&self, image: &[u8]) -> Result<DetectionOutcome>;
}
