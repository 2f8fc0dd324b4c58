use anyhow::{anyhow, Result};
use serde_json::json;

use crate::detect::backend::{DetectionOutcome, DetectionService};
use crate::error;

/// Stub service for testing. Returns the same verdict for every image.
pub struct StubDetectionService {
    outcome: DetectionOutcome,
}

impl StubDetectionService {
    pub fn new(outcome: DetectionOutcome) -> Self {
        Self { outcome }
    }

    /// `detected` answers with one synthetic finding, `clear` with none.
    /// `flag:true` / `flag:false` answer with a presence flag.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let outcome = match spec.trim_end_matches('/') {
            "detected" => DetectionOutcome::Findings(vec![json!({
                "label": "stub",
                "confidence": 1.0
            })]),
            "clear" => DetectionOutcome::Findings(vec![]),
            "flag:true" => DetectionOutcome::Flag(true),
            "flag:false" => DetectionOutcome::Flag(false),
            other => return Err(anyhow!("unknown stub detector '{}'", other)),
        };
        Ok(Self::new(outcome))
    }
}

impl DetectionService for StubDetectionService {
    fn name(&self) -> &str {
        "stub"
    }

    fn detect(&self, _image: &[u8]) -> error::Result<DetectionOutcome> {
        Ok(self.outcome.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_suffix_selects_verdict() {
        let detected = StubDetectionService::from_spec("detected").unwrap();
        assert!(detected.detect(b"jpeg").unwrap().is_positive());
        let clear = StubDetectionService::from_spec("clear").unwrap();
        assert!(!clear.detect(b"jpeg").unwrap().is_positive());
        assert_eq!(
            StubDetectionService::from_spec("flag:false")
                .unwrap()
                .detect(b"")
                .unwrap(),
            DetectionOutcome::Flag(false)
        );
        assert!(StubDetectionService::from_spec("maybe").is_err());
    }
}
