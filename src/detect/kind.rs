use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backend::DetectionOutcome;

/// The closed set of detectors a keyframe is fanned out to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Person,
    Fall,
    Fire,
    Vehicle,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 4] = [
        DetectorKind::Person,
        DetectorKind::Fall,
        DetectorKind::Fire,
        DetectorKind::Vehicle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Fall => "fall",
            Self::Fire => "fire",
            Self::Vehicle => "vehicle",
        }
    }

    /// Annotation-record field this detector writes under.
    pub fn status_field(&self) -> &'static str {
        match self {
            Self::Person => "human_status",
            Self::Fall => "fall_status",
            Self::Fire => "fire_status",
            Self::Vehicle => "vehicle_status",
        }
    }

    pub fn detected_label(&self) -> &'static str {
        match self {
            Self::Person => "Human detected",
            Self::Fall => "fall detected",
            Self::Fire => "fire detected",
            Self::Vehicle => "vehicle detected",
        }
    }

    /// Sentinel written when nothing was found.
    pub fn not_detected_label(&self) -> &'static str {
        match self {
            Self::Person => "No humans detected",
            Self::Fall => "fall not detected",
            Self::Fire => "fire not detected",
            Self::Vehicle => "No vehicles detected",
        }
    }

    /// Normalize a detector verdict into the value stored in the record.
    ///
    /// An empty finding list becomes the "nothing detected" sentinel so the
    /// record never holds an empty collection.
    pub fn status_for(&self, outcome: DetectionOutcome) -> Value {
        match outcome {
            DetectionOutcome::Flag(true) => Value::from(self.detected_label()),
            DetectionOutcome::Flag(false) => Value::from(self.not_detected_label()),
            DetectionOutcome::Findings(findings) if findings.is_empty() => {
                Value::from(self.not_detected_label())
            }
            DetectionOutcome::Findings(findings) => Value::Array(findings),
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" | "human" => Ok(Self::Person),
            "fall" => Ok(Self::Fall),
            "fire" => Ok(Self::Fire),
            "vehicle" | "car" => Ok(Self::Vehicle),
            other => Err(anyhow!("unknown detector kind '{}'", other)),
        }
    }
}
