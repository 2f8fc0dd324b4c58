//! Frame-to-frame change metrics.
//!
//! Two scores are produced for a pair of frames:
//! - `absolute_difference`: mean absolute difference over every channel of
//!   every pixel, in 0..=255 units.
//! - `similarity`: zero-mean normalized cross-correlation of the grayscale
//!   planes, in [-1, 1] with 1.0 meaning a perfect match.

use std::borrow::Cow;

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};

/// Denominators below this are treated as a constant (zero-variance) plane.
const DEGENERATE_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeMetrics {
    pub absolute_difference: f64,
    pub similarity: f64,
}

impl ChangeMetrics {
    pub const IDENTICAL: ChangeMetrics = ChangeMetrics {
        absolute_difference: 0.0,
        similarity: 1.0,
    };
}

/// Compare two decoded frames of any color layout.
///
/// Anything with more than three channels is truncated to RGB; grayscale
/// input is expanded to RGB.
pub fn compare_images(previous: &DynamicImage, current: &DynamicImage) -> ChangeMetrics {
    compare(&previous.to_rgb8(), &current.to_rgb8())
}

/// Compare two RGB frames. `current` is resized to `previous`'s dimensions
/// when they differ.
pub fn compare(previous: &RgbImage, current: &RgbImage) -> ChangeMetrics {
    let current: Cow<'_, RgbImage> = if previous.dimensions() == current.dimensions() {
        Cow::Borrowed(current)
    } else {
        let (width, height) = previous.dimensions();
        Cow::Owned(imageops::resize(current, width, height, FilterType::Triangle))
    };

    if previous.as_raw().is_empty() {
        return ChangeMetrics::IDENTICAL;
    }

    ChangeMetrics {
        absolute_difference: mean_absolute_difference(previous.as_raw(), current.as_raw()),
        similarity: normalized_correlation(&grayscale(previous), &grayscale(&current)),
    }
}

fn mean_absolute_difference(a: &[u8], b: &[u8]) -> f64 {
    let total: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| x.abs_diff(*y) as u64)
        .sum();
    total as f64 / a.len() as f64
}

fn grayscale(frame: &RgbImage) -> Vec<f64> {
    frame
        .pixels()
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .collect()
}

fn normalized_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cross = 0.0;
    let mut energy_a = 0.0;
    let mut energy_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cross += dx * dy;
        energy_a += dx * dx;
        energy_b += dy * dy;
    }

    let denominator = (energy_a * energy_b).sqrt();
    if denominator < DEGENERATE_EPSILON {
        // Constant plane on at least one side: correlation is undefined.
        return if a == b { 1.0 } else { 0.0 };
    }
    (cross / denominator).clamp(-1.0, 1.0)
}
