//! Analog jitter suppression
//!
//! Potentiometers wobble by a percent or two at rest. A reading only counts as
//! a move once it is far enough from the last value that was actually
//! delivered, with a snap to the exact end stops so a slider pushed all the
//! way reaches 0.0 or 1.0 even when the last step was small.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Noise reduction level from config (`noise_reduction`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseReduction {
    Low,
    #[default]
    Default,
    High,
}

impl NoiseReduction {
    /// Minimum delta between two scalars for them to count as different
    pub fn threshold(self) -> f32 {
        match self {
            NoiseReduction::Low => 0.015,
            NoiseReduction::Default => 0.025,
            NoiseReduction::High => 0.035,
        }
    }
}

impl fmt::Display for NoiseReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoiseReduction::Low => write!(f, "low"),
            NoiseReduction::Default => write!(f, "default"),
            NoiseReduction::High => write!(f, "high"),
        }
    }
}

const EPSILON: f32 = 0.000_001;

fn almost_equals(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

/// Whether `new` differs enough from `old` to be worth acting on
pub fn significantly_different(old: f32, new: f32, level: NoiseReduction) -> bool {
    if (old - new).abs() >= level.threshold() {
        return true;
    }

    // end stops always win
    (almost_equals(new, 1.0) && !almost_equals(old, 1.0))
        || (almost_equals(new, 0.0) && !almost_equals(old, 0.0))
}
