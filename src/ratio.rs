//! Probability to likelihood-ratio conversion.

use serde::{Deserialize, Serialize};

/// Default clipping band, the fuzz factor Keras applies inside its
/// cross-entropy losses.
pub const DEFAULT_EPSILON: f64 = 1e-7;

/// How many probabilities hit either edge of the clipping band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipStats {
    pub clipped_low: usize,
    pub clipped_high: usize,
}

impl ClipStats {
    pub fn total(&self) -> usize {
        self.clipped_low + self.clipped_high
    }

    fn clip(&mut self, p: f64, epsilon: f64) -> f64 {
        if p.is_nan() || p < epsilon {
            self.clipped_low += 1;
            epsilon
        } else if p > 1.0 - epsilon {
            self.clipped_high += 1;
            1.0 - epsilon
        } else {
            p
        }
    }
}

/// `p / (1 - p)` with `p` clipped to `[epsilon, 1 - epsilon]`.
///
/// The result is finite and strictly positive for any input, NaN included.
pub fn likelihood_ratio(p: f64, epsilon: f64, stats: &mut ClipStats) -> f64 {
    let p = stats.clip(p, epsilon);
    p / (1.0 - p)
}

/// `p_num / p_den` with both probabilities clipped, used when a third class
/// absorbs part of the probability mass.
pub fn class_ratio(p_num: f64, p_den: f64, epsilon: f64, stats: &mut ClipStats) -> f64 {
    let num = stats.clip(p_num, epsilon);
    let den = stats.clip(p_den, epsilon);
    num / den
}

/// Binary multipliers from the probability of class 1 in each row.
pub fn binary_multipliers(probabilities: &[Vec<f64>], epsilon: f64) -> (Vec<f64>, ClipStats) {
    let mut stats = ClipStats::default();
    let out = probabilities
        .iter()
        .map(|row| likelihood_ratio(row.get(1).copied().unwrap_or(f64::NAN), epsilon, &mut stats))
        .collect();
    (out, stats)
}
