//! Background policies for the detector-level step.
//!
//! Background simulation only ever enters step 1. Each policy decides which
//! label background rows carry, with which sign, and how the signal
//! likelihood ratio is read off the classifier output.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::FeatureMatrix;
use crate::error::{Result, UnfoldError};
use crate::ratio::{binary_multipliers, class_ratio, ClipStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackgroundMode {
    /// Background joins the simulation class with its own weight.
    #[default]
    #[serde(rename = "default")]
    Default,
    /// Background is subtracted from the observed class through negated
    /// weights.
    #[serde(rename = "negW")]
    NegativeWeight,
    /// Background is a third class; the ratio uses observed over signal.
    #[serde(rename = "multiClass")]
    MultiClass,
}

impl BackgroundMode {
    pub const NAMES: [&'static str; 3] = ["default", "negW", "multiClass"];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackgroundMode::Default => "default",
            BackgroundMode::NegativeWeight => "negW",
            BackgroundMode::MultiClass => "multiClass",
        }
    }

    pub fn n_classes(&self) -> usize {
        match self {
            BackgroundMode::MultiClass => 3,
            _ => 2,
        }
    }

    /// Label and weight sign of each sample in step 1.
    fn assignment(&self, role: Role) -> (usize, f64) {
        match (self, role) {
            (BackgroundMode::MultiClass, Role::Observed) => (0, 1.0),
            (BackgroundMode::MultiClass, Role::Signal) => (1, 1.0),
            (BackgroundMode::MultiClass, Role::Background) => (2, 1.0),
            (_, Role::Observed) => (1, 1.0),
            (_, Role::Signal) => (0, 1.0),
            (BackgroundMode::Default, Role::Background) => (0, 1.0),
            (BackgroundMode::NegativeWeight, Role::Background) => (1, -1.0),
        }
    }

    /// The label whose total gets rescaled when classes are balanced.
    fn observed_label(&self) -> usize {
        self.assignment(Role::Observed).0
    }

    /// Assemble the step-1 training set. Rows flagged invalid are left out.
    pub fn detector_training(
        &self,
        observed: DetectorBlock<'_>,
        signal: DetectorBlock<'_>,
        background: Option<DetectorBlock<'_>>,
        balance_classes: bool,
    ) -> Result<DetectorTraining> {
        let mut blocks = vec![(Role::Observed, observed), (Role::Signal, signal)];
        if let Some(bkg) = background {
            blocks.push((Role::Background, bkg));
        }

        let mut parts = Vec::with_capacity(blocks.len());
        let mut labels = Vec::new();
        let mut weights = Vec::new();
        for (role, block) in blocks {
            let (label, sign) = self.assignment(role);
            let rows = block.valid_rows();
            labels.extend(std::iter::repeat(label).take(rows.len()));
            weights.extend(rows.iter().map(|&r| sign * block.weights[r]));
            parts.push(block.features.select_rows(&rows));
        }
        let features = FeatureMatrix::vstack(&parts.iter().collect::<Vec<_>>())?;

        if balance_classes {
            balance(&labels, &mut weights, self.observed_label())?;
        }
        Ok(DetectorTraining { features, labels, weights })
    }

    /// Step-1 weight multipliers for signal events from class probabilities.
    pub fn signal_multipliers(
        &self,
        probabilities: &[Vec<f64>],
        epsilon: f64,
    ) -> (Vec<f64>, ClipStats) {
        match self {
            BackgroundMode::MultiClass => {
                let mut stats = ClipStats::default();
                let out = probabilities
                    .iter()
                    .map(|p| {
                        let p_obs = p.first().copied().unwrap_or(f64::NAN);
                        let p_sig = p.get(1).copied().unwrap_or(f64::NAN);
                        class_ratio(p_obs, p_sig, epsilon, &mut stats)
                    })
                    .collect();
                (out, stats)
            }
            _ => binary_multipliers(probabilities, epsilon),
        }
    }
}

impl fmt::Display for BackgroundMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackgroundMode {
    type Err = UnfoldError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(BackgroundMode::Default),
            "negW" => Ok(BackgroundMode::NegativeWeight),
            "multiClass" => Ok(BackgroundMode::MultiClass),
            other => Err(UnfoldError::Unknown {
                kind: "background mode",
                name: other.to_string(),
                expected: Self::NAMES.join(", "),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Observed,
    Signal,
    Background,
}

/// Detector-level features of one sample with its current weights.
#[derive(Debug, Clone, Copy)]
pub struct DetectorBlock<'a> {
    pub features: &'a FeatureMatrix,
    pub weights: &'a [f64],
    pub valid: &'a [bool],
}

impl DetectorBlock<'_> {
    fn valid_rows(&self) -> Vec<usize> {
        self.valid.iter().enumerate().filter(|(_, &v)| v).map(|(i, _)| i).collect()
    }
}

#[derive(Debug, Clone)]
pub struct DetectorTraining {
    pub features: FeatureMatrix,
    pub labels: Vec<usize>,
    pub weights: Vec<f64>,
}

/// Rescale `target` so its total matches the total of every other label.
pub(crate) fn balance(labels: &[usize], weights: &mut [f64], target: usize) -> Result<()> {
    let (mut target_sum, mut rest_sum) = (0.0, 0.0);
    for (&label, &w) in labels.iter().zip(weights.iter()) {
        if label == target {
            target_sum += w;
        } else {
            rest_sum += w;
        }
    }
    if target_sum <= 0.0 || rest_sum <= 0.0 {
        return Err(UnfoldError::Precondition(format!(
            "cannot balance classes: label {target} sums to {target_sum}, the rest to {rest_sum}"
        )));
    }
    let scale = rest_sum / target_sum;
    for (&label, w) in labels.iter().zip(weights.iter_mut()) {
        if label == target {
            *w *= scale;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Owned {
        features: FeatureMatrix,
        weights: Vec<f64>,
        valid: Vec<bool>,
    }

    impl Owned {
        fn as_block(&self) -> DetectorBlock<'_> {
            DetectorBlock { features: &self.features, weights: &self.weights, valid: &self.valid }
        }
    }

    fn owned(values: &[f64], weight: f64) -> Owned {
        Owned {
            features: FeatureMatrix::new(values.len(), 1, values.to_vec()).unwrap(),
            weights: vec![weight; values.len()],
            valid: vec![true; values.len()],
        }
    }

    #[test]
    fn test_mode_names_round_trip() {
        for name in BackgroundMode::NAMES {
            assert_eq!(name.parse::<BackgroundMode>().unwrap().as_str(), name);
        }
        assert!(matches!(
            "subtract".parse::<BackgroundMode>(),
            Err(UnfoldError::Unknown { kind: "background mode", .. })
        ));
    }

    #[test]
    fn test_default_mode_puts_background_with_simulation() {
        let (obs, sig, bkg) = (owned(&[1.0, 2.0], 1.0), owned(&[3.0], 2.0), owned(&[4.0], 0.5));
        let t = BackgroundMode::Default
            .detector_training(obs.as_block(), sig.as_block(), Some(bkg.as_block()), false)
            .unwrap();
        assert_eq!(t.labels, vec![1, 1, 0, 0]);
        assert_eq!(t.weights, vec![1.0, 1.0, 2.0, 0.5]);
        assert_eq!(t.features.row(3), &[4.0]);
    }

    #[test]
    fn test_negative_weight_mode_subtracts_from_observed() {
        let (obs, sig, bkg) = (owned(&[1.0, 2.0], 1.0), owned(&[3.0], 1.0), owned(&[4.0], 0.5));
        let t = BackgroundMode::NegativeWeight
            .detector_training(obs.as_block(), sig.as_block(), Some(bkg.as_block()), true)
            .unwrap();
        assert_eq!(t.labels, vec![1, 1, 0, 1]);
        // Observed minus background sums to 1.5, rescaled to the signal total of 1.
        let label1: f64 =
            t.labels.iter().zip(&t.weights).filter(|(l, _)| **l == 1).map(|(_, w)| w).sum();
        assert_relative_eq!(label1, 1.0, epsilon = 1e-12);
        assert!(t.weights[3] < 0.0);
    }

    #[test]
    fn test_multiclass_labels_and_balance() {
        let (obs, sig, bkg) = (owned(&[1.0, 2.0], 3.0), owned(&[3.0], 1.0), owned(&[4.0, 5.0], 1.0));
        let t = BackgroundMode::MultiClass
            .detector_training(obs.as_block(), sig.as_block(), Some(bkg.as_block()), true)
            .unwrap();
        assert_eq!(t.labels, vec![0, 0, 1, 2, 2]);
        assert_relative_eq!(t.weights[0] + t.weights[1], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_rows_are_skipped() {
        let mut obs = owned(&[1.0, 2.0, 3.0], 1.0);
        obs.valid[1] = false;
        let sig = owned(&[3.0], 1.0);
        let t = BackgroundMode::Default
            .detector_training(obs.as_block(), sig.as_block(), None, false)
            .unwrap();
        assert_eq!(t.features.n_rows(), 3);
        assert_eq!(t.features.row(1), &[3.0]);
    }

    #[test]
    fn test_default_and_negw_agree_without_background() {
        let obs = owned(&[1.0, 2.0], 1.0);
        let sig = owned(&[3.0, 4.0, 5.0], 0.7);
        let empty = owned(&[], 1.0);
        let a = BackgroundMode::Default
            .detector_training(obs.as_block(), sig.as_block(), None, true)
            .unwrap();
        let b = BackgroundMode::NegativeWeight
            .detector_training(obs.as_block(), sig.as_block(), Some(empty.as_block()), true)
            .unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.weights, b.weights);
        assert_eq!(a.features, b.features);
    }

    #[test]
    fn test_multiclass_multiplier_matches_binary_without_background_mass() {
        let (multi, _) = BackgroundMode::MultiClass.signal_multipliers(&[vec![0.6, 0.4, 0.0]], 1e-7);
        let (binary, _) = BackgroundMode::Default.signal_multipliers(&[vec![0.4, 0.6]], 1e-7);
        assert_relative_eq!(multi[0], binary[0], epsilon = 1e-9);
    }
}
