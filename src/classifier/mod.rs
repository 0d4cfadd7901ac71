//! Classifier capability consumed by the reweighting engine.
//!
//! The engine only needs two things from a classifier: train on weighted,
//! labelled rows and hand back class probabilities for arbitrary rows. Model
//! architectures are resolved by tag through a [`ClassifierRegistry`] when the
//! run is configured, never by name at call time.

mod neighbors;
mod logistic;

use std::collections::BTreeMap;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::FeatureMatrix;
use crate::error::{Result, UnfoldError};

pub use self::neighbors::KnnClassifier;
pub use self::logistic::LogisticClassifier;

/// Per-call training settings chosen by the engine.
#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    pub n_classes: usize,
    /// Fraction of rows held out to monitor the loss, in `[0, 1)`.
    pub validation_split: f64,
    pub seed: u64,
    pub epsilon: f64,
    /// Starting point for a parametric model, normally the previous
    /// iteration's fit of the same step. Ignored when its size does not match.
    pub initial_parameters: Option<Vec<f64>>,
}

/// What the engine learns about a finished training.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub converged: bool,
    pub epochs: usize,
    pub best_epoch: usize,
    pub best_validation_loss: Option<f64>,
    /// Set by [`TrainingOutcome::into_best`] when the best checkpoint replaced
    /// the final-epoch model.
    pub restored_best: bool,
}

/// A trained model.
pub trait Predictor: Send + Sync {
    /// Class probabilities, one row of `n_classes` values per input row.
    fn predict_proba(&self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>>;

    /// Fitted parameters that can seed the next training, if the model has any.
    fn parameters(&self) -> Option<Vec<f64>> {
        None
    }
}

pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn train(
        &self,
        features: &FeatureMatrix,
        labels: &[usize],
        weights: &[f64],
        options: &TrainOptions,
    ) -> Result<TrainingOutcome>;
}

/// Final-epoch model plus the best checkpoint, when the classifier keeps one.
pub struct TrainingOutcome {
    pub last: Box<dyn Predictor>,
    pub best: Option<Box<dyn Predictor>>,
    pub report: TrainingReport,
}

impl TrainingOutcome {
    /// The best-known model: the checkpoint if there is one, else the last.
    pub fn into_best(self) -> (Box<dyn Predictor>, TrainingReport) {
        let mut report = self.report;
        match self.best {
            Some(best) => {
                report.restored_best = report.best_epoch != report.epochs;
                (best, report)
            }
            None => (self.last, report),
        }
    }
}

pub type ClassifierBuilder = fn() -> Box<dyn Classifier>;

/// Model tag to constructor.
#[derive(Clone)]
pub struct ClassifierRegistry {
    builders: BTreeMap<String, ClassifierBuilder>,
}

impl ClassifierRegistry {
    pub fn empty() -> Self {
        Self { builders: BTreeMap::new() }
    }

    /// Registry holding the built-in classifiers.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("logistic", || Box::new(LogisticClassifier::default()));
        registry.register("knn", || Box::new(KnnClassifier::default()));
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, builder: ClassifierBuilder) {
        self.builders.insert(tag.into(), builder);
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    pub fn build(&self, tag: &str) -> Result<Box<dyn Classifier>> {
        self.builders.get(tag).map(|builder| builder()).ok_or_else(|| UnfoldError::Unknown {
            kind: "classifier",
            name: tag.to_string(),
            expected: self.tags().collect::<Vec<_>>().join(", "),
        })
    }
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

pub(crate) fn check_training_inputs(
    features: &FeatureMatrix,
    labels: &[usize],
    weights: &[f64],
    n_classes: usize,
) -> Result<()> {
    let n = features.n_rows();
    if labels.len() != n || weights.len() != n {
        return Err(UnfoldError::Precondition(format!(
            "{n} feature rows, {} labels, {} weights",
            labels.len(),
            weights.len()
        )));
    }
    if n == 0 {
        return Err(UnfoldError::Training("cannot train on zero rows".into()));
    }
    if n_classes < 2 {
        return Err(UnfoldError::Precondition(format!("need at least 2 classes, got {n_classes}")));
    }
    if let Some(bad) = labels.iter().find(|&&l| l >= n_classes) {
        return Err(UnfoldError::Precondition(format!(
            "label {bad} out of range for {n_classes} classes"
        )));
    }
    if weights.iter().any(|w| !w.is_finite()) {
        return Err(UnfoldError::NonFinite("training weights".into()));
    }
    Ok(())
}

/// Seeded shuffle into training and validation row indices.
///
/// The training part is never empty; the validation part may be.
pub(crate) fn split_rows(n: usize, validation_split: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rows: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    rows.shuffle(&mut rng);
    let n_val = ((n as f64) * validation_split.clamp(0.0, 1.0)).floor() as usize;
    let n_val = n_val.min(n.saturating_sub(1));
    let val = rows.split_off(n - n_val);
    (rows, val)
}

/// Per-column centering and scaling fitted on training rows.
#[derive(Debug, Clone)]
pub(crate) struct Standardizer {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl Standardizer {
    pub(crate) fn fit(features: &FeatureMatrix, rows: &[usize]) -> Self {
        let d = features.n_cols();
        let n = rows.len().max(1) as f64;
        let mut mean = vec![0.0; d];
        for &r in rows {
            for (m, x) in mean.iter_mut().zip(features.row(r)) {
                *m += x / n;
            }
        }
        let mut var = vec![0.0; d];
        for &r in rows {
            for ((v, m), x) in var.iter_mut().zip(&mean).zip(features.row(r)) {
                *v += (x - m).powi(2) / n;
            }
        }
        let scale = var
            .into_iter()
            .map(|v| if v.sqrt() > f64::EPSILON { v.sqrt() } else { 1.0 })
            .collect();
        Self { mean, scale }
    }

    pub(crate) fn apply(&self, row: &[f64]) -> Vec<f64> {
        row.iter().zip(&self.mean).zip(&self.scale).map(|((x, m), s)| (x - m) / s).collect()
    }
}

/// Mean weighted categorical cross-entropy, probabilities clipped to
/// `[epsilon, 1 - epsilon]`.
pub(crate) fn weighted_cross_entropy<'a>(
    probabilities: impl Iterator<Item = &'a [f64]>,
    labels: &[usize],
    weights: &[f64],
    epsilon: f64,
) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for ((p, &label), &w) in probabilities.zip(labels).zip(weights) {
        sum -= w * p[label].clamp(epsilon, 1.0 - epsilon).ln();
        n += 1;
    }
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}
