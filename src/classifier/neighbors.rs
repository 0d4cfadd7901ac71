//! Weighted k-nearest-neighbour class probabilities.

use ::knn::PointCloud;
use rayon::prelude::*;
use tracing::debug;

use super::{
    check_training_inputs, split_rows, weighted_cross_entropy, Classifier, Predictor,
    Standardizer, TrainOptions, TrainingOutcome, TrainingReport,
};
use crate::data::FeatureMatrix;
use crate::error::Result;

#[derive(Debug, Clone)]
struct LabeledPoint {
    x: Vec<f64>,
    label: usize,
    weight: f64,
}

fn euclidean(a: &LabeledPoint, b: &LabeledPoint) -> f64 {
    a.x.iter().zip(&b.x).map(|(u, v)| (u - v).powi(2)).sum::<f64>().sqrt()
}

/// Neighbourhood size is picked among `k_candidates` by validation loss.
#[derive(Debug, Clone)]
pub struct KnnClassifier {
    k_candidates: Vec<usize>,
}

impl Default for KnnClassifier {
    fn default() -> Self {
        Self { k_candidates: vec![16, 32, 64] }
    }
}

impl KnnClassifier {
    #[must_use]
    pub fn with_k_candidates(mut self, k_candidates: Vec<usize>) -> Self {
        self.k_candidates = k_candidates.into_iter().filter(|&k| k > 0).collect();
        if self.k_candidates.is_empty() {
            self.k_candidates.push(1);
        }
        self
    }
}

struct KnnPredictor {
    scaler: Standardizer,
    points: Vec<LabeledPoint>,
    k: usize,
    n_classes: usize,
}

impl KnnPredictor {
    fn proba_scaled(&self, queries: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let mut pc = PointCloud::new(euclidean);
        self.points.iter().for_each(|point| pc.add_point(point));
        let k = self.k.min(self.points.len()).max(1);
        queries
            .par_iter()
            .map(|x| {
                let query = LabeledPoint { x: x.clone(), label: 0, weight: 0.0 };
                let mut sums = vec![0.0; self.n_classes];
                for (_, point) in pc.get_nearest_k(&query, k) {
                    sums[point.label] += point.weight;
                }
                // Negative-weight neighbours can drive a class below zero.
                sums.iter_mut().for_each(|s| *s = s.max(0.0));
                let total: f64 = sums.iter().sum();
                if total > 0.0 {
                    sums.into_iter().map(|s| s / total).collect()
                } else {
                    vec![1.0 / self.n_classes as f64; self.n_classes]
                }
            })
            .collect()
    }
}

impl Predictor for KnnPredictor {
    fn predict_proba(&self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>> {
        let queries: Vec<Vec<f64>> = features.rows().map(|row| self.scaler.apply(row)).collect();
        Ok(self.proba_scaled(&queries))
    }
}

impl Classifier for KnnClassifier {
    fn name(&self) -> &str {
        "knn"
    }

    fn train(
        &self,
        features: &FeatureMatrix,
        labels: &[usize],
        weights: &[f64],
        options: &TrainOptions,
    ) -> Result<TrainingOutcome> {
        check_training_inputs(features, labels, weights, options.n_classes)?;
        let (train_rows, val_rows) =
            split_rows(features.n_rows(), options.validation_split, options.seed);
        let scaler = Standardizer::fit(features, &train_rows);
        let points: Vec<LabeledPoint> = train_rows
            .iter()
            .map(|&r| LabeledPoint {
                x: scaler.apply(features.row(r)),
                label: labels[r],
                weight: weights[r],
            })
            .collect();

        let predictor = |k: usize| KnnPredictor {
            scaler: scaler.clone(),
            points: points.clone(),
            k,
            n_classes: options.n_classes,
        };

        let mut best: Option<(usize, f64, usize)> = None;
        if !val_rows.is_empty() {
            let queries: Vec<Vec<f64>> =
                val_rows.iter().map(|&r| scaler.apply(features.row(r))).collect();
            let val_labels: Vec<usize> = val_rows.iter().map(|&r| labels[r]).collect();
            let val_weights: Vec<f64> = val_rows.iter().map(|&r| weights[r]).collect();
            for (i, &k) in self.k_candidates.iter().enumerate() {
                let probs = predictor(k).proba_scaled(&queries);
                let loss = weighted_cross_entropy(
                    probs.iter().map(Vec::as_slice),
                    &val_labels,
                    &val_weights,
                    options.epsilon,
                );
                debug!(k, loss, "knn candidate");
                if best.map_or(true, |(_, l, _)| loss < l) {
                    best = Some((k, loss, i + 1));
                }
            }
        }

        let last_k = self.k_candidates.last().copied().unwrap_or(1);
        let report = TrainingReport {
            converged: true,
            epochs: self.k_candidates.len(),
            best_epoch: best.map_or(self.k_candidates.len(), |(_, _, e)| e),
            best_validation_loss: best.map(|(_, l, _)| l),
            restored_best: false,
        };
        Ok(TrainingOutcome {
            last: Box::new(predictor(last_k)),
            best: best.map(|(k, _, _)| Box::new(predictor(k)) as Box<dyn Predictor>),
            report,
        })
    }
}
