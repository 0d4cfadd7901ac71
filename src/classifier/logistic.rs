//! Weighted multinomial logistic regression fitted with Nelder-Mead.
//!
//! Class 0 is the reference class with a logit of zero; every other class
//! carries an intercept and one coefficient per standardized feature. Training
//! runs in epochs: each epoch restarts the simplex from the current point,
//! and the parameters with the lowest validation loss are kept as the best
//! checkpoint. Training stops when the training loss settles (converged) or
//! the validation loss has not improved for `patience` epochs.
//!
//! Given [`TrainOptions::initial_parameters`] of the right size, the first
//! simplex starts there instead of at the origin.

use std::convert::Infallible;
use std::sync::Arc;

use ganesh::prelude::*;
use ganesh::{
    algorithms::{NelderMead, NelderMeadOptions},
    core::Function,
};
use rayon::prelude::*;
use tracing::debug;

use super::{
    check_training_inputs, split_rows, weighted_cross_entropy, Classifier, Predictor,
    Standardizer, TrainOptions, TrainingOutcome, TrainingReport,
};
use crate::data::FeatureMatrix;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct LogisticClassifier {
    max_epochs: usize,
    patience: usize,
    steps_per_epoch: usize,
    simplex_size: f64,
    l2: f64,
    tolerance: f64,
}

impl Default for LogisticClassifier {
    fn default() -> Self {
        Self {
            max_epochs: 30,
            patience: 5,
            steps_per_epoch: 200,
            simplex_size: 0.5,
            l2: 1e-4,
            tolerance: 1e-7,
        }
    }
}

impl LogisticClassifier {
    #[must_use]
    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs.max(1);
        self
    }

    #[must_use]
    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience.max(1);
        self
    }

    #[must_use]
    pub fn with_steps_per_epoch(mut self, steps: usize) -> Self {
        self.steps_per_epoch = steps.max(1);
        self
    }

    #[must_use]
    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2.max(0.0);
        self
    }
}

/// Standardized rows of one split, shared by every simplex restart.
#[derive(Debug)]
struct Batch {
    x: Vec<Vec<f64>>,
    labels: Vec<usize>,
    weights: Vec<f64>,
}

impl Batch {
    fn gather(
        features: &FeatureMatrix,
        labels: &[usize],
        weights: &[f64],
        rows: &[usize],
        scaler: &Standardizer,
    ) -> Self {
        Self {
            x: rows.iter().map(|&r| scaler.apply(features.row(r))).collect(),
            labels: rows.iter().map(|&r| labels[r]).collect(),
            weights: rows.iter().map(|&r| weights[r]).collect(),
        }
    }

    fn loss(&self, params: &[f64], n_classes: usize, epsilon: f64) -> f64 {
        let probs: Vec<Vec<f64>> = self.x.iter().map(|row| softmax(params, row, n_classes)).collect();
        weighted_cross_entropy(probs.iter().map(Vec::as_slice), &self.labels, &self.weights, epsilon)
    }
}

#[derive(Clone)]
struct CrossEntropy {
    batch: Arc<Batch>,
    n_classes: usize,
    epsilon: f64,
}

impl Function<f64, f64, Infallible> for CrossEntropy {
    fn evaluate(&self, x: &[f64], args: Option<&f64>) -> std::result::Result<f64, Infallible> {
        let l2 = args.copied().unwrap_or(0.0);
        let penalty: f64 = x.iter().map(|v| v * v).sum();
        Ok(self.batch.loss(x, self.n_classes, self.epsilon) + l2 * penalty)
    }
}

fn softmax(params: &[f64], row: &[f64], n_classes: usize) -> Vec<f64> {
    let stride = row.len() + 1;
    let mut logits = Vec::with_capacity(n_classes);
    logits.push(0.0);
    for c in 1..n_classes {
        let block = &params[(c - 1) * stride..c * stride];
        let z = block[0] + block[1..].iter().zip(row).map(|(b, x)| b * x).sum::<f64>();
        logits.push(z);
    }
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut total = 0.0;
    for z in logits.iter_mut() {
        *z = (*z - max).exp();
        total += *z;
    }
    logits.into_iter().map(|z| z / total).collect()
}

struct LogisticPredictor {
    scaler: Standardizer,
    params: Vec<f64>,
    n_classes: usize,
}

impl Predictor for LogisticPredictor {
    fn predict_proba(&self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>> {
        Ok((0..features.n_rows())
            .into_par_iter()
            .map(|i| softmax(&self.params, &self.scaler.apply(features.row(i)), self.n_classes))
            .collect())
    }

    fn parameters(&self) -> Option<Vec<f64>> {
        Some(self.params.clone())
    }
}

impl Classifier for LogisticClassifier {
    fn name(&self) -> &str {
        "logistic"
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
        let train = Arc::new(Batch::gather(features, labels, weights, &train_rows, &scaler));
        let val = if val_rows.is_empty() {
            Arc::clone(&train)
        } else {
            Arc::new(Batch::gather(features, labels, weights, &val_rows, &scaler))
        };

        let n_classes = options.n_classes;
        let n_params = (n_classes - 1) * (features.n_cols() + 1);
        let objective = CrossEntropy { batch: Arc::clone(&train), n_classes, epsilon: options.epsilon };

        let mut params = match &options.initial_parameters {
            Some(start) if start.len() == n_params => start.clone(),
            Some(start) => {
                debug!(expected = n_params, found = start.len(), "ignoring warm start");
                vec![0.0; n_params]
            }
            None => vec![0.0; n_params],
        };
        let mut best_params = params.clone();
        let mut best_loss = val.loss(&params, n_classes, options.epsilon);
        let mut best_epoch = 0;
        let mut last_train_loss = train.loss(&params, n_classes, options.epsilon);
        let mut converged = false;
        let mut epochs = 0;
        let mut since_best = 0;

        for epoch in 1..=self.max_epochs {
            epochs = epoch;
            let mut nm = NelderMead::new(
                objective.clone(),
                &params,
                Some(
                    NelderMeadOptions::adaptive(n_params.max(2))
                        .simplex_size(self.simplex_size)
                        .build(),
                ),
            );
            if let Err(never) = nm.minimize(Some(&self.l2), self.steps_per_epoch, |_| {}) {
                match never {}
            }
            let (x, _) = nm.best();
            params = x.iter().copied().collect();

            let train_loss = train.loss(&params, n_classes, options.epsilon);
            let val_loss = val.loss(&params, n_classes, options.epsilon);
            debug!(epoch, train_loss, val_loss, "logistic epoch");

            if val_loss < best_loss {
                best_loss = val_loss;
                best_params.clone_from(&params);
                best_epoch = epoch;
                since_best = 0;
            } else {
                since_best += 1;
            }
            if (last_train_loss - train_loss).abs() < self.tolerance {
                converged = true;
                break;
            }
            last_train_loss = train_loss;
            if since_best >= self.patience {
                break;
            }
        }

        let last = LogisticPredictor { scaler: scaler.clone(), params, n_classes };
        let best = LogisticPredictor { scaler, params: best_params, n_classes };
        Ok(TrainingOutcome {
            last: Box::new(last),
            best: Some(Box::new(best)),
            report: TrainingReport {
                converged,
                epochs,
                best_epoch,
                best_validation_loss: Some(best_loss),
                restored_best: false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn options(n_classes: usize) -> TrainOptions {
        TrainOptions {
            n_classes,
            validation_split: 0.2,
            seed: 11,
            epsilon: 1e-7,
            ..Default::default()
        }
    }

    fn separable(n: usize) -> (FeatureMatrix, Vec<usize>) {
        // Class 1 sits at larger x.
        let mut data = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let label = i % 2;
            data.push((i as f64 / n as f64) + label as f64);
            labels.push(label);
        }
        (FeatureMatrix::new(n, 1, data).unwrap(), labels)
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let p = softmax(&[0.3, -1.2, 2.0, 0.5], &[0.7], 3);
        assert_eq!(p.len(), 3);
        assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_separates_shifted_classes() {
        let n = 200;
        let (features, labels) = separable(n);
        let weights = vec![1.0; n];
        let outcome =
            LogisticClassifier::default().train(&features, &labels, &weights, &options(2)).unwrap();
        let (model, report) = outcome.into_best();
        assert!(report.epochs >= 1);
        let probe = FeatureMatrix::new(2, 1, vec![0.0, 2.0]).unwrap();
        let p = model.predict_proba(&probe).unwrap();
        assert!(p[0][1] < 0.5);
        assert!(p[1][1] > 0.5);
    }

    #[test]
    fn test_warm_start_begins_from_given_parameters() {
        let n = 200;
        let (features, labels) = separable(n);
        let weights = vec![1.0; n];
        let short = LogisticClassifier::default().with_max_epochs(1).with_steps_per_epoch(1);
        let cold = short.train(&features, &labels, &weights, &options(2)).unwrap();
        let warm_options = TrainOptions { initial_parameters: Some(vec![0.0, 20.0]), ..options(2) };
        let warm = short.train(&features, &labels, &weights, &warm_options).unwrap();
        let cold_loss = cold.report.best_validation_loss.unwrap();
        let warm_loss = warm.report.best_validation_loss.unwrap();
        assert!(warm_loss < cold_loss, "warm {warm_loss} cold {cold_loss}");

        // A start of the wrong size falls back to the origin.
        let bad_options = TrainOptions { initial_parameters: Some(vec![1.0; 5]), ..options(2) };
        let bad = short.train(&features, &labels, &weights, &bad_options).unwrap();
        assert_eq!(bad.report.best_validation_loss, cold.report.best_validation_loss);
    }

    #[test]
    fn test_identical_classes_give_even_odds() {
        let n = 100;
        let data: Vec<f64> = (0..n).map(|i| (i / 2) as f64 / 50.0).collect();
        let labels: Vec<usize> = (0..n).map(|i| i % 2).collect();
        let features = FeatureMatrix::new(n, 1, data).unwrap();
        let outcome = LogisticClassifier::default()
            .train(&features, &labels, &vec![1.0; n], &options(2))
            .unwrap();
        let (model, _) = outcome.into_best();
        let p = model.predict_proba(&features).unwrap();
        for row in p {
            assert_abs_diff_eq!(row[1], 0.5, epsilon = 0.1);
        }
    }

    #[test]
    fn test_three_class_output_shape() {
        let n = 90;
        let data: Vec<f64> = (0..n).map(|i| (i % 3) as f64).collect();
        let labels: Vec<usize> = (0..n).map(|i| i % 3).collect();
        let features = FeatureMatrix::new(n, 1, data).unwrap();
        let outcome = LogisticClassifier::default()
            .with_max_epochs(5)
            .train(&features, &labels, &vec![1.0; n], &options(3))
            .unwrap();
        let (model, _) = outcome.into_best();
        let p = model.predict_proba(&features).unwrap();
        assert!(p.iter().all(|row| row.len() == 3));
    }
}
