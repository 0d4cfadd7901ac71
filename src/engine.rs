//! The iterative two-step reweighting engine.
//!
//! Each iteration trains a detector-level classifier (observed against
//! simulation) and turns its output into pushed weights for the signal
//! simulation, then trains a particle-level classifier (pushed against prior
//! truth weights) and pulls the result back into new truth weights. The
//! truth weights of iteration `k` are the prior of iteration `k + 1`.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::background::{balance, DetectorBlock};
use crate::classifier::{Classifier, ClassifierRegistry, Predictor, TrainOptions, TrainingReport};
use crate::config::UnfoldConfig;
use crate::data::{EventStore, FeatureMatrix, SampleView};
use crate::error::{Result, UnfoldError};
use crate::history::{IterationHistory, IterationRecord, StepDiagnostics};
use crate::io::read_weights_csv;
use crate::ratio::binary_multipliers;

/// Source of the truth-level weight history of the signal simulation.
pub trait WeightProvider {
    fn provide(&self, store: &EventStore) -> Result<IterationHistory>;
}

/// Seed handed to the trainer for one step of one iteration.
fn step_seed(seed: u64, iteration: usize, step: u8) -> u64 {
    seed.wrapping_mul(1_000_003).wrapping_add((2 * iteration + step as usize) as u64)
}

/// Reject predictor output that is not one row of `n_classes` per input row.
fn check_probabilities(probabilities: &[Vec<f64>], n_rows: usize, n_classes: usize) -> Result<()> {
    if probabilities.len() != n_rows {
        return Err(UnfoldError::Training(format!(
            "predictor returned {} rows for {n_rows} events",
            probabilities.len()
        )));
    }
    match probabilities.iter().find(|row| row.len() != n_classes) {
        Some(row) => Err(UnfoldError::Training(format!(
            "predictor returned {} class probabilities, expected {n_classes}",
            row.len()
        ))),
        None => Ok(()),
    }
}

fn ensure_finite(weights: &[f64], what: &str) -> Result<()> {
    if weights.iter().all(|w| w.is_finite()) {
        Ok(())
    } else {
        Err(UnfoldError::NonFinite(what.to_string()))
    }
}

/// Detector-level inputs of one sample, gathered once per run.
struct DetectorInput {
    features: FeatureMatrix,
    weights: Vec<f64>,
    valid: Vec<bool>,
}

impl DetectorInput {
    fn gather(view: &SampleView<'_>, variables: &[String]) -> Result<Self> {
        Ok(Self { features: view.features(variables)?, weights: view.weights(), valid: view.valid() })
    }

    fn block(&self) -> DetectorBlock<'_> {
        DetectorBlock { features: &self.features, weights: &self.weights, valid: &self.valid }
    }
}

pub struct OmniFold {
    config: UnfoldConfig,
    classifier: Box<dyn Classifier>,
}

impl OmniFold {
    pub fn new(config: UnfoldConfig, classifier: Box<dyn Classifier>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, classifier })
    }

    /// Resolve `config.model_name` against `registry`.
    pub fn from_registry(config: UnfoldConfig, registry: &ClassifierRegistry) -> Result<Self> {
        let classifier = registry.build(&config.model_name)?;
        Self::new(config, classifier)
    }

    pub fn config(&self) -> &UnfoldConfig {
        &self.config
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// Run every iteration over the full samples with the configured seed.
    pub fn unfold(&self, store: &EventStore) -> Result<IterationHistory> {
        let background = store.background().map(|b| b.view());
        self.run(
            store,
            &store.observed().view(),
            &store.signal().view(),
            background.as_ref(),
            self.config.seed,
        )
    }

    /// Run every iteration over the given views of the store's samples.
    ///
    /// All weight state lives in this call, so concurrent runs over different
    /// views never share anything mutable.
    pub(crate) fn run(
        &self,
        store: &EventStore,
        observed: &SampleView<'_>,
        signal: &SampleView<'_>,
        background: Option<&SampleView<'_>>,
        seed: u64,
    ) -> Result<IterationHistory> {
        let detector = store.detector_variables();
        let observed = DetectorInput::gather(observed, detector)?;
        let background = background.map(|b| DetectorInput::gather(b, detector)).transpose()?;
        let simulation = DetectorInput::gather(signal, detector)?;
        let truth = signal.features(store.truth_variables())?;

        let mut history = IterationHistory::start(signal.name(), signal.weights());
        let mut prior = signal.weights();
        // Fitted parameters of the last step-1 and step-2 models.
        let mut warm: [Option<Vec<f64>>; 2] = [None, None];
        for iteration in 1..=self.config.iterations {
            let (pushed, step1) = self
                .step1(
                    &observed,
                    &simulation,
                    background.as_ref(),
                    &prior,
                    seed,
                    iteration,
                    &mut warm[0],
                )
                .map_err(|e| e.at_step(iteration, 1))?;
            let (truth_weights, step2) = self
                .step2(&truth, &pushed, &prior, seed, iteration, &mut warm[1])
                .map_err(|e| e.at_step(iteration, 2))?;
            info!(
                iteration,
                sum_pushed = pushed.iter().sum::<f64>(),
                sum_truth = truth_weights.iter().sum::<f64>(),
                "iteration finished"
            );
            history.push(IterationRecord {
                iteration,
                truth_weights: truth_weights.clone(),
                pushed_weights: Some(pushed),
                step1: Some(step1),
                step2: Some(step2),
            })?;
            prior = truth_weights;
        }
        Ok(history)
    }

    /// Train, then fall back on the best checkpoint whatever the convergence.
    /// With warm starts on, `warm` seeds the training and receives the fit.
    fn fit(
        &self,
        features: &FeatureMatrix,
        labels: &[usize],
        weights: &[f64],
        mut options: TrainOptions,
        warm: &mut Option<Vec<f64>>,
        iteration: usize,
        step: u8,
    ) -> Result<(Box<dyn Predictor>, TrainingReport)> {
        if self.config.warm_start {
            options.initial_parameters = warm.take();
        }
        let (model, report) =
            self.classifier.train(features, labels, weights, &options)?.into_best();
        if self.config.warm_start {
            *warm = model.parameters();
        }
        debug!(iteration, step, ?report, "training finished");
        if !report.converged {
            warn!(
                iteration,
                step,
                epochs = report.epochs,
                best_epoch = report.best_epoch,
                "classifier did not converge, using best checkpoint"
            );
        }
        Ok((model, report))
    }

    fn step1(
        &self,
        observed: &DetectorInput,
        simulation: &DetectorInput,
        background: Option<&DetectorInput>,
        prior: &[f64],
        seed: u64,
        iteration: usize,
        warm: &mut Option<Vec<f64>>,
    ) -> Result<(Vec<f64>, StepDiagnostics)> {
        let mode = self.config.background_mode;
        let prior_block = DetectorBlock { weights: prior, ..simulation.block() };
        let training = mode.detector_training(
            observed.block(),
            prior_block,
            background.map(DetectorInput::block),
            self.config.balance_classes,
        )?;
        info!(iteration, step = 1, rows = training.labels.len(), %mode, "training");
        let options = TrainOptions {
            n_classes: mode.n_classes(),
            validation_split: self.config.validation_split,
            seed: step_seed(seed, iteration, 1),
            epsilon: self.config.epsilon,
            initial_parameters: None,
        };
        let (model, report) = self.fit(
            &training.features,
            &training.labels,
            &training.weights,
            options,
            warm,
            iteration,
            1,
        )?;

        let probabilities = model.predict_proba(&simulation.features)?;
        check_probabilities(&probabilities, simulation.features.n_rows(), mode.n_classes())?;
        let (multipliers, clipping) = mode.signal_multipliers(&probabilities, self.config.epsilon);
        if clipping.total() > 0 {
            warn!(
                iteration,
                step = 1,
                low = clipping.clipped_low,
                high = clipping.clipped_high,
                "probabilities clipped"
            );
        }
        // Events failing the detector selection keep their prior weight.
        let pushed: Vec<f64> = prior
            .iter()
            .zip(&multipliers)
            .zip(&simulation.valid)
            .map(|((&w, &m), &valid)| if valid { w * m } else { w })
            .collect();
        ensure_finite(&pushed, "pushed weights")?;
        Ok((pushed, StepDiagnostics { training: report, clipping }))
    }

    fn step2(
        &self,
        truth: &FeatureMatrix,
        pushed: &[f64],
        prior: &[f64],
        seed: u64,
        iteration: usize,
        warm: &mut Option<Vec<f64>>,
    ) -> Result<(Vec<f64>, StepDiagnostics)> {
        let n = truth.n_rows();
        let features = FeatureMatrix::vstack(&[truth, truth])?;
        let labels: Vec<usize> =
            std::iter::repeat(1).take(n).chain(std::iter::repeat(0).take(n)).collect();
        let mut weights: Vec<f64> = pushed.iter().chain(prior).copied().collect();
        if self.config.balance_classes {
            balance(&labels, &mut weights, 1)?;
        }
        info!(iteration, step = 2, rows = labels.len(), "training");
        let options = TrainOptions {
            n_classes: 2,
            validation_split: self.config.validation_split,
            seed: step_seed(seed, iteration, 2),
            epsilon: self.config.epsilon,
            initial_parameters: None,
        };
        let (model, report) =
            self.fit(&features, &labels, &weights, options, warm, iteration, 2)?;

        let probabilities = model.predict_proba(truth)?;
        check_probabilities(&probabilities, n, 2)?;
        let (multipliers, clipping) = binary_multipliers(&probabilities, self.config.epsilon);
        if clipping.total() > 0 {
            warn!(
                iteration,
                step = 2,
                low = clipping.clipped_low,
                high = clipping.clipped_high,
                "probabilities clipped"
            );
        }
        let updated: Vec<f64> = prior.iter().zip(&multipliers).map(|(w, m)| w * m).collect();
        ensure_finite(&updated, "truth weights")?;
        Ok((updated, StepDiagnostics { training: report, clipping }))
    }
}

impl WeightProvider for OmniFold {
    fn provide(&self, store: &EventStore) -> Result<IterationHistory> {
        self.unfold(store)
    }
}

/// Final truth weights loaded from disk instead of trained.
#[derive(Debug, Clone)]
pub struct StoredWeights {
    weights: Vec<f64>,
    iteration: usize,
    origin: String,
}

impl StoredWeights {
    pub fn new(weights: Vec<f64>, iteration: usize, origin: impl Into<String>) -> Self {
        Self { weights, iteration, origin: origin.into() }
    }

    /// Read one column of a weights CSV; the last column when none is named.
    /// An `iteration_<k>` column name sets the recorded iteration index.
    pub fn from_csv(path: &Path, column: Option<&str>) -> Result<Self> {
        let (name, weights) = read_weights_csv(path, column)?;
        let iteration = name
            .strip_prefix("iteration_")
            .and_then(|k| k.parse().ok())
            .unwrap_or(0);
        Ok(Self::new(weights, iteration, format!("{}:{name}", path.display())))
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl WeightProvider for StoredWeights {
    fn provide(&self, store: &EventStore) -> Result<IterationHistory> {
        let signal = store.signal();
        if self.weights.len() != signal.len() {
            return Err(UnfoldError::WeightMismatch {
                sample: signal.name().to_string(),
                expected: signal.len(),
                found: self.weights.len(),
            });
        }
        ensure_finite(&self.weights, &self.origin)?;
        info!(origin = %self.origin, iteration = self.iteration, "using stored weights, training skipped");
        Ok(IterationHistory::from_stored(signal.name(), self.iteration, self.weights.clone()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use approx::assert_relative_eq;

    use super::*;
    use crate::background::BackgroundMode;
    use crate::classifier::TrainingOutcome;
    use crate::data::Sample;

    /// Predicts the same class-1 probability for every row.
    pub(crate) struct Constant(pub(crate) f64);

    impl Predictor for Constant {
        fn predict_proba(&self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>> {
            Ok(vec![vec![1.0 - self.0, self.0]; features.n_rows()])
        }
    }

    /// Trainer whose last model predicts `last` and whose best checkpoint
    /// predicts `best`. Fails on the `fail_on`-th call when set.
    pub(crate) struct Scripted {
        pub(crate) last: f64,
        pub(crate) best: f64,
        pub(crate) converged: bool,
        pub(crate) fail_on: Option<usize>,
        pub(crate) calls: Arc<AtomicUsize>,
    }

    impl Scripted {
        pub(crate) fn constant(p: f64) -> Self {
            Self { last: p, best: p, converged: true, fail_on: None, calls: Arc::default() }
        }
    }

    impl Classifier for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn train(
            &self,
            _features: &FeatureMatrix,
            _labels: &[usize],
            _weights: &[f64],
            _options: &TrainOptions,
        ) -> Result<TrainingOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(call) {
                return Err(UnfoldError::Training("scripted failure".into()));
            }
            Ok(TrainingOutcome {
                last: Box::new(Constant(self.last)),
                best: Some(Box::new(Constant(self.best))),
                report: TrainingReport {
                    converged: self.converged,
                    epochs: 3,
                    best_epoch: 1,
                    best_validation_loss: Some(0.69),
                    restored_best: false,
                },
            })
        }
    }

    pub(crate) fn store(n_obs: usize, n_sig: usize) -> EventStore {
        let column = |n: usize| (0..n).map(|i| i as f64 / n as f64).collect::<Vec<_>>();
        let observed =
            Sample::from_columns("data", [("x_reco".to_string(), column(n_obs))], None, None)
                .unwrap();
        let mut valid = vec![true; n_sig];
        valid[0] = false;
        let signal = Sample::from_columns(
            "signal",
            [("x_reco".to_string(), column(n_sig)), ("x_truth".to_string(), column(n_sig))],
            Some(vec![2.0; n_sig]),
            Some(valid),
        )
        .unwrap();
        EventStore::new(observed, signal, None, vec!["x_reco".into()], vec!["x_truth".into()])
            .unwrap()
    }

    fn config(iterations: usize) -> UnfoldConfig {
        UnfoldConfig::default().with_iterations(iterations)
    }

    #[test]
    fn test_multipliers_compound_over_iterations() {
        let engine = OmniFold::new(config(2), Box::new(Scripted::constant(0.6))).unwrap();
        let history = engine.unfold(&store(5, 4)).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.weights(0).unwrap(), &[2.0; 4]);
        let first = history.get(1).unwrap();
        let pushed = first.pushed_weights.as_ref().unwrap();
        // Event 0 fails the detector selection and keeps its prior in step 1.
        assert_eq!(pushed[0], 2.0);
        assert_relative_eq!(pushed[1], 3.0, epsilon = 1e-12);
        for &w in history.final_weights().unwrap() {
            assert_relative_eq!(w, 2.0 * 1.5 * 1.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_best_checkpoint_is_used_when_not_converged() {
        let trainer = Scripted {
            last: 0.9,
            best: 0.5,
            converged: false,
            fail_on: None,
            calls: Arc::default(),
        };
        let engine = OmniFold::new(config(1), Box::new(trainer)).unwrap();
        let history = engine.unfold(&store(5, 4)).unwrap();
        assert_eq!(history.final_weights().unwrap(), &[2.0; 4]);
        let step1 = history.final_record().unwrap().step1.as_ref().unwrap();
        assert!(step1.training.restored_best);
        assert!(!step1.training.converged);
    }

    #[test]
    fn test_trainer_failure_names_iteration_and_step() {
        let trainer = Scripted { fail_on: Some(4), ..Scripted::constant(0.5) };
        let engine = OmniFold::new(config(3), Box::new(trainer)).unwrap();
        match engine.unfold(&store(5, 4)).unwrap_err() {
            UnfoldError::Step { iteration, step, cause } => {
                assert_eq!((iteration, step), (2, 2));
                assert!(matches!(*cause, UnfoldError::Training(_)));
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_saturated_classifier_is_clipped_and_recorded() {
        let engine = OmniFold::new(config(1), Box::new(Scripted::constant(1.0))).unwrap();
        let history = engine.unfold(&store(5, 4)).unwrap();
        let record = history.final_record().unwrap();
        assert_eq!(record.step1.as_ref().unwrap().clipping.clipped_high, 4);
        assert_eq!(record.step2.as_ref().unwrap().clipping.clipped_high, 4);
        assert!(record.truth_weights.iter().all(|w| w.is_finite() && *w > 0.0));
    }

    #[test]
    fn test_multiclass_uses_three_labels() {
        /// Even odds over `n` classes.
        struct Even(usize);
        impl Predictor for Even {
            fn predict_proba(&self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>> {
                Ok(vec![vec![1.0 / self.0 as f64; self.0]; features.n_rows()])
            }
        }
        struct CheckClasses;
        impl Classifier for CheckClasses {
            fn name(&self) -> &str {
                "check"
            }
            fn train(
                &self,
                _features: &FeatureMatrix,
                labels: &[usize],
                _weights: &[f64],
                options: &TrainOptions,
            ) -> Result<TrainingOutcome> {
                assert!(labels.iter().all(|&l| l < options.n_classes));
                Ok(TrainingOutcome {
                    last: Box::new(Even(options.n_classes)),
                    best: None,
                    report: TrainingReport { converged: true, ..TrainingReport::default() },
                })
            }
        }
        let config = config(1).with_background_mode(BackgroundMode::MultiClass);
        let engine = OmniFold::new(config, Box::new(CheckClasses)).unwrap();
        assert!(engine.unfold(&store(5, 4)).is_ok());
    }

    /// Records the warm start handed to each training. The model of call `n`
    /// reports `[n]` as its parameters.
    #[derive(Default)]
    struct WarmRecorder {
        seen: Arc<Mutex<Vec<Option<Vec<f64>>>>>,
    }

    struct Numbered(f64);

    impl Predictor for Numbered {
        fn predict_proba(&self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>> {
            Ok(vec![vec![0.5, 0.5]; features.n_rows()])
        }

        fn parameters(&self) -> Option<Vec<f64>> {
            Some(vec![self.0])
        }
    }

    impl Classifier for WarmRecorder {
        fn name(&self) -> &str {
            "warm"
        }

        fn train(
            &self,
            _features: &FeatureMatrix,
            _labels: &[usize],
            _weights: &[f64],
            options: &TrainOptions,
        ) -> Result<TrainingOutcome> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(options.initial_parameters.clone());
            Ok(TrainingOutcome {
                last: Box::new(Numbered(seen.len() as f64)),
                best: None,
                report: TrainingReport { converged: true, ..TrainingReport::default() },
            })
        }
    }

    #[test]
    fn test_each_step_starts_from_previous_iteration_fit() {
        let recorder = WarmRecorder::default();
        let seen = Arc::clone(&recorder.seen);
        let engine = OmniFold::new(config(3), Box::new(recorder)).unwrap();
        engine.unfold(&store(5, 4)).unwrap();
        // Calls alternate step 1, step 2; call n + 2 starts from call n.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, None, Some(vec![1.0]), Some(vec![2.0]), Some(vec![3.0]), Some(vec![4.0])]
        );

        let recorder = WarmRecorder::default();
        let seen = Arc::clone(&recorder.seen);
        let engine =
            OmniFold::new(config(3).with_warm_start(false), Box::new(recorder)).unwrap();
        engine.unfold(&store(5, 4)).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 6);
        assert!(seen.lock().unwrap().iter().all(Option::is_none));
    }

    #[test]
    fn test_wrong_class_count_is_a_training_error() {
        struct OneColumn;
        impl Predictor for OneColumn {
            fn predict_proba(&self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>> {
                Ok(vec![vec![0.5]; features.n_rows()])
            }
        }
        struct Narrow;
        impl Classifier for Narrow {
            fn name(&self) -> &str {
                "narrow"
            }
            fn train(
                &self,
                _features: &FeatureMatrix,
                _labels: &[usize],
                _weights: &[f64],
                _options: &TrainOptions,
            ) -> Result<TrainingOutcome> {
                Ok(TrainingOutcome {
                    last: Box::new(OneColumn),
                    best: None,
                    report: TrainingReport { converged: true, ..TrainingReport::default() },
                })
            }
        }
        let engine = OmniFold::new(config(1), Box::new(Narrow)).unwrap();
        match engine.unfold(&store(5, 4)).unwrap_err() {
            UnfoldError::Step { iteration, step, cause } => {
                assert_eq!((iteration, step), (1, 1));
                assert!(matches!(*cause, UnfoldError::Training(_)));
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let result = OmniFold::new(config(0), Box::new(Scripted::constant(0.5)));
        assert!(matches!(result, Err(UnfoldError::Precondition(_))));
        let unknown = OmniFold::from_registry(
            config(1).with_model_name("dense_3hl"),
            &ClassifierRegistry::standard(),
        );
        assert!(matches!(unknown, Err(UnfoldError::Unknown { kind: "classifier", .. })));
    }

    #[test]
    fn test_stored_weights_must_match_signal_length() {
        let store = store(5, 4);
        let ok = StoredWeights::new(vec![0.5, 1.0, 1.5, 2.0], 4, "memory");
        let history = ok.provide(&store).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.final_weights().unwrap(), &[0.5, 1.0, 1.5, 2.0]);
        assert_eq!(history.weights(4).unwrap(), &[0.5, 1.0, 1.5, 2.0]);
        assert!(history.weights(0).is_err());
        let short = StoredWeights::new(vec![1.0; 3], 4, "memory");
        assert!(matches!(
            short.provide(&store).unwrap_err(),
            UnfoldError::WeightMismatch { expected: 4, found: 3, .. }
        ));
    }
}
