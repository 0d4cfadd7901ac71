//! Bootstrap estimate of the statistical spread of the unfolded weights.
//!
//! Every trial reruns the whole iteration sequence on resampled views of the
//! event store. Trials share the immutable base columns and nothing else, so
//! they run in parallel on the rayon pool.

use std::fmt;
use std::str::FromStr;

use indicatif::{ParallelProgressIterator, ProgressBar};
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::EventStore;
use crate::engine::OmniFold;
use crate::error::{Result, UnfoldError};
use crate::history::IterationHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// No resampling; the nominal weights alone.
    #[default]
    Sumw2,
    /// Resample observed data and every simulation sample.
    BootstrapFull,
    /// Resample the simulation samples, keep observed data fixed.
    BootstrapModel,
}

impl ErrorMode {
    pub const NAMES: [&'static str; 3] = ["sumw2", "bootstrap_full", "bootstrap_model"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorMode::Sumw2 => "sumw2",
            ErrorMode::BootstrapFull => "bootstrap_full",
            ErrorMode::BootstrapModel => "bootstrap_model",
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        !matches!(self, ErrorMode::Sumw2)
    }
}

impl fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorMode {
    type Err = UnfoldError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sumw2" => Ok(ErrorMode::Sumw2),
            "bootstrap_full" => Ok(ErrorMode::BootstrapFull),
            "bootstrap_model" => Ok(ErrorMode::BootstrapModel),
            other => Err(UnfoldError::Unknown {
                kind: "error mode",
                name: other.to_string(),
                expected: Self::NAMES.join(", "),
            }),
        }
    }
}

/// One run of the iteration sequence: the nominal run or a bootstrap trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMember {
    /// `None` for the nominal run.
    pub trial: Option<usize>,
    pub seed: u64,
    /// Signal events drawn for this trial, as indices into the base sample.
    pub signal_rows: Option<Vec<usize>>,
    pub history: IterationHistory,
}

impl EnsembleMember {
    pub fn nominal(seed: u64, history: IterationHistory) -> Self {
        Self { trial: None, seed, signal_rows: None, history }
    }

    /// Truth weights of `iteration` summed onto the original signal events.
    /// Events never drawn get zero weight.
    pub fn folded_weights(&self, iteration: usize) -> Result<Vec<f64>> {
        let weights = self.history.weights(iteration)?;
        match &self.signal_rows {
            None => Ok(weights.to_vec()),
            Some(rows) => {
                let mut folded = vec![0.0; rows.len()];
                for (&row, &w) in rows.iter().zip(weights) {
                    folded[row] += w;
                }
                Ok(folded)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub trial: usize,
    pub seed: u64,
    pub message: String,
}

/// The nominal run plus every successful trial, in trial order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ensemble {
    pub mode: ErrorMode,
    pub nominal: EnsembleMember,
    pub trials: Vec<EnsembleMember>,
    pub failures: Vec<TrialFailure>,
}

impl Ensemble {
    /// Members including the nominal run.
    pub fn len(&self) -> usize {
        1 + self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn members(&self) -> impl Iterator<Item = &EnsembleMember> {
        std::iter::once(&self.nominal).chain(&self.trials)
    }

    /// Some trials failed.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Folded weights of `iteration` for every trial, or of the nominal run
    /// when no trials were run. Fails when every requested trial failed.
    pub fn per_iteration(&self, iteration: usize) -> Result<Vec<Vec<f64>>> {
        if self.trials.is_empty() {
            if !self.failures.is_empty() {
                return Err(UnfoldError::BootstrapFailed { failed: self.failures.len() });
            }
            return Ok(vec![self.nominal.folded_weights(iteration)?]);
        }
        self.trials.iter().map(|m| m.folded_weights(iteration)).collect()
    }
}

pub struct UncertaintyEstimator<'a> {
    engine: &'a OmniFold,
    mode: ErrorMode,
    nresamples: usize,
    seed: u64,
    show_progress: bool,
}

impl<'a> UncertaintyEstimator<'a> {
    /// Mode, trial count and seed are taken from the engine's configuration.
    pub fn new(engine: &'a OmniFold) -> Self {
        let config = engine.config();
        Self {
            engine,
            mode: config.error_mode,
            nresamples: config.nresamples,
            seed: config.seed,
            show_progress: false,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ErrorMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_nresamples(mut self, nresamples: usize) -> Self {
        self.nresamples = nresamples;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Seed of trial `index`. The nominal run uses the base seed itself.
    pub fn trial_seed(&self, index: usize) -> u64 {
        self.seed.wrapping_add(1 + index as u64)
    }

    /// Run the trials around an already computed nominal history.
    pub fn estimate(&self, store: &EventStore, nominal: IterationHistory) -> Result<Ensemble> {
        let n_signal = store.signal().len();
        if nominal.n_events() != n_signal {
            return Err(UnfoldError::WeightMismatch {
                sample: store.signal().name().to_string(),
                expected: n_signal,
                found: nominal.n_events(),
            });
        }
        let nominal = EnsembleMember::nominal(self.seed, nominal);
        let n = if self.mode.is_bootstrap() { self.nresamples } else { 0 };
        if n == 0 {
            info!(mode = %self.mode, "no resampling, nominal weights only");
            return Ok(Ensemble { mode: self.mode, nominal, trials: Vec::new(), failures: Vec::new() });
        }

        info!(mode = %self.mode, trials = n, "running bootstrap");
        let bar = if self.show_progress { ProgressBar::new(n as u64) } else { ProgressBar::hidden() };
        let results: Vec<std::result::Result<EnsembleMember, TrialFailure>> = (0..n)
            .into_par_iter()
            .progress_with(bar)
            .map(|trial| self.trial(store, trial))
            .collect();

        let mut trials = Vec::with_capacity(n);
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(member) => trials.push(member),
                Err(failure) => failures.push(failure),
            }
        }
        if !failures.is_empty() {
            for f in &failures {
                warn!(trial = f.trial, seed = f.seed, error = %f.message, "bootstrap trial failed");
            }
            if trials.is_empty() {
                warn!(failed = failures.len(), "every bootstrap trial failed, no spread available");
            } else {
                warn!(succeeded = trials.len(), failed = failures.len(), "partial bootstrap ensemble");
            }
        }
        Ok(Ensemble { mode: self.mode, nominal, trials, failures })
    }

    fn trial(
        &self,
        store: &EventStore,
        trial: usize,
    ) -> std::result::Result<EnsembleMember, TrialFailure> {
        let seed = self.trial_seed(trial);
        let mut rng = StdRng::seed_from_u64(seed);
        let observed = match self.mode {
            ErrorMode::BootstrapFull => store.observed().resample(&mut rng),
            _ => store.observed().view(),
        };
        let signal = store.signal().resample(&mut rng);
        let background = store.background().map(|b| b.resample(&mut rng));

        self.engine
            .run(store, &observed, &signal, background.as_ref(), seed)
            .map(|history| EnsembleMember {
                trial: Some(trial),
                seed,
                signal_rows: signal.rows().map(<[usize]>::to_vec),
                history,
            })
            .map_err(|e| TrialFailure { trial, seed, message: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::classifier::{Classifier, TrainOptions, TrainingOutcome, TrainingReport};
    use crate::config::UnfoldConfig;
    use crate::data::FeatureMatrix;
    use crate::engine::tests::{store, Constant, Scripted};
    use crate::engine::WeightProvider;

    /// Keeps the detector feature of every label-1 row of each step-1
    /// training, which in the default mode are the observed events.
    #[derive(Default)]
    struct ObservedRecorder {
        seen: Arc<Mutex<Vec<Vec<f64>>>>,
    }

    impl Classifier for ObservedRecorder {
        fn name(&self) -> &str {
            "observed_recorder"
        }

        fn train(
            &self,
            features: &FeatureMatrix,
            labels: &[usize],
            _weights: &[f64],
            _options: &TrainOptions,
        ) -> crate::error::Result<TrainingOutcome> {
            // Step 2 trains on twice the five signal events.
            if features.n_rows() > 10 {
                let observed = (0..features.n_rows())
                    .filter(|&i| labels[i] == 1)
                    .map(|i| features.row(i)[0])
                    .collect();
                self.seen.lock().unwrap().push(observed);
            }
            Ok(TrainingOutcome {
                last: Box::new(Constant(0.5)),
                best: None,
                report: TrainingReport { converged: true, ..TrainingReport::default() },
            })
        }
    }

    fn observed_per_trial(mode: ErrorMode) -> Vec<Vec<f64>> {
        let store = store(20, 5);
        let recorder = ObservedRecorder::default();
        let seen = Arc::clone(&recorder.seen);
        let config = UnfoldConfig::default()
            .with_iterations(1)
            .with_error_mode(mode)
            .with_nresamples(4)
            .with_balance_classes(false);
        let engine = OmniFold::new(config, Box::new(recorder)).unwrap();
        let nominal = IterationHistory::from_stored("signal", 1, vec![1.0; 5]);
        let ensemble = UncertaintyEstimator::new(&engine).estimate(&store, nominal).unwrap();
        assert_eq!(ensemble.trials.len(), 4);
        let seen = seen.lock().unwrap().clone();
        seen
    }

    fn base_observed() -> Vec<f64> {
        (0..20).map(|i| i as f64 / 20.0).collect()
    }

    fn engine(config: UnfoldConfig) -> OmniFold {
        OmniFold::new(config, Box::new(Scripted::constant(0.5))).unwrap()
    }

    #[test]
    fn test_mode_names_round_trip() {
        for name in ErrorMode::NAMES {
            assert_eq!(name.parse::<ErrorMode>().unwrap().as_str(), name);
        }
        assert!("jackknife".parse::<ErrorMode>().is_err());
    }

    #[test]
    fn test_zero_resamples_is_passthrough() {
        let store = store(6, 5);
        let engine = engine(
            UnfoldConfig::default()
                .with_iterations(1)
                .with_error_mode(ErrorMode::BootstrapFull)
                .with_nresamples(0),
        );
        let nominal = engine.provide(&store).unwrap();
        let ensemble = UncertaintyEstimator::new(&engine).estimate(&store, nominal.clone()).unwrap();
        assert_eq!(ensemble.len(), 1);
        assert_eq!(ensemble.members().next().unwrap().history, nominal);
        assert_eq!(ensemble.per_iteration(1).unwrap(), vec![nominal.weights(1).unwrap().to_vec()]);
    }

    #[test]
    fn test_sumw2_ignores_nresamples() {
        let store = store(6, 5);
        let engine = engine(UnfoldConfig::default().with_iterations(1).with_nresamples(10));
        let nominal = engine.provide(&store).unwrap();
        let ensemble = UncertaintyEstimator::new(&engine).estimate(&store, nominal).unwrap();
        assert!(ensemble.trials.is_empty());
    }

    #[test]
    fn test_trials_carry_seeds_and_fold_back() {
        let store = store(6, 5);
        let config = UnfoldConfig::default()
            .with_iterations(1)
            .with_error_mode(ErrorMode::BootstrapModel)
            .with_nresamples(3)
            .with_seed(10);
        let engine = engine(config);
        let nominal = engine.provide(&store).unwrap();
        let ensemble = UncertaintyEstimator::new(&engine).estimate(&store, nominal).unwrap();
        assert_eq!(ensemble.len(), 4);
        assert!(!ensemble.is_partial());
        let seeds: Vec<u64> = ensemble.trials.iter().map(|m| m.seed).collect();
        assert_eq!(seeds, vec![11, 12, 13]);
        for member in &ensemble.trials {
            // A p = 0.5 classifier leaves every weight at 2, so each original
            // event carries 2 per draw.
            let folded = member.folded_weights(1).unwrap();
            let rows = member.signal_rows.as_ref().unwrap();
            for (event, &w) in folded.iter().enumerate() {
                let draws = rows.iter().filter(|&&r| r == event).count();
                assert_eq!(w, 2.0 * draws as f64);
            }
        }
    }

    #[test]
    fn test_failed_trials_are_collected() {
        let store = store(6, 5);
        let trainer = Scripted { fail_on: Some(1), ..Scripted::constant(0.5) };
        let config = UnfoldConfig::default()
            .with_iterations(1)
            .with_error_mode(ErrorMode::BootstrapFull)
            .with_nresamples(2);
        let engine = OmniFold::new(config, Box::new(trainer)).unwrap();
        let nominal = IterationHistory::from_stored("signal", 1, vec![1.0; 5]);
        let ensemble = UncertaintyEstimator::new(&engine).estimate(&store, nominal).unwrap();
        // Exactly one training call fails, whichever trial made it.
        assert_eq!(ensemble.failures.len(), 1);
        assert_eq!(ensemble.trials.len(), 1);
        assert!(ensemble.is_partial());
        assert!(ensemble.failures[0].message.contains("scripted failure"));
    }

    #[test]
    fn test_model_bootstrap_keeps_observed_fixed() {
        let seen = observed_per_trial(ErrorMode::BootstrapModel);
        assert_eq!(seen.len(), 4);
        for observed in seen {
            assert_eq!(observed, base_observed());
        }
    }

    #[test]
    fn test_full_bootstrap_resamples_observed() {
        let seen = observed_per_trial(ErrorMode::BootstrapFull);
        assert_eq!(seen.len(), 4);
        let base = base_observed();
        for observed in &seen {
            assert_eq!(observed.len(), base.len());
            assert!(observed.iter().all(|x| base.contains(x)));
        }
        assert!(seen.iter().any(|observed| *observed != base));
    }

    #[test]
    fn test_all_failed_trials_are_not_a_passthrough() {
        let store = store(6, 5);
        struct Failing;
        impl Classifier for Failing {
            fn name(&self) -> &str {
                "failing"
            }
            fn train(
                &self,
                _features: &FeatureMatrix,
                _labels: &[usize],
                _weights: &[f64],
                _options: &TrainOptions,
            ) -> crate::error::Result<TrainingOutcome> {
                Err(UnfoldError::Training("always fails".into()))
            }
        }
        let config = UnfoldConfig::default()
            .with_iterations(1)
            .with_error_mode(ErrorMode::BootstrapFull)
            .with_nresamples(3);
        let engine = OmniFold::new(config, Box::new(Failing)).unwrap();
        let nominal = IterationHistory::from_stored("signal", 1, vec![1.0; 5]);
        let ensemble = UncertaintyEstimator::new(&engine).estimate(&store, nominal).unwrap();
        assert!(ensemble.trials.is_empty());
        assert_eq!(ensemble.failures.len(), 3);
        assert!(matches!(
            ensemble.per_iteration(1).unwrap_err(),
            UnfoldError::BootstrapFailed { failed: 3 }
        ));
    }

    #[test]
    fn test_nominal_length_is_checked() {
        let store = store(6, 5);
        let engine = engine(UnfoldConfig::default());
        let nominal = IterationHistory::from_stored("signal", 0, vec![1.0; 4]);
        assert!(UncertaintyEstimator::new(&engine).estimate(&store, nominal).is_err());
    }
}
