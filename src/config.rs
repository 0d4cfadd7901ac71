//! Run configuration.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::background::BackgroundMode;
use crate::bootstrap::ErrorMode;
use crate::error::{Result, UnfoldError};
use crate::ratio::DEFAULT_EPSILON;

/// Everything fixed before an unfolding run starts. Missing JSON fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnfoldConfig {
    pub iterations: usize,
    pub background_mode: BackgroundMode,
    pub error_mode: ErrorMode,
    pub nresamples: usize,
    pub seed: u64,
    pub epsilon: f64,
    pub validation_split: f64,
    pub model_name: String,
    pub balance_classes: bool,
    /// Start each training from the previous iteration's fit of the same step.
    pub warm_start: bool,
}

impl Default for UnfoldConfig {
    fn default() -> Self {
        Self {
            iterations: 4,
            background_mode: BackgroundMode::Default,
            error_mode: ErrorMode::Sumw2,
            nresamples: 25,
            seed: 0,
            epsilon: DEFAULT_EPSILON,
            validation_split: 0.2,
            model_name: "logistic".to_string(),
            balance_classes: true,
            warm_start: true,
        }
    }
}

impl UnfoldConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(UnfoldError::Precondition("iterations must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(UnfoldError::Precondition(format!(
                "validation split {} is outside [0, 1)",
                self.validation_split
            )));
        }
        if !(self.epsilon > 0.0 && self.epsilon < 0.5) {
            return Err(UnfoldError::Precondition(format!(
                "epsilon {} is outside (0, 0.5)",
                self.epsilon
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    #[must_use]
    pub fn with_background_mode(mut self, mode: BackgroundMode) -> Self {
        self.background_mode = mode;
        self
    }

    #[must_use]
    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    #[must_use]
    pub fn with_nresamples(mut self, nresamples: usize) -> Self {
        self.nresamples = nresamples;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_validation_split(mut self, split: f64) -> Self {
        self.validation_split = split;
        self
    }

    #[must_use]
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    #[must_use]
    pub fn with_balance_classes(mut self, balance: bool) -> Self {
        self.balance_classes = balance;
        self
    }

    #[must_use]
    pub fn with_warm_start(mut self, warm_start: bool) -> Self {
        self.warm_start = warm_start;
        self
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }
}
