//! Per-iteration weight history of the signal simulation.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::classifier::TrainingReport;
use crate::error::{Result, UnfoldError};
use crate::ratio::ClipStats;

/// What one training step reported back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDiagnostics {
    pub training: TrainingReport,
    pub clipping: ClipStats,
}

/// Snapshot at the end of one iteration. Iteration 0 carries the generator
/// weights and no diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub truth_weights: Vec<f64>,
    /// Detector-level weights after step 1.
    pub pushed_weights: Option<Vec<f64>>,
    pub step1: Option<StepDiagnostics>,
    pub step2: Option<StepDiagnostics>,
}

impl IterationRecord {
    pub fn initial(truth_weights: Vec<f64>) -> Self {
        Self { iteration: 0, truth_weights, pushed_weights: None, step1: None, step2: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySource {
    Unfolded,
    Stored,
}

/// Ordered iteration records of one sample. Every record has one weight per
/// event of that sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationHistory {
    sample: String,
    source: HistorySource,
    n_events: usize,
    records: Vec<IterationRecord>,
}

impl IterationHistory {
    /// History seeded with the generator weights as iteration 0.
    pub(crate) fn start(sample: impl Into<String>, generator_weights: Vec<f64>) -> Self {
        Self {
            sample: sample.into(),
            source: HistorySource::Unfolded,
            n_events: generator_weights.len(),
            records: vec![IterationRecord::initial(generator_weights)],
        }
    }

    /// A single record holding externally supplied final weights.
    pub fn from_stored(sample: impl Into<String>, iteration: usize, weights: Vec<f64>) -> Self {
        Self {
            sample: sample.into(),
            source: HistorySource::Stored,
            n_events: weights.len(),
            records: vec![IterationRecord {
                iteration,
                truth_weights: weights,
                pushed_weights: None,
                step1: None,
                step2: None,
            }],
        }
    }

    /// Append the next iteration. Records are immutable once pushed.
    pub(crate) fn push(&mut self, record: IterationRecord) -> Result<()> {
        let expected = self.records.last().map_or(0, |r| r.iteration + 1);
        if record.iteration != expected {
            return Err(UnfoldError::Precondition(format!(
                "history of '{}' expects iteration {expected}, got {}",
                self.sample, record.iteration
            )));
        }
        let lengths = std::iter::once(record.truth_weights.len())
            .chain(record.pushed_weights.as_ref().map(Vec::len));
        for found in lengths {
            if found != self.n_events {
                return Err(UnfoldError::WeightMismatch {
                    sample: self.sample.clone(),
                    expected: self.n_events,
                    found,
                });
            }
        }
        self.records.push(record);
        Ok(())
    }

    pub fn sample(&self) -> &str {
        &self.sample
    }

    pub fn source(&self) -> HistorySource {
        self.source
    }

    pub fn n_events(&self) -> usize {
        self.n_events
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    /// The record of iteration `iteration`. A stored history only answers for
    /// the iteration its weights were saved at.
    pub fn get(&self, iteration: usize) -> Result<&IterationRecord> {
        self.records
            .iter()
            .find(|r| r.iteration == iteration)
            .ok_or(UnfoldError::IterationOutOfRange { index: iteration, len: self.records.len() })
    }

    /// Recorded iteration indices, in order.
    pub fn iterations(&self) -> impl Iterator<Item = usize> + '_ {
        self.records.iter().map(|r| r.iteration)
    }

    /// Truth-level weights after iteration `iteration`.
    pub fn weights(&self, iteration: usize) -> Result<&[f64]> {
        self.get(iteration).map(|r| r.truth_weights.as_slice())
    }

    pub fn final_record(&self) -> Result<&IterationRecord> {
        self.records
            .last()
            .ok_or(UnfoldError::IterationOutOfRange { index: 0, len: 0 })
    }

    /// The unfolded result.
    pub fn final_weights(&self) -> Result<&[f64]> {
        self.final_record().map(|r| r.truth_weights.as_slice())
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let history: Self = serde_json::from_reader(reader)?;
        if let Some(bad) = history.records.iter().find(|r| r.truth_weights.len() != history.n_events)
        {
            return Err(UnfoldError::WeightMismatch {
                sample: history.sample.clone(),
                expected: history.n_events,
                found: bad.truth_weights.len(),
            });
        }
        Ok(history)
    }
}
