//! Event samples, feature matrices and the read-only event store.
//!
//! Feature columns are immutable once a [`Sample`] is built. Bootstrap trials
//! never copy them: a [`SampleView`] carries an optional row-index vector and
//! gathers rows from the shared base sample on demand.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rand::{distributions::Uniform, Rng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UnfoldError};

/// Read access to a loaded dataset, independent of its file format.
pub trait DataHandler {
    /// Number of events.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a variable with this name can be read.
    fn contains(&self, variable: &str) -> bool;

    /// Values of one variable, one entry per event.
    fn get_variable(&self, variable: &str) -> Result<Vec<f64>>;
}

/// An ordered set of events with named numeric columns, a nominal weight and
/// a detector-level validity flag per event.
#[derive(Debug, Clone)]
pub struct Sample {
    name: String,
    n_events: usize,
    columns: HashMap<String, Vec<f64>>,
    weights: Vec<f64>,
    valid: Vec<bool>,
}

impl Sample {
    /// Build a sample from materialized columns.
    ///
    /// Missing weights default to 1, missing validity flags default to `true`.
    pub fn from_columns(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = (String, Vec<f64>)>,
        weights: Option<Vec<f64>>,
        valid: Option<Vec<bool>>,
    ) -> Result<Self> {
        let name = name.into();
        let mut n_events: Option<usize> = weights.as_ref().map(Vec::len);
        let mut map = HashMap::new();
        for (col_name, col) in columns {
            match n_events {
                Some(n) if n != col.len() => {
                    return Err(UnfoldError::Precondition(format!(
                        "sample '{name}': column '{col_name}' has {} entries, expected {n}",
                        col.len()
                    )));
                }
                Some(_) => {}
                None => n_events = Some(col.len()),
            }
            map.insert(col_name, col);
        }
        let n_events = n_events.or(valid.as_ref().map(Vec::len)).unwrap_or(0);

        let weights = weights.unwrap_or_else(|| vec![1.0; n_events]);
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(UnfoldError::NonFinite(format!("nominal weights of sample '{name}'")));
        }
        let valid = valid.unwrap_or_else(|| vec![true; n_events]);
        if valid.len() != n_events {
            return Err(UnfoldError::Precondition(format!(
                "sample '{name}': {} validity flags for {n_events} events",
                valid.len()
            )));
        }

        Ok(Self { name, n_events, columns: map, weights, valid })
    }

    /// Read the listed variables from a [`DataHandler`].
    ///
    /// A validity column is interpreted as "non-zero means the event passed".
    pub fn from_handler<H: DataHandler + ?Sized>(
        name: impl Into<String>,
        handler: &H,
        variables: &[String],
        weight_name: Option<&str>,
        validity_name: Option<&str>,
    ) -> Result<Self> {
        let name = name.into();
        let mut columns = Vec::with_capacity(variables.len());
        for variable in variables {
            if !handler.contains(variable) {
                return Err(UnfoldError::MissingVariable {
                    sample: name.clone(),
                    variable: variable.clone(),
                });
            }
            columns.push((variable.clone(), handler.get_variable(variable)?));
        }
        let weights = match weight_name {
            Some(w) if handler.contains(w) => Some(handler.get_variable(w)?),
            Some(w) => {
                return Err(UnfoldError::MissingVariable { sample: name, variable: w.to_string() })
            }
            None => Some(vec![1.0; handler.len()]),
        };
        let valid = match validity_name {
            Some(v) if handler.contains(v) => {
                Some(handler.get_variable(v)?.into_iter().map(|x| x != 0.0).collect())
            }
            Some(v) => {
                return Err(UnfoldError::MissingVariable { sample: name, variable: v.to_string() })
            }
            None => None,
        };
        Self::from_columns(name, columns, weights, valid)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.n_events
    }

    pub fn is_empty(&self) -> bool {
        self.n_events == 0
    }

    /// Nominal (generator) weights.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn valid(&self) -> &[bool] {
        &self.valid
    }

    pub fn column(&self, variable: &str) -> Result<&[f64]> {
        self.columns.get(variable).map(Vec::as_slice).ok_or_else(|| {
            UnfoldError::MissingVariable { sample: self.name.clone(), variable: variable.to_string() }
        })
    }

    /// Column names in sorted order.
    pub fn column_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.columns.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Events of `self` followed by the events of `other`, keeping only the
    /// columns both carry.
    pub fn concat(&self, other: &Sample, name: impl Into<String>) -> Result<Self> {
        let columns = self
            .columns
            .iter()
            .filter_map(|(key, col)| {
                other.columns.get(key).map(|more| {
                    (key.clone(), col.iter().chain(more).copied().collect::<Vec<_>>())
                })
            })
            .collect::<Vec<_>>();
        let weights = self.weights.iter().chain(&other.weights).copied().collect();
        let valid = self.valid.iter().chain(&other.valid).copied().collect();
        Self::from_columns(name, columns, Some(weights), Some(valid))
    }

    /// Fail unless every listed variable is a column of this sample.
    pub fn require(&self, variables: &[String]) -> Result<()> {
        for variable in variables {
            self.column(variable)?;
        }
        Ok(())
    }

    /// Same events and columns with a different nominal weight vector.
    pub fn with_weights(&self, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != self.n_events {
            return Err(UnfoldError::WeightMismatch {
                sample: self.name.clone(),
                expected: self.n_events,
                found: weights.len(),
            });
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(UnfoldError::NonFinite(format!("nominal weights of sample '{}'", self.name)));
        }
        Ok(Self { weights, ..self.clone() })
    }

    /// The whole sample in its original order.
    pub fn view(&self) -> SampleView<'_> {
        SampleView { sample: self, rows: None }
    }

    /// Draw `len()` events with replacement.
    pub fn resample<R: Rng>(&self, rng: &mut R) -> SampleView<'_> {
        let rows = if self.n_events == 0 {
            Vec::new()
        } else {
            let u = Uniform::new(0, self.n_events);
            (0..self.n_events).map(|_| rng.sample(u)).collect()
        };
        SampleView { sample: self, rows: Some(rows) }
    }
}

impl DataHandler for Sample {
    fn len(&self) -> usize {
        self.n_events
    }

    fn contains(&self, variable: &str) -> bool {
        self.columns.contains_key(variable)
    }

    fn get_variable(&self, variable: &str) -> Result<Vec<f64>> {
        self.column(variable).map(<[f64]>::to_vec)
    }
}

/// A sample seen through an optional row selection.
#[derive(Debug, Clone)]
pub struct SampleView<'a> {
    sample: &'a Sample,
    rows: Option<Vec<usize>>,
}

impl<'a> SampleView<'a> {
    pub fn sample(&self) -> &'a Sample {
        self.sample
    }

    pub fn name(&self) -> &str {
        self.sample.name()
    }

    pub fn len(&self) -> usize {
        self.rows.as_ref().map_or(self.sample.len(), Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drawn row indices into the base sample, `None` for the identity view.
    pub fn rows(&self) -> Option<&[usize]> {
        self.rows.as_deref()
    }

    /// Index in the base sample of the `i`-th event of this view.
    pub fn original_index(&self, i: usize) -> usize {
        self.rows.as_ref().map_or(i, |rows| rows[i])
    }

    fn gather<T: Copy>(&self, values: &[T]) -> Vec<T> {
        match &self.rows {
            Some(rows) => rows.iter().map(|&r| values[r]).collect(),
            None => values.to_vec(),
        }
    }

    pub fn weights(&self) -> Vec<f64> {
        self.gather(self.sample.weights())
    }

    pub fn valid(&self) -> Vec<bool> {
        self.gather(self.sample.valid())
    }

    /// Row-major feature matrix of the listed variables.
    pub fn features(&self, variables: &[String]) -> Result<FeatureMatrix> {
        let columns = variables
            .iter()
            .map(|v| self.sample.column(v))
            .collect::<Result<Vec<_>>>()?;
        let n_rows = self.len();
        let mut data = Vec::with_capacity(n_rows * columns.len());
        for i in 0..n_rows {
            let r = self.original_index(i);
            data.extend(columns.iter().map(|col| col[r]));
        }
        FeatureMatrix::new(n_rows, columns.len(), data)
    }
}

/// Dense row-major `f64` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    pub fn new(n_rows: usize, n_cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_rows * n_cols {
            return Err(UnfoldError::Precondition(format!(
                "feature matrix {n_rows}x{n_cols} needs {} values, got {}",
                n_rows * n_cols,
                data.len()
            )));
        }
        Ok(Self { n_rows, n_cols, data })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_cols..(i + 1) * self.n_cols]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> + '_ {
        (0..self.n_rows).map(move |i| self.row(i))
    }

    /// Keep only the listed rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * self.n_cols);
        for &r in rows {
            data.extend_from_slice(self.row(r));
        }
        Self { n_rows: rows.len(), n_cols: self.n_cols, data }
    }

    /// Stack matrices with equal column counts on top of each other.
    pub fn vstack(blocks: &[&FeatureMatrix]) -> Result<Self> {
        let n_cols = blocks.first().map_or(0, |b| b.n_cols);
        if let Some(bad) = blocks.iter().find(|b| b.n_cols != n_cols) {
            return Err(UnfoldError::Precondition(format!(
                "cannot stack a {}-column block onto {n_cols} columns",
                bad.n_cols
            )));
        }
        let n_rows = blocks.iter().map(|b| b.n_rows).sum();
        let mut data = Vec::with_capacity(n_rows * n_cols);
        for b in blocks {
            data.extend_from_slice(&b.data);
        }
        Ok(Self { n_rows, n_cols, data })
    }
}

/// Observed, signal-simulation and optional background-simulation samples,
/// together with the variables that feed each unfolding step.
#[derive(Debug, Clone)]
pub struct EventStore {
    observed: Sample,
    signal: Sample,
    background: Option<Sample>,
    detector_variables: Vec<String>,
    truth_variables: Vec<String>,
}

impl EventStore {
    /// Validate and assemble the store. Every precondition that would make
    /// training meaningless is checked here, before any classifier runs.
    pub fn new(
        observed: Sample,
        signal: Sample,
        background: Option<Sample>,
        detector_variables: Vec<String>,
        truth_variables: Vec<String>,
    ) -> Result<Self> {
        if detector_variables.is_empty() || truth_variables.is_empty() {
            return Err(UnfoldError::Precondition(
                "at least one detector-level and one truth-level variable are required".into(),
            ));
        }
        if detector_variables.len() != truth_variables.len() {
            return Err(UnfoldError::Precondition(format!(
                "{} detector-level variables but {} truth-level variables",
                detector_variables.len(),
                truth_variables.len()
            )));
        }
        observed.require(&detector_variables)?;
        signal.require(&detector_variables)?;
        signal.require(&truth_variables)?;
        if let Some(bkg) = &background {
            bkg.require(&detector_variables)?;
        }
        if observed.is_empty() || signal.is_empty() {
            return Err(UnfoldError::Precondition(
                "observed and signal samples must not be empty".into(),
            ));
        }
        Ok(Self { observed, signal, background, detector_variables, truth_variables })
    }

    pub fn observed(&self) -> &Sample {
        &self.observed
    }

    pub fn signal(&self) -> &Sample {
        &self.signal
    }

    pub fn background(&self) -> Option<&Sample> {
        self.background.as_ref()
    }

    pub fn detector_variables(&self) -> &[String] {
        &self.detector_variables
    }

    pub fn truth_variables(&self) -> &[String] {
        &self.truth_variables
    }
}

/// Column names of one observable at detector and truth level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservableBranches {
    pub branch_det: String,
    pub branch_mc: String,
}

/// Observable name to branch names. Extra keys in the JSON (labels, binning
/// hints) are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservableConfig {
    observables: BTreeMap<String, ObservableBranches>,
}

impl ObservableConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn insert(&mut self, name: impl Into<String>, branch_det: &str, branch_mc: &str) {
        self.observables.insert(
            name.into(),
            ObservableBranches { branch_det: branch_det.into(), branch_mc: branch_mc.into() },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ObservableBranches> {
        self.observables.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.observables.keys().map(String::as_str)
    }

    /// Detector-level and truth-level column names for the listed observables.
    pub fn resolve(&self, names: &[String]) -> Result<(Vec<String>, Vec<String>)> {
        let mut det = Vec::with_capacity(names.len());
        let mut mc = Vec::with_capacity(names.len());
        for name in names {
            let branches = self.get(name).ok_or_else(|| UnfoldError::Unknown {
                kind: "observable",
                name: name.clone(),
                expected: self.names().collect::<Vec<_>>().join(", "),
            })?;
            det.push(branches.branch_det.clone());
            mc.push(branches.branch_mc.clone());
        }
        Ok((det, mc))
    }
}
