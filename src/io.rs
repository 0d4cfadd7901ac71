//! CSV input and output through polars.

use std::fs::File;
use std::path::{Path, PathBuf};

use polars::prelude::*;

use crate::data::{DataHandler, Sample};
use crate::error::{Result, UnfoldError};
use crate::history::IterationHistory;

/// A [`DataHandler`] over an in-memory polars frame.
#[derive(Debug, Clone)]
pub struct FrameHandler {
    frame: DataFrame,
}

impl FrameHandler {
    pub fn new(frame: DataFrame) -> Self {
        Self { frame }
    }

    pub fn from_csv(path: &Path) -> Result<Self> {
        let frame = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?;
        Ok(Self { frame })
    }

    /// Read several files with the same columns as one sample.
    pub fn from_csv_files(paths: &[PathBuf]) -> Result<Self> {
        let (first, rest) = paths
            .split_first()
            .ok_or_else(|| UnfoldError::Precondition("no input files given".into()))?;
        let mut handler = Self::from_csv(first)?;
        for path in rest {
            let next = Self::from_csv(path)?;
            handler.frame.vstack_mut(&next.frame)?;
        }
        handler.frame.align_chunks();
        Ok(handler)
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }
}

impl DataHandler for FrameHandler {
    fn len(&self) -> usize {
        self.frame.height()
    }

    fn contains(&self, variable: &str) -> bool {
        self.frame.get_column_names().iter().any(|c| *c == variable)
    }

    fn get_variable(&self, variable: &str) -> Result<Vec<f64>> {
        let series = self.frame.column(variable)?.cast(&DataType::Float64)?;
        if series.null_count() > 0 {
            return Err(UnfoldError::Precondition(format!(
                "column '{variable}' has {} missing values",
                series.null_count()
            )));
        }
        Ok(series.f64()?.into_no_null_iter().collect())
    }
}

fn write_frame(path: &Path, mut frame: DataFrame) -> Result<()> {
    let file = File::create(path)?;
    CsvWriter::new(file).include_header(true).finish(&mut frame)?;
    Ok(())
}

/// Write named weight columns, one row per event.
pub fn write_weights_csv(path: &Path, columns: &[(String, Vec<f64>)]) -> Result<()> {
    let series = columns
        .iter()
        .map(|(name, values)| Series::new(name, values.as_slice()))
        .collect::<Vec<_>>();
    write_frame(path, DataFrame::new(series)?)
}

/// One `iteration_<k>` column per record of `history`.
pub fn write_history_csv(path: &Path, history: &IterationHistory) -> Result<()> {
    let columns = history
        .records()
        .iter()
        .map(|r| (format!("iteration_{}", r.iteration), r.truth_weights.clone()))
        .collect::<Vec<_>>();
    write_weights_csv(path, &columns)
}

/// Read one weight column, the last one when `column` is `None`. Returns the
/// column name with the values.
pub fn read_weights_csv(path: &Path, column: Option<&str>) -> Result<(String, Vec<f64>)> {
    let handler = FrameHandler::from_csv(path)?;
    let name = match column {
        Some(name) => name.to_string(),
        None => handler
            .frame()
            .get_column_names()
            .last()
            .map(|c| c.to_string())
            .ok_or_else(|| {
                UnfoldError::Precondition(format!("{} has no columns", path.display()))
            })?,
    };
    if !handler.contains(&name) {
        return Err(UnfoldError::MissingVariable {
            sample: path.display().to_string(),
            variable: name,
        });
    }
    let values = handler.get_variable(&name)?;
    Ok((name, values))
}

/// Write every column of `sample` plus its weights and validity flags.
pub fn write_sample_csv(
    path: &Path,
    sample: &Sample,
    weight_name: &str,
    validity_name: &str,
) -> Result<()> {
    let mut series = Vec::new();
    for name in sample.column_names() {
        series.push(Series::new(name, sample.column(name)?));
    }
    series.push(Series::new(weight_name, sample.weights()));
    let flags: Vec<i32> = sample.valid().iter().map(|&v| i32::from(v)).collect();
    series.push(Series::new(validity_name, flags));
    write_frame(path, DataFrame::new(series)?)
}
