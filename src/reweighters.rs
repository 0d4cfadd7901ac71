//! Named stress-test reweightings of an input spectrum.
//!
//! A strategy is a pure function of a fixed tuple of truth-level observables.
//! Applying it multiplies each event weight of a sample whose truth is known
//! by the function evaluated on that event.

use std::collections::BTreeMap;

use tracing::info;

use crate::data::{ObservableConfig, Sample};
use crate::error::{Result, UnfoldError};

#[derive(Clone, Copy)]
pub struct Reweighter {
    /// Observable names, in the order `func` takes its arguments.
    pub observables: &'static [&'static str],
    pub func: fn(&[f64]) -> f64,
}

fn gaussian_factor(x: f64, k: f64, mean: f64, sigma: f64) -> f64 {
    1.0 + k * (-((x - mean) / sigma).powi(2)).exp()
}

#[derive(Clone)]
pub struct ReweighterRegistry {
    strategies: BTreeMap<&'static str, Reweighter>,
}

impl ReweighterRegistry {
    pub fn empty() -> Self {
        Self { strategies: BTreeMap::new() }
    }

    /// Registry holding the built-in strategies.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "linear_th_pt",
            Reweighter { observables: &["th_pt"], func: |v| 1.0 + v[0] / 800.0 },
        );
        registry.register(
            "gaussian_bump",
            Reweighter { observables: &["mtt"], func: |v| gaussian_factor(v[0], 0.5, 800.0, 100.0) },
        );
        registry.register(
            "gaussian_tail",
            Reweighter {
                observables: &["mtt"],
                func: |v| gaussian_factor(v[0], 0.5, 2000.0, 1000.0),
            },
        );
        registry.register(
            "linear_two_dim",
            Reweighter { observables: &["mtt", "ytt"], func: |v| 2.0 + v[0] / 300.0 + 2.0 * v[1] },
        );
        registry.register(
            "linear_2d_small",
            Reweighter {
                observables: &["mtt", "ytt"],
                func: |v| 2.0 + v[0] / 300.0 + v[1] / 700.0,
            },
        );
        registry
    }

    pub fn register(&mut self, name: &'static str, reweighter: Reweighter) {
        self.strategies.insert(name, reweighter);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.strategies.keys().copied()
    }

    pub fn get(&self, name: &str) -> Result<&Reweighter> {
        self.strategies.get(name).ok_or_else(|| UnfoldError::Unknown {
            kind: "reweighter",
            name: name.to_string(),
            expected: self.names().collect::<Vec<_>>().join(", "),
        })
    }

    /// Per-event factors of strategy `name`, read from the truth-level
    /// branches of its observables.
    pub fn factors(
        &self,
        name: &str,
        sample: &Sample,
        observables: &ObservableConfig,
    ) -> Result<Vec<f64>> {
        let reweighter = self.get(name)?;
        let names: Vec<String> = reweighter.observables.iter().map(|s| s.to_string()).collect();
        let (_, truth) = observables.resolve(&names)?;
        let columns = truth.iter().map(|c| sample.column(c)).collect::<Result<Vec<_>>>()?;
        let mut args = vec![0.0; columns.len()];
        Ok((0..sample.len())
            .map(|i| {
                args.iter_mut().zip(&columns).for_each(|(a, col)| *a = col[i]);
                (reweighter.func)(&args)
            })
            .collect())
    }

    /// `sample` with its weights multiplied by the factors of strategy `name`.
    pub fn apply(
        &self,
        name: &str,
        sample: &Sample,
        observables: &ObservableConfig,
    ) -> Result<Sample> {
        let factors = self.factors(name, sample, observables)?;
        info!(strategy = name, sample = sample.name(), "reweighting input spectrum");
        let weights = sample.weights().iter().zip(&factors).map(|(w, f)| w * f).collect();
        sample.with_weights(weights)
    }
}

impl Default for ReweighterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
