//! Seeded Gaussian toy samples for closure tests.
//!
//! Two observables `x` and `y` are drawn at truth level, smeared into reco
//! level and kept with a fixed reconstruction efficiency. Background is flat
//! in reco space.

use rand::{distributions::Uniform, Rng};
use rand_distr::{Distribution, Normal};

use crate::data::{ObservableConfig, Sample};
use crate::error::{Result, UnfoldError};

pub const X_TRUTH: &str = "x_truth";
pub const Y_TRUTH: &str = "y_truth";
pub const X_RECO: &str = "x_reco";
pub const Y_RECO: &str = "y_reco";

#[derive(Debug, Clone)]
pub struct ToyConfig {
    pub sigma: [f64; 2],
    /// Width of the Gaussian detector response.
    pub smearing: f64,
    pub efficiency: f64,
    pub background_range: (f64, f64),
}

impl Default for ToyConfig {
    fn default() -> Self {
        Self { sigma: [1.0, 1.0], smearing: 0.5, efficiency: 0.9, background_range: (-4.0, 4.0) }
    }
}

fn normal(mean: f64, sigma: f64) -> Result<Normal<f64>> {
    Normal::new(mean, sigma).map_err(|e| UnfoldError::Precondition(format!("toy: {e}")))
}

impl ToyConfig {
    fn check(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.efficiency) {
            return Err(UnfoldError::Precondition(format!(
                "toy: efficiency {} is outside [0, 1]",
                self.efficiency
            )));
        }
        if self.background_range.0 >= self.background_range.1 {
            return Err(UnfoldError::Precondition("toy: empty background range".into()));
        }
        Ok(())
    }

    /// `n` unit-weight events with truth centred at `mean`.
    pub fn generate_signal<R: Rng>(
        &self,
        name: &str,
        n: usize,
        mean: [f64; 2],
        rng: &mut R,
    ) -> Result<Sample> {
        self.check()?;
        let truth = [normal(mean[0], self.sigma[0])?, normal(mean[1], self.sigma[1])?];
        let response = normal(0.0, self.smearing)?;
        let mut columns: [Vec<f64>; 4] = Default::default();
        let mut valid = Vec::with_capacity(n);
        for _ in 0..n {
            let x = truth[0].sample(rng);
            let y = truth[1].sample(rng);
            columns[0].push(x);
            columns[1].push(y);
            columns[2].push(x + response.sample(rng));
            columns[3].push(y + response.sample(rng));
            valid.push(rng.gen_bool(self.efficiency));
        }
        let [xt, yt, xr, yr] = columns;
        Sample::from_columns(
            name,
            [
                (X_TRUTH.to_string(), xt),
                (Y_TRUTH.to_string(), yt),
                (X_RECO.to_string(), xr),
                (Y_RECO.to_string(), yr),
            ],
            Some(vec![1.0; n]),
            Some(valid),
        )
    }

    /// `n` events flat in reco space, each carrying `weight`.
    pub fn generate_background<R: Rng>(
        &self,
        name: &str,
        n: usize,
        weight: f64,
        rng: &mut R,
    ) -> Result<Sample> {
        self.check()?;
        let (lo, hi) = self.background_range;
        let u = Uniform::new(lo, hi);
        let xr: Vec<f64> = (0..n).map(|_| rng.sample(u)).collect();
        let yr: Vec<f64> = (0..n).map(|_| rng.sample(u)).collect();
        Sample::from_columns(
            name,
            [(X_RECO.to_string(), xr), (Y_RECO.to_string(), yr)],
            Some(vec![weight; n]),
            None,
        )
    }
}

/// Observable configuration matching the toy column names.
pub fn toy_observables() -> ObservableConfig {
    let mut config = ObservableConfig::default();
    config.insert("x", X_RECO, X_TRUTH);
    config.insert("y", Y_RECO, Y_TRUTH);
    config
}
