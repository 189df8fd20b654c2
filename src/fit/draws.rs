//! Sampler-agnostic draw containers
//!
//! A [`DrawCollection`] is what the external sampler hands back: per-parameter
//! chains, a divergent-transition count, and optional generated quantities
//! (per-observation log-likelihoods and location draws) that downstream
//! diagnostics consume. The container is deliberately ignorant of the sampler
//! that produced it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Posterior (or prior-only) draws for one fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawCollection {
    parameters: BTreeMap<String, Vec<Vec<f64>>>,
    n_chains: usize,
    draws_per_chain: usize,
    divergent: usize,
    log_lik: Option<Vec<Vec<f64>>>,
    obs_location: Option<Vec<Vec<f64>>>,
    prior_only: bool,
}

impl DrawCollection {
    /// Create an empty collection for a given chain geometry.
    #[must_use]
    pub fn new(n_chains: usize, draws_per_chain: usize, prior_only: bool) -> Self {
        Self {
            parameters: BTreeMap::new(),
            n_chains,
            draws_per_chain,
            divergent: 0,
            log_lik: None,
            obs_location: None,
            prior_only,
        }
    }

    /// Add a scalar parameter's chains.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SamplerError`] if the chain geometry does not match
    /// the collection's.
    pub fn add_parameter(
        &mut self,
        name: impl Into<String>,
        chains: Vec<Vec<f64>>,
    ) -> Result<()> {
        let name = name.into();
        if chains.len() != self.n_chains
            || chains.iter().any(|c| c.len() != self.draws_per_chain)
        {
            return Err(Error::SamplerError(format!(
                "parameter '{name}' has wrong chain geometry, expected {} chains x {} draws",
                self.n_chains, self.draws_per_chain
            )));
        }
        self.parameters.insert(name, chains);
        Ok(())
    }

    /// Record the divergent-transition count reported by the sampler.
    pub fn set_divergent(&mut self, divergent: usize) {
        self.divergent = divergent;
    }

    /// Attach the per-(draw, observation) log-likelihood matrix.
    ///
    /// Rows are flattened draws (all chains concatenated), columns are
    /// observations in analysis-table row order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SamplerError`] on a row-count mismatch or ragged rows.
    pub fn set_log_lik(&mut self, log_lik: Vec<Vec<f64>>) -> Result<()> {
        Self::check_matrix("log_lik", &log_lik, self.total_draws())?;
        self.log_lik = Some(log_lik);
        Ok(())
    }

    /// Attach per-(draw, observation) location (linear predictor) draws.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SamplerError`] on a row-count mismatch or ragged rows.
    pub fn set_obs_location(&mut self, locations: Vec<Vec<f64>>) -> Result<()> {
        Self::check_matrix("obs_location", &locations, self.total_draws())?;
        self.obs_location = Some(locations);
        Ok(())
    }

    fn check_matrix(what: &str, matrix: &[Vec<f64>], rows: usize) -> Result<()> {
        if matrix.len() != rows {
            return Err(Error::SamplerError(format!(
                "{what} has {} rows, expected one per draw ({rows})",
                matrix.len()
            )));
        }
        let width = matrix.first().map_or(0, Vec::len);
        if matrix.iter().any(|row| row.len() != width) {
            return Err(Error::SamplerError(format!("{what} rows are ragged")));
        }
        Ok(())
    }

    /// Parameter names, sorted.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.keys().map(String::as_str).collect()
    }

    /// Chains of a parameter, chain-major.
    #[must_use]
    pub fn chains(&self, name: &str) -> Option<&[Vec<f64>]> {
        self.parameters.get(name).map(Vec::as_slice)
    }

    /// All draws of a parameter flattened across chains, chain order.
    #[must_use]
    pub fn flat(&self, name: &str) -> Option<Vec<f64>> {
        self.parameters
            .get(name)
            .map(|chains| chains.iter().flatten().copied().collect())
    }

    /// Number of chains.
    #[must_use]
    pub const fn n_chains(&self) -> usize {
        self.n_chains
    }

    /// Post-warmup draws per chain.
    #[must_use]
    pub const fn draws_per_chain(&self) -> usize {
        self.draws_per_chain
    }

    /// Total draws across chains.
    #[must_use]
    pub const fn total_draws(&self) -> usize {
        self.n_chains * self.draws_per_chain
    }

    /// Divergent transitions reported by the sampler.
    #[must_use]
    pub const fn divergent(&self) -> usize {
        self.divergent
    }

    /// Whether these are prior-only draws.
    #[must_use]
    pub const fn prior_only(&self) -> bool {
        self.prior_only
    }

    /// Log-likelihood matrix, if the sampler emitted one.
    #[must_use]
    pub fn log_lik(&self) -> Option<&[Vec<f64>]> {
        self.log_lik.as_deref()
    }

    /// Observation-level location draws, if the sampler emitted them.
    #[must_use]
    pub fn obs_location(&self) -> Option<&[Vec<f64>]> {
        self.obs_location.as_deref()
    }

    /// Posterior summary of one parameter.
    #[must_use]
    pub fn summary(&self, name: &str) -> Option<ParamSummary> {
        let draws = self.flat(name)?;
        Some(ParamSummary::from_draws(&draws))
    }
}

/// Mean, spread and central quantiles of one parameter's draws.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamSummary {
    /// Posterior mean
    pub mean: f64,
    /// Posterior standard deviation
    pub sd: f64,
    /// 2.5% quantile
    pub q2_5: f64,
    /// Median
    pub median: f64,
    /// 97.5% quantile
    pub q97_5: f64,
}

impl ParamSummary {
    /// Summarize a draw vector.
    #[must_use]
    pub fn from_draws(draws: &[f64]) -> Self {
        let mean = mean(draws);
        let sd = sd(draws, mean);
        let mut sorted = draws.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            mean,
            sd,
            q2_5: quantile_sorted(&sorted, 0.025),
            median: quantile_sorted(&sorted, 0.5),
            q97_5: quantile_sorted(&sorted, 0.975),
        }
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    values.iter().sum::<f64>() / n
}

pub(crate) fn sd(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
}

/// Linear-interpolated quantile over a pre-sorted slice.
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    #[allow(clippy::cast_precision_loss)]
    let position = q * (sorted.len() - 1) as f64;
    let low = position.floor();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = low as usize;
    if index + 1 >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    let weight = position - low;
    sorted[index].mul_add(1.0 - weight, sorted[index + 1] * weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_parameter_rejects_wrong_geometry() {
        let mut draws = DrawCollection::new(2, 100, false);
        let result = draws.add_parameter("b_time", vec![vec![0.0; 100]]);
        assert!(result.is_err());
        let result = draws.add_parameter("b_time", vec![vec![0.0; 50], vec![0.0; 50]]);
        assert!(result.is_err());
    }

    #[test]
    fn test_flat_concatenates_in_chain_order() {
        let mut draws = DrawCollection::new(2, 2, false);
        draws
            .add_parameter("sigma", vec![vec![1.0, 2.0], vec![3.0, 4.0]])
            .unwrap();
        assert_eq!(draws.flat("sigma").unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_log_lik_row_count_checked() {
        let mut draws = DrawCollection::new(2, 2, false);
        assert!(draws.set_log_lik(vec![vec![0.0; 3]; 5]).is_err());
        assert!(draws.set_log_lik(vec![vec![0.0; 3]; 4]).is_ok());
    }

    #[test]
    fn test_summary_of_symmetric_draws() {
        let values: Vec<f64> = (0..=100).map(f64::from).collect();
        let summary = ParamSummary::from_draws(&values);
        assert!((summary.mean - 50.0).abs() < 1e-12);
        assert!((summary.median - 50.0).abs() < 1e-12);
        assert!(summary.q2_5 < summary.median && summary.median < summary.q97_5);
    }

    #[test]
    fn test_quantile_endpoints() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0];
        assert!((quantile_sorted(&sorted, 0.0) - 1.0).abs() < 1e-12);
        assert!((quantile_sorted(&sorted, 1.0) - 4.0).abs() < 1e-12);
    }
}
