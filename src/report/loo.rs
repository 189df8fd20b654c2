//! Approximate leave-one-out predictive accuracy
//!
//! Importance-sampling LOO over the per-(draw, observation) log-likelihood
//! matrix the sampler emitted, with a per-observation Pareto-shape
//! diagnostic: the shape of a generalized Pareto distribution fitted to the
//! upper tail of the importance ratios. A large shape means that
//! observation's estimate leans on a handful of draws and is untrustworthy —
//! the estimator surfaces which observations those are, not just a count.
//!
//! The cross-validation estimator is a collaborator seam ([`LooEstimator`]);
//! [`ImportanceSamplingLoo`] is the built-in implementation.

use crate::fit::FittedArtifact;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default Pareto-shape threshold above which an observation is flagged.
pub const DEFAULT_PARETO_K_THRESHOLD: f64 = 0.7;

/// One observation's contribution to the LOO estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointwiseLoo {
    /// Leave-one-out expected log predictive density of this observation
    pub elpd: f64,
    /// Pareto-shape diagnostic; NaN when the tail was too short to fit
    pub pareto_k: f64,
}

/// LOO estimate for one fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LooResult {
    model: String,
    pointwise: Vec<PointwiseLoo>,
    pareto_k_threshold: f64,
}

impl LooResult {
    /// Assemble a result from precomputed parts.
    ///
    /// External estimators (and test doubles) use this to return their own
    /// pointwise contributions through the [`LooEstimator`] seam.
    #[must_use]
    pub fn from_parts(
        model: String,
        pointwise: Vec<PointwiseLoo>,
        pareto_k_threshold: f64,
    ) -> Self {
        Self {
            model,
            pointwise,
            pareto_k_threshold,
        }
    }

    /// Name of the model this estimate belongs to.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Per-observation contributions, in analysis-table row order.
    #[must_use]
    pub fn pointwise(&self) -> &[PointwiseLoo] {
        &self.pointwise
    }

    /// Total expected log predictive density (higher predicts better).
    #[must_use]
    pub fn elpd(&self) -> f64 {
        self.pointwise.iter().map(|p| p.elpd).sum()
    }

    /// Standard error of the total ELPD. NaN with fewer than two
    /// observations, where no spread can be estimated; comparison treats a
    /// non-finite standard error as indistinguishable, never as a ranking.
    #[must_use]
    pub fn se(&self) -> f64 {
        if self.pointwise.len() < 2 {
            return f64::NAN;
        }
        let elpds: Vec<f64> = self.pointwise.iter().map(|p| p.elpd).collect();
        let mean = crate::fit::ParamSummary::from_draws(&elpds).mean;
        #[allow(clippy::cast_precision_loss)]
        let n = elpds.len() as f64;
        let var = elpds.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (n * var).sqrt()
    }

    /// Row indices of observations whose Pareto shape exceeds the threshold
    /// (or could not be estimated). These observations exert undue influence
    /// on the fit.
    #[must_use]
    pub fn flagged_observations(&self) -> Vec<usize> {
        self.pointwise
            .iter()
            .enumerate()
            .filter(|(_, p)| p.pareto_k.is_nan() || p.pareto_k > self.pareto_k_threshold)
            .map(|(index, _)| index)
            .collect()
    }

    /// The threshold used for flagging.
    #[must_use]
    pub const fn pareto_k_threshold(&self) -> f64 {
        self.pareto_k_threshold
    }
}

/// The cross-validation estimator seam.
pub trait LooEstimator: Send + Sync {
    /// Estimate LOO predictive accuracy for one artifact.
    ///
    /// # Errors
    ///
    /// Returns an error when the artifact lacks the quantities the
    /// estimator needs.
    fn estimate(&self, artifact: &FittedArtifact) -> Result<LooResult>;
}

/// Importance-sampling LOO over the log-likelihood matrix.
#[derive(Debug, Clone, Copy)]
pub struct ImportanceSamplingLoo {
    /// Pareto-shape threshold for flagging observations
    pub pareto_k_threshold: f64,
}

impl Default for ImportanceSamplingLoo {
    fn default() -> Self {
        Self {
            pareto_k_threshold: DEFAULT_PARETO_K_THRESHOLD,
        }
    }
}

impl LooEstimator for ImportanceSamplingLoo {
    fn estimate(&self, artifact: &FittedArtifact) -> Result<LooResult> {
        let log_lik = artifact.draws().log_lik().ok_or_else(|| {
            Error::MissingDraws(format!(
                "model '{}' has no log-likelihood matrix; LOO needs one",
                artifact.name()
            ))
        })?;
        let n_obs = log_lik.first().map_or(0, Vec::len);
        if n_obs == 0 {
            return Err(Error::MissingDraws(format!(
                "model '{}' has an empty log-likelihood matrix",
                artifact.name()
            )));
        }

        let pointwise = (0..n_obs)
            .map(|obs| {
                let column: Vec<f64> = log_lik.iter().map(|row| row[obs]).collect();
                pointwise_loo(&column)
            })
            .collect();

        Ok(LooResult {
            model: artifact.name().to_string(),
            pointwise,
            pareto_k_threshold: self.pareto_k_threshold,
        })
    }
}

/// LOO contribution of one observation from its log-likelihood column.
///
/// The importance ratios for leaving observation `i` out are
/// `r_s = 1 / p(y_i | theta_s)`, so `elpd_i = -logsumexp(-ll) + log S`.
fn pointwise_loo(log_lik: &[f64]) -> PointwiseLoo {
    #[allow(clippy::cast_precision_loss)]
    let s = log_lik.len() as f64;
    let neg: Vec<f64> = log_lik.iter().map(|ll| -ll).collect();
    let elpd = -(log_sum_exp(&neg) - s.ln());

    // Shape of the upper importance-ratio tail.
    let mut ratios = neg;
    ratios.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let tail_len = tail_length(ratios.len());
    let cut = ratios.len() - tail_len;
    if cut == 0 {
        // Too few draws to separate a tail from a body: the estimate stands
        // but its diagnostic cannot, so the observation gets flagged.
        return PointwiseLoo {
            elpd,
            pareto_k: f64::NAN,
        };
    }
    let threshold = ratios[cut - 1];
    // Work on the ratio scale, shifted to exceedances over the threshold.
    let max_log = ratios[ratios.len() - 1];
    let exceedances: Vec<f64> = ratios[cut..]
        .iter()
        .map(|log_r| (log_r - max_log).exp() - (threshold - max_log).exp())
        .filter(|z| *z > 0.0)
        .collect();

    PointwiseLoo {
        elpd,
        pareto_k: gpd_shape(&exceedances),
    }
}

/// Tail size used for the Pareto fit: 20% of draws, capped at `3 sqrt(S)`.
fn tail_length(draws: usize) -> usize {
    #[allow(clippy::cast_precision_loss)]
    let cap = 3.0 * (draws as f64).sqrt();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let cap = cap.floor() as usize;
    (draws / 5).min(cap).max(1)
}

/// Generalized-Pareto shape via the Zhang-Stephens profile estimator.
///
/// `exceedances` are positive tail values over the threshold, ascending.
/// Returns NaN for tails too short to fit (fewer than 5 values).
fn gpd_shape(exceedances: &[f64]) -> f64 {
    let n = exceedances.len();
    if n < 5 {
        return f64::NAN;
    }
    #[allow(clippy::cast_precision_loss)]
    let n_f = n as f64;
    let z_max = exceedances[n - 1];
    let z_quartile = exceedances[(n + 2) / 4];
    if z_max <= 0.0 || z_quartile <= 0.0 {
        return f64::NAN;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let m = 30 + (n_f.sqrt().floor() as usize);
    let mut points = Vec::with_capacity(m);
    for j in 1..=m {
        #[allow(clippy::cast_precision_loss)]
        let j_f = j as f64;
        #[allow(clippy::cast_precision_loss)]
        let b = 1.0 / z_max + (1.0 - (m as f64 / (j_f - 0.5)).sqrt()) / (3.0 * z_quartile);
        let k = mean_log1p_neg(b, exceedances);
        // Profile log-likelihood of theta = b
        let profile = n_f * ((-b / k).ln() + k - 1.0);
        points.push((b, profile));
    }

    let max_profile = points
        .iter()
        .map(|(_, l)| *l)
        .fold(f64::NEG_INFINITY, f64::max);
    let mut weight_sum = 0.0;
    let mut b_hat = 0.0;
    for (b, profile) in &points {
        let w = (profile - max_profile).exp();
        if w.is_finite() {
            weight_sum += w;
            b_hat += b * w;
        }
    }
    if weight_sum == 0.0 {
        return f64::NAN;
    }
    b_hat /= weight_sum;

    // Weakly regularized toward 0.5, as small tails are noisy.
    let k_hat = mean_log1p_neg(b_hat, exceedances);
    k_hat.mul_add(n_f / (n_f + 10.0), 5.0 / (n_f + 10.0))
}

fn mean_log1p_neg(b: f64, values: &[f64]) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    values.iter().map(|z| (-b * z).ln_1p()).sum::<f64>() / n
}

pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_sum_exp_stability() {
        let values = vec![-1000.0, -1000.0];
        let result = log_sum_exp(&values);
        assert!((result - (-1000.0 + 2.0f64.ln())).abs() < 1e-10);
    }

    #[test]
    fn test_pointwise_elpd_of_constant_column() {
        // If every draw assigns the same density, LOO equals that density.
        let column = vec![-1.5; 400];
        let point = pointwise_loo(&column);
        assert!((point.elpd - (-1.5)).abs() < 1e-10);
    }

    #[test]
    fn test_pareto_k_small_for_well_behaved_ratios() {
        // Log-likelihoods with modest spread: importance ratios have thin
        // tails, so the shape estimate stays below the 0.7 threshold.
        let mut state = 9u64;
        let column: Vec<f64> = (0..2000)
            .map(|_| {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                #[allow(clippy::cast_precision_loss)]
                let u = (state >> 11) as f64 / (1u64 << 53) as f64;
                -1.0 - 0.3 * u
            })
            .collect();
        let point = pointwise_loo(&column);
        assert!(
            point.pareto_k < DEFAULT_PARETO_K_THRESHOLD,
            "k = {}",
            point.pareto_k
        );
    }

    #[test]
    fn test_pareto_k_large_for_dominated_ratios() {
        // One draw utterly dominates the importance weights.
        let mut column = vec![-1.0; 1000];
        column[500] = -40.0;
        let point = pointwise_loo(&column);
        assert!(
            point.pareto_k.is_nan() || point.pareto_k > DEFAULT_PARETO_K_THRESHOLD,
            "k = {}",
            point.pareto_k
        );
    }

    #[test]
    fn test_gpd_shape_too_short_is_nan() {
        assert!(gpd_shape(&[0.1, 0.2, 0.3]).is_nan());
    }

    #[test]
    fn test_single_draw_column_is_flagged_not_panicking() {
        let point = pointwise_loo(&[-1.5]);
        assert!((point.elpd - (-1.5)).abs() < 1e-12);
        assert!(point.pareto_k.is_nan());
    }

    #[test]
    fn test_estimate_flags_observations_of_degenerate_fit() {
        use crate::dataset::{LongRow, LongTable};
        use crate::fit::{DriverOptions, FitDriver, SamplingConfig};
        use crate::fit::test_support::MockSampler;
        use crate::model::ModelSpec;
        use std::collections::BTreeMap;
        use std::sync::Arc;

        // chains=1, samples=1 is a configuration the driver accepts; the
        // estimator must degrade to flagging, never crash.
        let rows = vec![
            LongRow {
                study_key: "S1".to_string(),
                time: 3.0,
                effect: Some(-20.0),
                variance: None,
                covariates: BTreeMap::new(),
            },
            LongRow {
                study_key: "S1".to_string(),
                time: 6.0,
                effect: Some(-19.0),
                variance: None,
                covariates: BTreeMap::new(),
            },
        ];
        let data = LongTable::new(rows, vec![]).normalize();
        let spec = ModelSpec::builder("tiny").linear("time").build().unwrap();
        let config = SamplingConfig {
            chains: 1,
            samples: 1,
            ..SamplingConfig::default()
        };
        let driver = FitDriver::new(
            Arc::new(MockSampler::well_behaved()),
            DriverOptions::default(),
        );
        let artifact = driver.fit(&spec, &data, &config).unwrap();

        let result = ImportanceSamplingLoo::default().estimate(&artifact).unwrap();
        assert_eq!(result.pointwise().len(), 2);
        assert_eq!(result.flagged_observations(), vec![0, 1]);
    }

    #[test]
    fn test_tail_length_bounds() {
        assert_eq!(tail_length(4), 1);
        assert!(tail_length(1000) <= 3 * 31);
        assert_eq!(tail_length(100), 20);
    }
}
