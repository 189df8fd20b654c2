//! Predictive replicates and prediction curves
//!
//! Replicates are drawn from the noise family given the sampler's
//! observation-level location draws and residual-scale draws; the same code
//! serves prior and posterior predictive checks, since the distinction lives
//! entirely in which draws the artifact carries.
//!
//! Prediction curves sweep `time` over a grid with the remaining covariates
//! held fixed, evaluating the linear predictor from fixed-effect coefficient
//! draws. Smooth-term curves need the external basis and therefore the
//! sampler's own grid quantities; this module refuses to fake them.

use crate::fit::FittedArtifact;
use crate::model::{NoiseFamily, Term};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StudentT};
use serde::{Deserialize, Serialize};

/// Replicate outcome vectors simulated from a fitted model.
///
/// One inner vector per replicate, observation order matching the analysis
/// table. Used for prior and posterior predictive checks against observed
/// outcomes.
///
/// # Errors
///
/// Returns [`Error::MissingDraws`] when the artifact lacks observation-level
/// location draws or the residual-scale (and, for Student-t, `nu`) draws the
/// noise family requires.
pub fn replicates(
    artifact: &FittedArtifact,
    n_replicates: usize,
    seed: u64,
) -> Result<Vec<Vec<f64>>> {
    let locations = artifact.draws().obs_location().ok_or_else(|| {
        Error::MissingDraws(format!(
            "model '{}' has no observation-level location draws",
            artifact.name()
        ))
    })?;
    let sigmas = artifact.draws().flat("sigma").ok_or_else(|| {
        Error::MissingDraws(format!(
            "model '{}' has no residual-scale draws",
            artifact.name()
        ))
    })?;
    let nus = match artifact.spec().noise_family() {
        NoiseFamily::Gaussian => None,
        NoiseFamily::StudentT => Some(artifact.draws().flat("nu").ok_or_else(|| {
            Error::MissingDraws(format!(
                "model '{}' is Student-t but has no 'nu' draws",
                artifact.name()
            ))
        })?),
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(n_replicates);
    for _ in 0..n_replicates {
        let draw = rng.gen_range(0..locations.len());
        let sigma = sigmas[draw].abs().max(f64::MIN_POSITIVE);
        let row = match &nus {
            None => {
                let noise = Normal::new(0.0, sigma)
                    .map_err(|e| Error::Other(format!("replicate noise: {e}")))?;
                locations[draw]
                    .iter()
                    .map(|mu| mu + noise.sample(&mut rng))
                    .collect()
            }
            Some(nus) => {
                let nu = nus[draw].max(1.0);
                let t = StudentT::new(nu)
                    .map_err(|e| Error::Other(format!("replicate noise: {e}")))?;
                locations[draw]
                    .iter()
                    .map(|mu| sigma.mul_add(t.sample(&mut rng), *mu))
                    .collect()
            }
        };
        out.push(row);
    }
    Ok(out)
}

/// A synthetic covariate grid: time swept, everything else fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateGrid {
    /// Time values to evaluate, ascending
    pub times: Vec<f64>,
    /// Fixed values for every non-time covariate the model reads
    pub fixed: std::collections::BTreeMap<String, f64>,
}

impl CovariateGrid {
    /// Evenly spaced grid over a time range.
    #[must_use]
    pub fn over_time(
        start: f64,
        end: f64,
        points: usize,
        fixed: std::collections::BTreeMap<String, f64>,
    ) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let step = (end - start) / (points.saturating_sub(1).max(1)) as f64;
        #[allow(clippy::cast_precision_loss)]
        let times = (0..points).map(|i| step.mul_add(i as f64, start)).collect();
        Self { times, fixed }
    }
}

/// A prediction curve: posterior mean and central 95% band per grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionCurve {
    /// Grid time values
    pub times: Vec<f64>,
    /// Posterior mean of the linear predictor
    pub mean: Vec<f64>,
    /// 2.5% quantile
    pub lower: Vec<f64>,
    /// 97.5% quantile
    pub upper: Vec<f64>,
}

/// Evaluate the linear predictor over a covariate grid.
///
/// Uses the `Intercept` draws plus one `b_<name>` coefficient draw vector
/// per linear term. Presentation-layer output; no stability contract.
///
/// # Errors
///
/// - [`Error::SpecificationError`] if the model has a smooth term (its basis
///   lives in the external collaborator) or the grid lacks a fixed value for
///   a covariate the model reads;
/// - [`Error::MissingDraws`] if a needed coefficient has no draws.
pub fn prediction_curve(
    artifact: &FittedArtifact,
    grid: &CovariateGrid,
) -> Result<PredictionCurve> {
    let spec = artifact.spec();
    let mut slopes: Vec<(Vec<f64>, GridValue)> = Vec::new();
    for term in spec.terms() {
        match term {
            Term::Smooth { name, .. } => {
                return Err(Error::SpecificationError(format!(
                    "prediction grid for smooth term '{name}' requires sampler-side grid \
                     quantities; the spline basis is not evaluated here"
                )));
            }
            Term::Linear { name } => {
                let coef = format!("b_{name}");
                let draws = artifact.draws().flat(&coef).ok_or_else(|| {
                    Error::MissingDraws(format!(
                        "model '{}' has no draws for coefficient '{coef}'",
                        artifact.name()
                    ))
                })?;
                let value = if name == "time" {
                    GridValue::Time
                } else {
                    let fixed = *grid.fixed.get(name).ok_or_else(|| {
                        Error::SpecificationError(format!(
                            "grid fixes no value for covariate '{name}'"
                        ))
                    })?;
                    GridValue::Fixed(fixed)
                };
                slopes.push((draws, value));
            }
            // Population-level curve: group intercepts average out.
            Term::RandomIntercept { .. } => {}
        }
    }
    let intercepts = artifact.draws().flat("Intercept").ok_or_else(|| {
        Error::MissingDraws(format!(
            "model '{}' has no 'Intercept' draws",
            artifact.name()
        ))
    })?;

    let mut mean = Vec::with_capacity(grid.times.len());
    let mut lower = Vec::with_capacity(grid.times.len());
    let mut upper = Vec::with_capacity(grid.times.len());
    for &time in &grid.times {
        let mut values: Vec<f64> = intercepts.clone();
        for (draws, value) in &slopes {
            let x = match value {
                GridValue::Time => time,
                GridValue::Fixed(v) => *v,
            };
            for (acc, slope) in values.iter_mut().zip(draws) {
                *acc = slope.mul_add(x, *acc);
            }
        }
        let summary = crate::fit::ParamSummary::from_draws(&values);
        mean.push(summary.mean);
        lower.push(summary.q2_5);
        upper.push(summary.q97_5);
    }

    Ok(PredictionCurve {
        times: grid.times.clone(),
        mean,
        lower,
        upper,
    })
}

enum GridValue {
    Time,
    Fixed(f64),
}
