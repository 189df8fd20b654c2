//! Diagnostic and comparison reporting over fitted artifacts
//!
//! Every output here is a freshly computed summary: the reporter borrows
//! artifacts and mutates nothing. Comparison waits for its inputs — an
//! artifact enters a ranking only after its fit completed and its
//! reliability was decided (or explicitly overridden).

mod compare;
mod loo;
mod predictive;
mod sensitivity;

pub use compare::{ComparisonRow, ModelComparison, Verdict};
pub use loo::{
    ImportanceSamplingLoo, LooEstimator, LooResult, PointwiseLoo, DEFAULT_PARETO_K_THRESHOLD,
};
pub use predictive::{prediction_curve, replicates, CovariateGrid, PredictionCurve};
pub use sensitivity::{prior_sensitivity, ParamSensitivity, SensitivityConfig};
