//! Model comparison by expected log predictive density
//!
//! Ranks artifacts strictly by ELPD and reports, for every model, the
//! estimated difference against the best-ranked model together with the
//! standard error of that difference. A difference smaller than its
//! standard error is surfaced as indistinguishable, never as a ranking —
//! a bare point-estimate ordering without uncertainty is an incomplete
//! result, and this module refuses to produce one.

use super::loo::{LooEstimator, LooResult};
use crate::fit::FittedArtifact;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict of one model against the best-ranked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// The top-ranked model
    Best,
    /// Predictively worse than the best by more than one standard error
    Worse,
    /// Difference from the best is within its standard error
    Indistinguishable,
}

/// One model's row in the comparison table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    /// Model name
    pub model: String,
    /// Expected log predictive density
    pub elpd: f64,
    /// Standard error of the ELPD
    pub se: f64,
    /// ELPD difference against the best model (0 for the best)
    pub elpd_diff: f64,
    /// Standard error of the pairwise difference (0 for the best)
    pub se_diff: f64,
    /// Verdict against the best model
    pub verdict: Verdict,
    /// Observations flagged by the Pareto-shape diagnostic
    pub flagged_observations: Vec<usize>,
}

/// Ranked comparison across fitted models over the same dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    rows: Vec<ComparisonRow>,
}

impl ModelComparison {
    /// Compare artifacts over one dataset, best model first.
    ///
    /// Unreliable artifacts are refused unless `allow_unreliable` is set:
    /// ranking a fit whose chains never agreed would launder noise into a
    /// verdict.
    ///
    /// # Errors
    ///
    /// - [`Error::UnreliableArtifact`] for an unreliable artifact without
    ///   the override;
    /// - [`Error::Other`] when fewer than two artifacts are given or their
    ///   dataset fingerprints differ;
    /// - whatever the estimator returns for artifacts it cannot score.
    pub fn compare(
        artifacts: &[&FittedArtifact],
        estimator: &dyn LooEstimator,
        allow_unreliable: bool,
    ) -> Result<Self> {
        if artifacts.len() < 2 {
            return Err(Error::Other(
                "model comparison needs at least two artifacts".to_string(),
            ));
        }
        let data_fingerprint = artifacts[0].data_fingerprint();
        for artifact in artifacts {
            if artifact.data_fingerprint() != data_fingerprint {
                return Err(Error::Other(format!(
                    "artifact '{}' was fitted on a different dataset; comparison \
                     requires a shared dataset",
                    artifact.name()
                )));
            }
            if !allow_unreliable && !artifact.reliability().is_reliable() {
                return Err(Error::UnreliableArtifact(artifact.name().to_string()));
            }
        }

        let mut scored: Vec<(&FittedArtifact, LooResult)> = artifacts
            .iter()
            .map(|artifact| Ok((*artifact, estimator.estimate(artifact)?)))
            .collect::<Result<_>>()?;
        scored.sort_by(|a, b| {
            b.1.elpd()
                .partial_cmp(&a.1.elpd())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let best = scored[0].1.clone();
        let rows = scored
            .iter()
            .enumerate()
            .map(|(rank, (_, loo))| {
                let (elpd_diff, se_diff) = if rank == 0 {
                    (0.0, 0.0)
                } else {
                    pairwise_difference(&best, loo)
                };
                // A difference whose standard error cannot be estimated is
                // unjudgeable, and unjudgeable never ranks as worse.
                let verdict = if rank == 0 {
                    Verdict::Best
                } else if !se_diff.is_finite() || elpd_diff.abs() <= se_diff {
                    Verdict::Indistinguishable
                } else {
                    Verdict::Worse
                };
                ComparisonRow {
                    model: loo.model().to_string(),
                    elpd: loo.elpd(),
                    se: loo.se(),
                    elpd_diff,
                    se_diff,
                    verdict,
                    flagged_observations: loo.flagged_observations(),
                }
            })
            .collect();
        Ok(Self { rows })
    }

    /// Rows, best model first.
    #[must_use]
    pub fn rows(&self) -> &[ComparisonRow] {
        &self.rows
    }

    /// The best-ranked model's name.
    #[must_use]
    pub fn best(&self) -> &str {
        &self.rows[0].model
    }

    /// Whether the top two models are predictively indistinguishable.
    #[must_use]
    pub fn top_is_decisive(&self) -> bool {
        self.rows
            .get(1)
            .map_or(true, |row| row.verdict == Verdict::Worse)
    }
}

impl fmt::Display for ModelComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<24} {:>10} {:>8} {:>10} {:>8}  verdict",
            "model", "elpd", "se", "elpd_diff", "se_diff"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<24} {:>10.2} {:>8.2} {:>10.2} {:>8.2}  {:?}",
                row.model, row.elpd, row.se, row.elpd_diff, row.se_diff, row.verdict
            )?;
        }
        Ok(())
    }
}

/// Paired difference of two LOO estimates and its standard error.
///
/// Computed pointwise, as the per-observation contributions are paired over
/// the same data.
fn pairwise_difference(best: &LooResult, other: &LooResult) -> (f64, f64) {
    let diffs: Vec<f64> = best
        .pointwise()
        .iter()
        .zip(other.pointwise())
        .map(|(a, b)| b.elpd - a.elpd)
        .collect();
    #[allow(clippy::cast_precision_loss)]
    let n = diffs.len() as f64;
    let mean = diffs.iter().sum::<f64>() / n;
    let var = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean * n, (n * var).sqrt())
}
