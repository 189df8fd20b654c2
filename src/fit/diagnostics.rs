//! Convergence diagnostics over returned chains
//!
//! Split potential-scale-reduction (split-R̂) and a Geyer-truncated bulk
//! effective sample size, computed per scalar parameter. Both are
//! sampler-agnostic: they only see the chains the sampler returned.

use super::draws::{mean, sd, DrawCollection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Diagnostics for one scalar parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamDiagnostics {
    /// Split potential-scale-reduction statistic; near 1.0 when chains agree
    pub rhat: f64,
    /// Bulk effective sample size
    pub ess: f64,
}

/// Convergence report for a whole draw collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    per_parameter: BTreeMap<String, ParamDiagnostics>,
    divergent: usize,
}

impl ConvergenceReport {
    /// Compute diagnostics for every parameter in a collection.
    #[must_use]
    pub fn compute(draws: &DrawCollection) -> Self {
        let per_parameter = draws
            .parameter_names()
            .into_iter()
            .map(|name| {
                let chains = draws.chains(name).unwrap_or(&[]);
                (
                    name.to_string(),
                    ParamDiagnostics {
                        rhat: split_rhat(chains),
                        ess: bulk_ess(chains),
                    },
                )
            })
            .collect();
        Self {
            per_parameter,
            divergent: draws.divergent(),
        }
    }

    /// Per-parameter diagnostics.
    #[must_use]
    pub fn per_parameter(&self) -> &BTreeMap<String, ParamDiagnostics> {
        &self.per_parameter
    }

    /// Divergent-transition count.
    #[must_use]
    pub const fn divergent(&self) -> usize {
        self.divergent
    }

    /// Largest R̂ across parameters, `None` for an empty report.
    #[must_use]
    pub fn max_rhat(&self) -> Option<(&str, f64)> {
        self.per_parameter
            .iter()
            .max_by(|a, b| {
                a.1.rhat
                    .partial_cmp(&b.1.rhat)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(name, diag)| (name.as_str(), diag.rhat))
    }

    /// Every finding that disqualifies the fit under the given tolerances.
    ///
    /// An R̂ that is NaN (degenerate chains) counts as a failure; silent
    /// acceptance of a degenerate fit is the one outcome this check exists
    /// to prevent.
    #[must_use]
    pub fn failures(&self, rhat_tolerance: f64, max_divergent: usize) -> Vec<String> {
        let mut findings = Vec::new();
        for (name, diag) in &self.per_parameter {
            if diag.rhat.is_nan() || diag.rhat > rhat_tolerance {
                findings.push(format!(
                    "parameter '{name}' has split-Rhat {:.4} above tolerance {rhat_tolerance}",
                    diag.rhat
                ));
            }
        }
        if self.divergent > max_divergent {
            findings.push(format!(
                "{} divergent transitions above threshold {max_divergent}",
                self.divergent
            ));
        }
        findings
    }
}

/// Split potential-scale-reduction statistic.
///
/// Each chain is split in half; between- and within-half variances are
/// compared. Identical constant chains yield exactly 1.0; chains too short
/// to split (<4 draws) yield +inf so they can never pass a tolerance check.
#[must_use]
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let halves = split_chains(chains);
    if halves.is_empty() {
        return f64::INFINITY;
    }
    let n = halves[0].len();
    #[allow(clippy::cast_precision_loss)]
    let n_f = n as f64;
    #[allow(clippy::cast_precision_loss)]
    let m_f = halves.len() as f64;

    let half_means: Vec<f64> = halves.iter().map(|half| mean(half)).collect();
    let grand_mean = mean(&half_means);
    let between = n_f / (m_f - 1.0)
        * half_means
            .iter()
            .map(|m| (m - grand_mean).powi(2))
            .sum::<f64>();
    let within = mean(
        &halves
            .iter()
            .zip(&half_means)
            .map(|(half, &m)| sd(half, m).powi(2))
            .collect::<Vec<_>>(),
    );

    if within == 0.0 {
        // All halves constant: agreement if between-variance is zero too.
        return if between == 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = (n_f - 1.0) / n_f * within + between / n_f;
    (var_plus / within).sqrt()
}

/// Bulk effective sample size with Geyer initial-positive-sequence
/// truncation of the averaged autocorrelation function.
#[must_use]
pub fn bulk_ess(chains: &[Vec<f64>]) -> f64 {
    let halves = split_chains(chains);
    if halves.is_empty() {
        return f64::NAN;
    }
    let n = halves[0].len();
    #[allow(clippy::cast_precision_loss)]
    let total = (halves.len() * n) as f64;

    // Average per-half autocorrelations lag by lag, stopping when the sum
    // of an adjacent pair turns negative.
    let acfs: Vec<Vec<f64>> = halves.iter().map(|half| autocorrelations(half)).collect();
    let mut rho_sum = 0.0;
    let mut lag = 1;
    while lag + 1 < n {
        let rho_a = mean(&acfs.iter().map(|acf| acf[lag]).collect::<Vec<_>>());
        let rho_b = mean(&acfs.iter().map(|acf| acf[lag + 1]).collect::<Vec<_>>());
        if rho_a + rho_b < 0.0 {
            break;
        }
        rho_sum += rho_a + rho_b;
        lag += 2;
    }
    total / 2.0f64.mul_add(rho_sum, 1.0)
}

fn autocorrelations(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let m = mean(values);
    let denom: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    if denom == 0.0 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|lag| {
            let num: f64 = values[..n - lag]
                .iter()
                .zip(&values[lag..])
                .map(|(a, b)| (a - m) * (b - m))
                .sum();
            num / denom
        })
        .collect()
}

/// Split every chain into two halves, dropping a middle element from
/// odd-length chains. Chains with fewer than 4 draws produce no halves.
fn split_chains(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    let mut halves = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        if chain.len() < 4 {
            return Vec::new();
        }
        let half = chain.len() / 2;
        halves.push(&chain[..half]);
        halves.push(&chain[chain.len() - half..]);
    }
    halves
}
