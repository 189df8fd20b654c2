//! Fitting driver around a pluggable external sampler
//!
//! The Markov-chain Monte Carlo engine itself is an external collaborator
//! behind the [`Sampler`] trait. The driver owns everything around it:
//! validating the specification against the dataset before any sampling
//! call, consulting the content-addressed artifact cache, running
//! convergence checks on the returned chains, and attaching a
//! [`Reliability`] status to the produced artifact.
//!
//! A fit whose diagnostics fail is marked unreliable, never silently
//! discarded: downstream comparison refuses to rank it without an explicit
//! override. The only sanctioned retry is [`FitDriver::refit_adjusted`],
//! which requires a raised acceptance target — a blind retry with the same
//! configuration would not address the root cause.

mod cache;
mod diagnostics;
mod draws;

pub use cache::ArtifactCache;
pub use diagnostics::{bulk_ess, split_rhat, ConvergenceReport, ParamDiagnostics};
pub use draws::{DrawCollection, ParamSummary};

use crate::dataset::AnalysisTable;
use crate::model::ModelSpec;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sampling configuration handed to the external sampler.
///
/// The convergence tolerances live here too — they are configuration, not
/// constants baked into the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of parallel chains
    pub chains: usize,
    /// Warmup iterations per chain
    pub warmup: usize,
    /// Post-warmup iterations per chain
    pub samples: usize,
    /// Target acceptance rate of the sampler's step-size adaptation
    pub adapt_delta: f64,
    /// Sample from the prior only, ignoring the likelihood
    pub prior_only: bool,
    /// RNG seed
    pub seed: u64,
    /// Largest acceptable split-R̂ per parameter
    pub rhat_tolerance: f64,
    /// Largest acceptable divergent-transition count
    pub max_divergent: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1000,
            samples: 1000,
            adapt_delta: 0.8,
            prior_only: false,
            seed: 0,
            rhat_tolerance: 1.01,
            max_divergent: 0,
        }
    }
}

impl SamplingConfig {
    /// Stable content fingerprint, used as the cache key's config component.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        self.chains.hash(&mut hasher);
        self.warmup.hash(&mut hasher);
        self.samples.hash(&mut hasher);
        self.adapt_delta.to_bits().hash(&mut hasher);
        self.prior_only.hash(&mut hasher);
        self.seed.hash(&mut hasher);
        self.rhat_tolerance.to_bits().hash(&mut hasher);
        self.max_divergent.hash(&mut hasher);
        hasher.finish()
    }
}

/// The external sampler seam.
///
/// Implementations receive the validated specification, the normalized
/// dataset and the sampling configuration, and return draws plus the
/// divergence count. `Send + Sync` because independent model variants fit
/// in parallel against a shared dataset.
pub trait Sampler: Send + Sync {
    /// Produce draws for one specification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SamplerError`] on numerical failure or malformed
    /// inputs the sampler cannot digest.
    fn sample(
        &self,
        spec: &ModelSpec,
        data: &AnalysisTable,
        config: &SamplingConfig,
    ) -> Result<DrawCollection>;
}

/// Whether an artifact's diagnostics passed.
///
/// Deliberately a status, not an error: it propagates as data and blocks
/// downstream ranking unless overridden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reliability {
    /// All convergence checks passed
    Reliable,
    /// One or more checks failed; findings attached
    Unreliable {
        /// One entry per failed check
        reasons: Vec<String>,
    },
}

impl Reliability {
    /// Whether the artifact may enter a ranking without an override.
    #[must_use]
    pub const fn is_reliable(&self) -> bool {
        matches!(self, Self::Reliable)
    }
}

/// Immutable product of one fit: specification, draws, diagnostics, status.
///
/// Owned by the pipeline step that created it; the reporter only ever
/// borrows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FittedArtifact {
    spec: ModelSpec,
    data_fingerprint: u64,
    config: SamplingConfig,
    draws: DrawCollection,
    convergence: ConvergenceReport,
    reliability: Reliability,
    created_at: DateTime<Utc>,
}

impl FittedArtifact {
    /// Name of the specification this artifact was fitted from.
    #[must_use]
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// The specification.
    #[must_use]
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Fingerprint of the dataset the fit consumed.
    #[must_use]
    pub const fn data_fingerprint(&self) -> u64 {
        self.data_fingerprint
    }

    /// The sampling configuration used.
    #[must_use]
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// The draws.
    #[must_use]
    pub fn draws(&self) -> &DrawCollection {
        &self.draws
    }

    /// The convergence report.
    #[must_use]
    pub fn convergence(&self) -> &ConvergenceReport {
        &self.convergence
    }

    /// Reliability status.
    #[must_use]
    pub fn reliability(&self) -> &Reliability {
        &self.reliability
    }

    /// When the artifact was produced.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Driver construction options — explicit, never ambient global state, so
/// independent pipeline runs in one process cannot interfere.
#[derive(Debug, Clone, Copy)]
pub struct DriverOptions {
    /// Reuse artifacts for identical (spec, data, config) triples
    pub cache_enabled: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
        }
    }
}

/// Orchestrates validate → cache lookup → sample → convergence gate.
pub struct FitDriver {
    sampler: Arc<dyn Sampler>,
    options: DriverOptions,
    cache: ArtifactCache,
}

impl FitDriver {
    /// Create a driver around a sampler.
    #[must_use]
    pub fn new(sampler: Arc<dyn Sampler>, options: DriverOptions) -> Self {
        Self {
            sampler,
            options,
            cache: ArtifactCache::new(),
        }
    }

    /// Fit one specification against the dataset.
    ///
    /// The specification is validated against the dataset's columns before
    /// any sampling call; the cache is consulted next; diagnostics run on
    /// the returned chains and decide the artifact's [`Reliability`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpecificationError`] if a term has no matching
    /// dataset column, or [`Error::SamplerError`] if the sampler fails
    /// outright. A fit that merely fails diagnostics is NOT an error; it
    /// comes back marked unreliable.
    pub fn fit(
        &self,
        spec: &ModelSpec,
        data: &AnalysisTable,
        config: &SamplingConfig,
    ) -> Result<Arc<FittedArtifact>> {
        spec.validate_columns(data)?;

        let key = ArtifactCache::key(
            spec.fingerprint(),
            data.fingerprint(),
            config.fingerprint(),
        );
        if self.options.cache_enabled {
            if let Some(artifact) = self.cache.get(key) {
                debug!(model = spec.name(), "artifact cache hit");
                return Ok(artifact);
            }
        }

        info!(
            model = spec.name(),
            chains = config.chains,
            samples = config.samples,
            prior_only = config.prior_only,
            "sampling"
        );
        let draws = self.sampler.sample(spec, data, config)?;
        let convergence = ConvergenceReport::compute(&draws);
        let failures = convergence.failures(config.rhat_tolerance, config.max_divergent);
        let reliability = if failures.is_empty() {
            Reliability::Reliable
        } else {
            warn!(model = spec.name(), ?failures, "fit marked unreliable");
            Reliability::Unreliable { reasons: failures }
        };

        let artifact = Arc::new(FittedArtifact {
            spec: spec.clone(),
            data_fingerprint: data.fingerprint(),
            config: config.clone(),
            draws,
            convergence,
            reliability,
            created_at: Utc::now(),
        });
        if self.options.cache_enabled {
            self.cache.put(key, Arc::clone(&artifact));
        }
        Ok(artifact)
    }

    /// Refit with a raised acceptance target after a failed convergence
    /// check — the one sanctioned retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpecificationError`] if `adapt_delta` was not
    /// actually raised (a blind retry), and [`Error::ConvergenceFailure`]
    /// if the adjusted fit still fails its diagnostics.
    pub fn refit_adjusted(
        &self,
        spec: &ModelSpec,
        data: &AnalysisTable,
        config: &SamplingConfig,
        adapt_delta: f64,
    ) -> Result<Arc<FittedArtifact>> {
        if adapt_delta <= config.adapt_delta {
            return Err(Error::SpecificationError(format!(
                "refit requires a raised acceptance target: {adapt_delta} is not above {}",
                config.adapt_delta
            )));
        }
        let adjusted = SamplingConfig {
            adapt_delta,
            ..config.clone()
        };
        let artifact = self.fit(spec, data, &adjusted)?;
        match artifact.reliability() {
            Reliability::Reliable => Ok(artifact),
            Reliability::Unreliable { reasons } => Err(Error::ConvergenceFailure {
                model: spec.name().to_string(),
                reasons: reasons.clone(),
            }),
        }
    }

    /// Number of artifacts currently cached.
    #[must_use]
    pub fn cached_artifacts(&self) -> usize {
        self.cache.len()
    }
}
