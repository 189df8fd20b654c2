//! End-to-end analysis pipeline
//!
//! Load → normalize → fit every registered model variant → compare. Loader
//! and normalizer errors abort before any sampling starts. Independent model
//! variants share the dataset read-only and fit in parallel when enabled;
//! the comparison step runs only after every artifact has completed and
//! carries a reliability status.
//!
//! All knobs live in an explicit [`PipelineOptions`] value passed at
//! construction. Two pipelines in one process cannot interfere: there is no
//! ambient global state to fight over.

use crate::dataset::{AnalysisTable, OccasionLayout, WideTable};
use crate::fit::{DriverOptions, FitDriver, FittedArtifact, Sampler, SamplingConfig};
use crate::model::ModelSpec;
use crate::report::{LooEstimator, ModelComparison};
use crate::Result;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::info;

/// Pipeline-wide options, set once at construction.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Fitting-driver options (artifact caching)
    pub driver: DriverOptions,
    /// Sampling configuration applied to every variant
    pub sampling: SamplingConfig,
    /// Fit independent variants on the rayon pool
    pub parallel: bool,
}

/// One analysis run over one normalized dataset.
pub struct AnalysisPipeline {
    data: AnalysisTable,
    driver: FitDriver,
    sampling: SamplingConfig,
    parallel: bool,
}

impl AnalysisPipeline {
    /// Build a pipeline over an already-normalized dataset.
    #[must_use]
    pub fn new(data: AnalysisTable, sampler: Arc<dyn Sampler>, options: PipelineOptions) -> Self {
        Self {
            data,
            driver: FitDriver::new(sampler, options.driver),
            sampling: options.sampling,
            parallel: options.parallel,
        }
    }

    /// Build a pipeline from a wide table: reshape, then normalize.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::SchemaError`] for any loader problem; nothing
    /// is fitted when the input is malformed.
    pub fn from_wide(
        wide: &WideTable,
        layout: &OccasionLayout,
        sampler: Arc<dyn Sampler>,
        options: PipelineOptions,
    ) -> Result<Self> {
        let long = wide.to_long(layout)?;
        let data = long.normalize();
        info!(
            studies = data.n_studies(),
            observations = data.len(),
            dropped = long.len() - data.len(),
            "dataset normalized"
        );
        Ok(Self::new(data, sampler, options))
    }

    /// The shared, read-only analysis dataset.
    #[must_use]
    pub fn data(&self) -> &AnalysisTable {
        &self.data
    }

    /// Fit one specification with the pipeline's sampling configuration.
    ///
    /// # Errors
    ///
    /// Propagates driver errors; see [`FitDriver::fit`].
    pub fn fit(&self, spec: &ModelSpec) -> Result<Arc<FittedArtifact>> {
        self.driver.fit(spec, &self.data, &self.sampling)
    }

    /// Fit every variant, in parallel when enabled.
    ///
    /// Artifacts come back in the order of `specs`, each one an independent
    /// immutable product; an unreliable fit is an artifact, not an error.
    ///
    /// # Errors
    ///
    /// The first driver error encountered; see [`FitDriver::fit`].
    pub fn fit_all(&self, specs: &[ModelSpec]) -> Result<Vec<Arc<FittedArtifact>>> {
        info!(variants = specs.len(), parallel = self.parallel, "fitting model variants");
        if self.parallel {
            specs
                .par_iter()
                .map(|spec| self.fit(spec))
                .collect::<Result<Vec<_>>>()
        } else {
            specs.iter().map(|spec| self.fit(spec)).collect()
        }
    }

    /// Compare fitted artifacts; a convenience over
    /// [`ModelComparison::compare`].
    ///
    /// # Errors
    ///
    /// See [`ModelComparison::compare`].
    pub fn compare(
        &self,
        artifacts: &[Arc<FittedArtifact>],
        estimator: &dyn LooEstimator,
        allow_unreliable: bool,
    ) -> Result<ModelComparison> {
        let refs: Vec<&FittedArtifact> = artifacts.iter().map(AsRef::as_ref).collect();
        ModelComparison::compare(&refs, estimator, allow_unreliable)
    }

    /// Number of artifacts in the driver's cache.
    #[must_use]
    pub fn cached_artifacts(&self) -> usize {
        self.driver.cached_artifacts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{LongRow, LongTable};
    use crate::fit::test_support::MockSampler;
    use crate::model::{CoefClass, NoiseFamily, Prior};
    use crate::report::ImportanceSamplingLoo;
    use std::collections::BTreeMap;

    fn table() -> AnalysisTable {
        let rows = (1..=4)
            .flat_map(|study| {
                [3.0, 6.0, 12.0, 24.0].into_iter().map(move |time| LongRow {
                    study_key: format!("S{study}"),
                    time,
                    effect: Some(-20.0 + time / 5.0),
                    variance: Some(1.0),
                    covariates: BTreeMap::from([
                        ("mdur".to_string(), 12.0),
                        ("mbase".to_string(), 50.0),
                    ]),
                })
            })
            .collect();
        LongTable::new(rows, vec!["mdur".to_string(), "mbase".to_string()]).normalize()
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            sampling: SamplingConfig {
                chains: 2,
                samples: 200,
                rhat_tolerance: 1.2,
                ..SamplingConfig::default()
            },
            parallel: true,
            ..PipelineOptions::default()
        }
    }

    fn variants() -> Vec<ModelSpec> {
        let gaussian = ModelSpec::builder("linear_gaussian")
            .linear("time")
            .linear("mdur")
            .linear("mbase")
            .random_intercept("study_id")
            .prior(CoefClass::FixedEffect, Prior::Normal { mu: 0.0, sigma: 10.0 })
            .prior(CoefClass::GroupSd, Prior::Exponential { rate: 0.2 })
            .prior(CoefClass::Sigma, Prior::Exponential { rate: 0.2 })
            .build()
            .unwrap();
        let student = gaussian.with_noise_family(NoiseFamily::StudentT);
        vec![gaussian, student]
    }

    #[test]
    fn test_fit_all_preserves_variant_order() {
        let pipeline = AnalysisPipeline::new(
            table(),
            Arc::new(MockSampler::well_behaved()),
            options(),
        );
        let artifacts = pipeline.fit_all(&variants()).unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].name(), "linear_gaussian");
        assert_eq!(artifacts[1].name(), "linear_student");
    }

    #[test]
    fn test_parallel_and_serial_agree() {
        let data = table();
        let serial = AnalysisPipeline::new(
            data.clone(),
            Arc::new(MockSampler::well_behaved()),
            PipelineOptions {
                parallel: false,
                ..options()
            },
        );
        let parallel = AnalysisPipeline::new(
            data,
            Arc::new(MockSampler::well_behaved()),
            options(),
        );
        let a = serial.fit_all(&variants()).unwrap();
        let b = parallel.fit_all(&variants()).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.draws(), y.draws());
        }
    }

    #[test]
    fn test_end_to_end_compare() {
        let pipeline = AnalysisPipeline::new(
            table(),
            Arc::new(MockSampler::well_behaved()),
            options(),
        );
        let artifacts = pipeline.fit_all(&variants()).unwrap();
        let comparison = pipeline
            .compare(&artifacts, &ImportanceSamplingLoo::default(), false)
            .unwrap();
        assert_eq!(comparison.rows().len(), 2);
        // Every reported row carries its uncertainty.
        for row in comparison.rows() {
            assert!(row.se.is_finite());
        }
    }
}
