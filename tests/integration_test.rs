//! End-to-end pipeline test: write a wide-format Parquet file, load it,
//! reshape and normalize, fit paired model variants through a stub sampler,
//! and compare them.

use arrow::array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use dbs_meta::dataset::{AnalysisTable, OccasionColumns, OccasionLayout, WideTable};
use dbs_meta::fit::{DrawCollection, DriverOptions, FitDriver, Sampler, SamplingConfig};
use dbs_meta::model::{CoefClass, ModelSpec, NoiseFamily, Prior, Term};
use dbs_meta::pipeline::{AnalysisPipeline, PipelineOptions};
use dbs_meta::report::ImportanceSamplingLoo;
use dbs_meta::{Error, Result};
use parquet::arrow::ArrowWriter;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Deterministic stand-in for the external MCMC engine.
struct StubSampler {
    calls: AtomicUsize,
}

impl StubSampler {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn uniform(state: &mut u64) -> f64 {
        *state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (*state >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Sum of uniforms, roughly normal (Irwin-Hall).
    fn noise(state: &mut u64) -> f64 {
        (0..12).map(|_| Self::uniform(state)).sum::<f64>() - 6.0
    }
}

impl Sampler for StubSampler {
    fn sample(
        &self,
        spec: &ModelSpec,
        data: &AnalysisTable,
        config: &SamplingConfig,
    ) -> Result<DrawCollection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = config.seed.wrapping_add(spec.fingerprint()) | 1;
        let mut draws = DrawCollection::new(config.chains, config.samples, config.prior_only);

        let mut names = vec!["Intercept".to_string(), "sigma".to_string()];
        for term in spec.terms() {
            if let Term::Linear { name } = term {
                names.push(format!("b_{name}"));
            }
        }
        if spec.noise_family() == NoiseFamily::StudentT {
            names.push("nu".to_string());
        }
        for name in &names {
            let chains: Vec<Vec<f64>> = (0..config.chains)
                .map(|_| {
                    (0..config.samples)
                        .map(|_| 1.0 + Self::noise(&mut state))
                        .collect()
                })
                .collect();
            draws.add_parameter(name.clone(), chains)?;
        }

        let total = config.chains * config.samples;
        let log_lik: Vec<Vec<f64>> = (0..total)
            .map(|_| {
                (0..data.len())
                    .map(|_| -2.0 - 0.5 * Self::uniform(&mut state))
                    .collect()
            })
            .collect();
        draws.set_log_lik(log_lik)?;
        let locations: Vec<Vec<f64>> = (0..total)
            .map(|_| {
                data.observations()
                    .iter()
                    .map(|obs| obs.effect + Self::noise(&mut state))
                    .collect()
            })
            .collect();
        draws.set_obs_location(locations)?;
        Ok(draws)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn dbs_layout() -> OccasionLayout {
    OccasionLayout::from_column_groups(
        "study",
        vec!["mdur".to_string(), "mbase".to_string()],
        (1..=4).map(|i| format!("es{i}")).collect(),
        (1..=4).map(|i| format!("var{i}")).collect(),
        vec![3.0, 6.0, 12.0, 24.0],
    )
    .unwrap()
}

/// Three studies, four complete occasions each.
fn write_wide_parquet(path: &Path) {
    let mut fields = vec![
        Field::new("study", DataType::Utf8, false),
        Field::new("mdur", DataType::Float64, false),
        Field::new("mbase", DataType::Float64, false),
    ];
    for i in 1..=4 {
        fields.push(Field::new(format!("es{i}"), DataType::Float64, true));
        fields.push(Field::new(format!("var{i}"), DataType::Float64, true));
    }
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec!["Schuepbach", "Deuschl", "Weaver"])),
        Arc::new(Float64Array::from(vec![11.0, 13.2, 12.4])),
        Arc::new(Float64Array::from(vec![48.0, 52.5, 43.0])),
    ];
    for occ in 0..4u32 {
        let drift = f64::from(occ);
        columns.push(Arc::new(Float64Array::from(vec![
            -20.0 + drift,
            -17.5 + drift,
            -22.0 + drift,
        ])));
        columns.push(Arc::new(Float64Array::from(vec![0.8, 1.1, 0.9])));
    }
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns).unwrap();

    let file = std::fs::File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

fn sampling_config() -> SamplingConfig {
    SamplingConfig {
        chains: 2,
        warmup: 100,
        samples: 300,
        rhat_tolerance: 1.2,
        ..SamplingConfig::default()
    }
}

fn paired_variants() -> Vec<ModelSpec> {
    let gaussian = ModelSpec::builder("linear_gaussian")
        .linear("time")
        .linear("mdur")
        .linear("mbase")
        .random_intercept("study_id")
        .prior(
            CoefClass::FixedEffect,
            Prior::Normal { mu: 0.0, sigma: 10.0 },
        )
        .prior(
            CoefClass::Intercept,
            Prior::Normal { mu: -20.0, sigma: 10.0 },
        )
        .prior(CoefClass::GroupSd, Prior::Exponential { rate: 0.2 })
        .prior(CoefClass::Sigma, Prior::Exponential { rate: 0.2 })
        .build()
        .unwrap();
    let student = gaussian.with_noise_family(NoiseFamily::StudentT);
    vec![gaussian, student]
}

#[test]
fn test_parquet_roundtrip_produces_normalized_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbs.parquet");
    write_wide_parquet(&path);

    let wide = WideTable::load_parquet(&path).unwrap();
    assert_eq!(wide.num_studies(), 3);

    let data = wide.to_long(&dbs_layout()).unwrap().normalize();
    // 3 studies x 4 occasions, nothing missing
    assert_eq!(data.len(), 12);
    assert_eq!(data.n_studies(), 3);
    let ids: Vec<u32> = data.observations().iter().map(|o| o.study_id).collect();
    assert_eq!(ids, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    let times: Vec<f64> = data.observations().iter().map(|o| o.time).collect();
    assert_eq!(times, [3.0, 6.0, 12.0, 24.0].repeat(3));
    // First-appearance order of the wide rows is preserved.
    assert_eq!(data.observations()[0].study_key, "Schuepbach");
    assert_eq!(data.observations()[8].study_key, "Weaver");
}

#[test]
fn test_full_pipeline_fit_and_compare() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbs.parquet");
    write_wide_parquet(&path);

    let wide = WideTable::load_parquet(&path).unwrap();
    let pipeline = AnalysisPipeline::from_wide(
        &wide,
        &dbs_layout(),
        Arc::new(StubSampler::new()),
        PipelineOptions {
            sampling: sampling_config(),
            parallel: true,
            ..PipelineOptions::default()
        },
    )
    .unwrap();

    let artifacts = pipeline.fit_all(&paired_variants()).unwrap();
    assert!(artifacts.iter().all(|a| a.reliability().is_reliable()));

    let comparison = pipeline
        .compare(&artifacts, &ImportanceSamplingLoo::default(), false)
        .unwrap();
    assert_eq!(comparison.rows().len(), 2);
    for row in comparison.rows() {
        assert!(row.se.is_finite());
        assert!(row.se_diff.is_finite());
    }
    let rendered = comparison.to_string();
    assert!(rendered.contains("linear_gaussian"));
    assert!(rendered.contains("linear_student"));
}

#[test]
fn test_prior_for_absent_covariate_fails_before_sampling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbs.parquet");
    write_wide_parquet(&path);

    // Layout without the mdur covariate: the model below then references a
    // column the dataset does not carry.
    let layout = OccasionLayout::from_column_groups(
        "study",
        vec!["mbase".to_string()],
        (1..=4).map(|i| format!("es{i}")).collect(),
        (1..=4).map(|i| format!("var{i}")).collect(),
        vec![3.0, 6.0, 12.0, 24.0],
    )
    .unwrap();
    let wide = WideTable::load_parquet(&path).unwrap();
    let data = wide.to_long(&layout).unwrap().normalize();

    let spec = ModelSpec::builder("needs_mdur")
        .linear("mdur")
        .linear("mbase")
        .prior(
            CoefClass::Coefficient("mdur".to_string()),
            Prior::Normal { mu: 0.0, sigma: 5.0 },
        )
        .prior(
            CoefClass::FixedEffect,
            Prior::Normal { mu: 0.0, sigma: 10.0 },
        )
        .build()
        .unwrap();

    let sampler = Arc::new(StubSampler::new());
    let driver = FitDriver::new(
        Arc::clone(&sampler) as Arc<dyn Sampler>,
        DriverOptions::default(),
    );
    let result = driver.fit(&spec, &data, &sampling_config());
    assert!(matches!(result, Err(Error::SpecificationError(_))));
    assert_eq!(sampler.calls.load(Ordering::SeqCst), 0, "sampler must not run");
}

#[test]
fn test_prior_only_mode_flows_through() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbs.parquet");
    write_wide_parquet(&path);
    let wide = WideTable::load_parquet(&path).unwrap();

    let pipeline = AnalysisPipeline::from_wide(
        &wide,
        &dbs_layout(),
        Arc::new(StubSampler::new()),
        PipelineOptions {
            sampling: SamplingConfig {
                prior_only: true,
                ..sampling_config()
            },
            ..PipelineOptions::default()
        },
    )
    .unwrap();
    let artifact = pipeline.fit(&paired_variants()[0]).unwrap();
    assert!(artifact.draws().prior_only());
}

#[test]
fn test_all_missing_study_leaves_no_id_gap() {
    // Second study has every occasion missing; its id must not be skipped.
    let schema = Arc::new(Schema::new(vec![
        Field::new("study", DataType::Utf8, false),
        Field::new("es1", DataType::Float64, true),
        Field::new("es2", DataType::Float64, true),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec!["A", "B", "C"])),
        Arc::new(Float64Array::from(vec![Some(-20.0), None, Some(-18.0)])),
        Arc::new(Float64Array::from(vec![Some(-21.0), None, Some(-19.0)])),
    ];
    let wide = WideTable::new(RecordBatch::try_new(schema, columns).unwrap());
    let layout = OccasionLayout::new(
        "study",
        vec![],
        vec![
            OccasionColumns {
                outcome: "es1".to_string(),
                variance: None,
                time: 3.0,
            },
            OccasionColumns {
                outcome: "es2".to_string(),
                variance: None,
                time: 6.0,
            },
        ],
    )
    .unwrap();

    let data = wide.to_long(&layout).unwrap().normalize();
    assert_eq!(data.n_studies(), 2);
    let keys: Vec<&str> = data
        .observations()
        .iter()
        .map(|o| o.study_key.as_str())
        .collect();
    assert_eq!(keys, vec!["A", "A", "C", "C"]);
    let ids: Vec<u32> = data.observations().iter().map(|o| o.study_id).collect();
    assert_eq!(ids, vec![1, 1, 2, 2]);
}
