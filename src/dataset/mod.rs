//! Dataset loading and reshaping (Arrow/Parquet)
//!
//! Meta-analysis outcome data arrives in wide format: one row per study,
//! with each follow-up occasion's (outcome, variance) pair occupying a fixed
//! pair of columns. Everything downstream works on the long format: one row
//! per (study, occasion), study-level covariates repeated across occasions.
//!
//! The reshape is a pure transformation. Missing outcomes survive it as
//! explicit `None` markers; dropping them is the normalizer's job (see
//! [`LongTable::normalize`]), never the loader's.
//!
//! Row ordering out of [`WideTable::to_long`] is load-bearing: occasions are
//! emitted study-by-study in ascending time order, and per-study trend
//! plotting depends on it.

mod long;

pub use long::{AnalysisTable, LongRow, LongTable, Observation};

use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, Float32Array, Float64Array, Int32Array, Int64Array};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// One follow-up occasion's column pair in the wide table.
#[derive(Debug, Clone, PartialEq)]
pub struct OccasionColumns {
    /// Column holding the observed mean-difference outcome
    pub outcome: String,
    /// Column holding the sampling variance of the outcome, if recorded
    pub variance: Option<String>,
    /// Follow-up time this occasion represents (e.g. months since surgery)
    pub time: f64,
}

/// Declares how a wide-format table maps onto (study, occasion) rows.
///
/// The layout is fixed by convention for a given dataset — the motivating
/// deep-brain-stimulation tables carry four occasion pairs — and is validated
/// once, up front, so that a malformed declaration fails before any fitting.
#[derive(Debug, Clone, PartialEq)]
pub struct OccasionLayout {
    study: String,
    covariates: Vec<String>,
    occasions: Vec<OccasionColumns>,
}

impl OccasionLayout {
    /// Build a layout from an explicit occasion list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaError`] if no occasions are declared or the
    /// declared occasion times are not strictly increasing.
    pub fn new(
        study: impl Into<String>,
        covariates: Vec<String>,
        occasions: Vec<OccasionColumns>,
    ) -> Result<Self> {
        if occasions.is_empty() {
            return Err(Error::SchemaError(
                "occasion layout declares no occasion column pairs".to_string(),
            ));
        }
        for pair in occasions.windows(2) {
            if pair[1].time <= pair[0].time {
                return Err(Error::SchemaError(format!(
                    "occasion times must be strictly increasing, got {} then {}",
                    pair[0].time, pair[1].time
                )));
            }
        }
        Ok(Self {
            study: study.into(),
            covariates,
            occasions,
        })
    }

    /// Build a layout from parallel outcome/variance column lists.
    ///
    /// This is the shape the check in spec'd datasets takes: a list of
    /// outcome columns, a list of variance columns, and the time each pair
    /// measures.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaError`] if the column groups do not align in
    /// length.
    pub fn from_column_groups(
        study: impl Into<String>,
        covariates: Vec<String>,
        outcome_columns: Vec<String>,
        variance_columns: Vec<String>,
        times: Vec<f64>,
    ) -> Result<Self> {
        if outcome_columns.len() != variance_columns.len()
            || outcome_columns.len() != times.len()
        {
            return Err(Error::SchemaError(format!(
                "occasion column groups do not align: {} outcome, {} variance, {} time entries",
                outcome_columns.len(),
                variance_columns.len(),
                times.len()
            )));
        }
        let occasions = outcome_columns
            .into_iter()
            .zip(variance_columns)
            .zip(times)
            .map(|((outcome, variance), time)| OccasionColumns {
                outcome,
                variance: Some(variance),
                time,
            })
            .collect();
        Self::new(study, covariates, occasions)
    }

    /// Name of the study grouping column.
    #[must_use]
    pub fn study_column(&self) -> &str {
        &self.study
    }

    /// Study-level covariate column names, repeated across occasions.
    #[must_use]
    pub fn covariate_columns(&self) -> &[String] {
        &self.covariates
    }

    /// Declared occasion column pairs, in ascending time order.
    #[must_use]
    pub fn occasions(&self) -> &[OccasionColumns] {
        &self.occasions
    }
}

/// A wide-format table: one row per study.
pub struct WideTable {
    batch: RecordBatch,
}

impl WideTable {
    /// Wrap an existing record batch.
    #[must_use]
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Load a wide table from a Parquet file.
    ///
    /// All row groups are concatenated into a single batch; meta-analysis
    /// tables are small (tens of studies), so this is never a memory concern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaError`] if the file cannot be read or parsed.
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
        use std::fs::File;

        let file = File::open(path.as_ref())
            .map_err(|e| Error::SchemaError(format!("failed to open Parquet file: {e}")))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| Error::SchemaError(format!("failed to parse Parquet file: {e}")))?;
        let schema = builder.schema().clone();
        let reader = builder
            .build()
            .map_err(|e| Error::SchemaError(format!("failed to create Parquet reader: {e}")))?;

        let mut batches = Vec::new();
        for batch in reader {
            let batch = batch
                .map_err(|e| Error::SchemaError(format!("failed to read record batch: {e}")))?;
            batches.push(batch);
        }
        let batch = arrow::compute::concat_batches(&schema, &batches)?;
        Ok(Self { batch })
    }

    /// The underlying record batch.
    #[must_use]
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Number of studies (wide rows).
    #[must_use]
    pub fn num_studies(&self) -> usize {
        self.batch.num_rows()
    }

    /// Reshape into long format: one row per (study, occasion).
    ///
    /// Occasions lacking a measurement yield a row with a missing outcome
    /// marker, not a dropped row. Output rows are ordered by study (input
    /// order) then occasion time ascending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaError`] if a declared column is absent or
    /// non-numeric, if a study key is null, or if two wide rows share a study
    /// key (the key would not be a stable grouping key).
    pub fn to_long(&self, layout: &OccasionLayout) -> Result<LongTable> {
        let study_keys = self.study_keys(layout.study_column())?;

        let covariate_arrays: Vec<(&String, ArrayRef)> = layout
            .covariate_columns()
            .iter()
            .map(|name| Ok((name, self.column(name)?)))
            .collect::<Result<_>>()?;
        let occasion_arrays: Vec<(ArrayRef, Option<ArrayRef>)> = layout
            .occasions()
            .iter()
            .map(|occ| {
                let outcome = self.column(&occ.outcome)?;
                let variance = occ
                    .variance
                    .as_ref()
                    .map(|name| self.column(name))
                    .transpose()?;
                Ok((outcome, variance))
            })
            .collect::<Result<_>>()?;

        let mut rows = Vec::with_capacity(self.num_studies() * layout.occasions().len());
        for row in 0..self.num_studies() {
            let mut covariates = BTreeMap::new();
            for (name, array) in &covariate_arrays {
                let value = numeric_value(array, row)?.ok_or_else(|| {
                    Error::SchemaError(format!(
                        "covariate '{name}' is missing for study '{}'",
                        study_keys[row]
                    ))
                })?;
                covariates.insert((*name).clone(), value);
            }
            for (occ, (outcome, variance)) in layout.occasions().iter().zip(&occasion_arrays) {
                rows.push(LongRow {
                    study_key: study_keys[row].clone(),
                    time: occ.time,
                    effect: numeric_value(outcome, row)?,
                    variance: variance
                        .as_ref()
                        .map(|array| numeric_value(array, row))
                        .transpose()?
                        .flatten(),
                    covariates: covariates.clone(),
                });
            }
        }

        Ok(LongTable::new(rows, layout.covariate_columns().to_vec()))
    }

    /// Extract study keys as strings, rejecting nulls and duplicates.
    fn study_keys(&self, column: &str) -> Result<Vec<String>> {
        let array = self.column(column)?;
        let mut keys = Vec::with_capacity(array.len());
        for row in 0..array.len() {
            if array.is_null(row) {
                return Err(Error::SchemaError(format!(
                    "study column '{column}' is null at row {row}; not a stable grouping key"
                )));
            }
            keys.push(stringify_key(&array, row)?);
        }
        let mut seen = HashSet::new();
        for key in &keys {
            if !seen.insert(key.as_str()) {
                return Err(Error::SchemaError(format!(
                    "study key '{key}' appears in more than one wide row; not a stable grouping key"
                )));
            }
        }
        Ok(keys)
    }

    fn column(&self, name: &str) -> Result<ArrayRef> {
        self.batch
            .column_by_name(name)
            .cloned()
            .ok_or_else(|| Error::SchemaError(format!("declared column '{name}' not found")))
    }
}

/// Read a numeric cell as `f64`, `None` for null.
fn numeric_value(array: &ArrayRef, row: usize) -> Result<Option<f64>> {
    if array.is_null(row) {
        return Ok(None);
    }
    let value = match array.data_type() {
        DataType::Float64 => as_typed::<Float64Array>(array)?.value(row),
        DataType::Float32 => f64::from(as_typed::<Float32Array>(array)?.value(row)),
        #[allow(clippy::cast_precision_loss)]
        DataType::Int64 => as_typed::<Int64Array>(array)?.value(row) as f64,
        DataType::Int32 => f64::from(as_typed::<Int32Array>(array)?.value(row)),
        other => {
            return Err(Error::SchemaError(format!(
                "expected a numeric column, got {other:?}"
            )))
        }
    };
    Ok(Some(value))
}

/// Render a study key cell as a string, for any supported key type.
fn stringify_key(array: &ArrayRef, row: usize) -> Result<String> {
    use arrow::array::StringArray;
    match array.data_type() {
        DataType::Utf8 => Ok(as_typed::<StringArray>(array)?.value(row).to_string()),
        DataType::Int64 => Ok(as_typed::<Int64Array>(array)?.value(row).to_string()),
        DataType::Int32 => Ok(as_typed::<Int32Array>(array)?.value(row).to_string()),
        DataType::Float64 => Ok(as_typed::<Float64Array>(array)?.value(row).to_string()),
        other => Err(Error::SchemaError(format!(
            "study column has unsupported type {other:?}"
        ))),
    }
}

fn as_typed<T: 'static>(array: &ArrayRef) -> Result<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::SchemaError("column type mismatch during downcast".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

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

    fn wide_batch(effects: &[[Option<f64>; 4]]) -> RecordBatch {
        let mut fields = vec![
            Field::new("study", DataType::Utf8, false),
            Field::new("mdur", DataType::Float64, false),
            Field::new("mbase", DataType::Float64, false),
        ];
        for i in 1..=4 {
            fields.push(Field::new(format!("es{i}"), DataType::Float64, true));
            fields.push(Field::new(format!("var{i}"), DataType::Float64, true));
        }
        let n = effects.len();
        let study = StringArray::from_iter_values((0..n).map(|i| format!("Study {}", i + 1)));
        #[allow(clippy::cast_precision_loss)]
        let mdur = Float64Array::from_iter_values((0..n).map(|i| 10.0 + i as f64));
        let mbase = Float64Array::from_iter_values((0..n).map(|_| 50.0));
        let mut columns: Vec<ArrayRef> = vec![Arc::new(study), Arc::new(mdur), Arc::new(mbase)];
        for occ in 0..4 {
            let es: Float64Array = effects.iter().map(|row| row[occ]).collect();
            let var: Float64Array = effects.iter().map(|row| row[occ].map(|_| 0.5)).collect();
            columns.push(Arc::new(es));
            columns.push(Arc::new(var));
        }
        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap()
    }

    #[test]
    fn test_to_long_row_count_and_order() {
        let full = [Some(-20.0), Some(-22.0), Some(-19.0), Some(-18.0)];
        let table = WideTable::new(wide_batch(&[full, full, full]));
        let long = table.to_long(&dbs_layout()).unwrap();

        // 3 studies x 4 occasions
        assert_eq!(long.len(), 12);
        let times: Vec<f64> = long.rows().iter().map(|r| r.time).collect();
        assert_eq!(times, [3.0, 6.0, 12.0, 24.0].repeat(3));
        assert_eq!(long.rows()[0].study_key, "Study 1");
        assert_eq!(long.rows()[4].study_key, "Study 2");
    }

    #[test]
    fn test_to_long_preserves_missing_outcomes() {
        let gappy = [Some(-20.0), None, Some(-19.0), None];
        let table = WideTable::new(wide_batch(&[gappy]));
        let long = table.to_long(&dbs_layout()).unwrap();

        assert_eq!(long.len(), 4);
        assert!(long.rows()[1].effect.is_none());
        assert!(long.rows()[3].effect.is_none());
        assert_eq!(long.rows()[0].variance, Some(0.5));
        assert!(long.rows()[1].variance.is_none());
    }

    #[test]
    fn test_to_long_repeats_covariates() {
        let full = [Some(-20.0), Some(-22.0), Some(-19.0), Some(-18.0)];
        let table = WideTable::new(wide_batch(&[full]));
        let long = table.to_long(&dbs_layout()).unwrap();

        for row in long.rows() {
            assert_eq!(row.covariates["mdur"], 10.0);
            assert_eq!(row.covariates["mbase"], 50.0);
        }
    }

    #[test]
    fn test_layout_rejects_misaligned_column_groups() {
        let result = OccasionLayout::from_column_groups(
            "study",
            vec![],
            vec!["es1".to_string(), "es2".to_string()],
            vec!["var1".to_string()],
            vec![3.0, 6.0],
        );
        assert!(matches!(result, Err(Error::SchemaError(_))));
    }

    #[test]
    fn test_layout_rejects_non_increasing_times() {
        let result = OccasionLayout::new(
            "study",
            vec![],
            vec![
                OccasionColumns {
                    outcome: "es1".to_string(),
                    variance: None,
                    time: 6.0,
                },
                OccasionColumns {
                    outcome: "es2".to_string(),
                    variance: None,
                    time: 3.0,
                },
            ],
        );
        assert!(matches!(result, Err(Error::SchemaError(_))));
    }

    #[test]
    fn test_to_long_rejects_missing_column() {
        let full = [Some(-20.0); 4];
        let table = WideTable::new(wide_batch(&[full]));
        let layout = OccasionLayout::from_column_groups(
            "study",
            vec!["mdur".to_string(), "years_since_dx".to_string()],
            (1..=4).map(|i| format!("es{i}")).collect(),
            (1..=4).map(|i| format!("var{i}")).collect(),
            vec![3.0, 6.0, 12.0, 24.0],
        )
        .unwrap();
        let result = table.to_long(&layout);
        assert!(matches!(result, Err(Error::SchemaError(_))));
    }

    #[test]
    fn test_to_long_rejects_duplicate_study_keys() {
        let full = [Some(-20.0); 4];
        let batch = wide_batch(&[full, full]);
        // Overwrite study column with duplicate keys
        let schema = batch.schema();
        let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
        columns[0] = Arc::new(StringArray::from(vec!["A", "A"]));
        let table = WideTable::new(RecordBatch::try_new(schema, columns).unwrap());

        let result = table.to_long(&dbs_layout());
        assert!(matches!(result, Err(Error::SchemaError(_))));
    }
}
