//! Long-format tables and the derived-field normalizer
//!
//! Two table types split the pipeline's invariant in the type system:
//! [`LongTable`] rows may carry a missing outcome; [`AnalysisTable`] rows
//! never do, and additionally carry a dense `1..=k` study id. The only way
//! to obtain an `AnalysisTable` is [`LongTable::normalize`], which filters
//! missing outcomes FIRST and renumbers over the surviving rows only — the
//! opposite order would leave gaps in the id sequence whenever an entire
//! study drops out.

use serde::Serialize;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// One (study, occasion) row before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct LongRow {
    /// Original study identifier, as it appeared in the wide table
    pub study_key: String,
    /// Follow-up time of this occasion
    pub time: f64,
    /// Observed outcome, `None` when the study skipped this occasion
    pub effect: Option<f64>,
    /// Sampling variance of the outcome, if recorded
    pub variance: Option<f64>,
    /// Study-level covariates, repeated across the study's occasions
    pub covariates: BTreeMap<String, f64>,
}

/// Long-format table with missing outcomes still present.
#[derive(Debug, Clone, PartialEq)]
pub struct LongTable {
    rows: Vec<LongRow>,
    covariate_names: Vec<String>,
}

impl LongTable {
    /// Build a long table from rows in study-then-time order.
    #[must_use]
    pub fn new(rows: Vec<LongRow>, covariate_names: Vec<String>) -> Self {
        Self {
            rows,
            covariate_names,
        }
    }

    /// All rows, in load order.
    #[must_use]
    pub fn rows(&self) -> &[LongRow] {
        &self.rows
    }

    /// Number of rows, missing outcomes included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Covariate column names carried per row.
    #[must_use]
    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    /// Drop missing-outcome rows, then assign dense study ids.
    ///
    /// Postconditions:
    /// - every output row has a present outcome;
    /// - study ids are exactly `1..=k` over the `k` surviving studies, in
    ///   order of first appearance (a study whose every occasion was missing
    ///   leaves no gap);
    /// - the row index restarts at 0 with no gaps;
    /// - rows are grouped by study id and time-ordered within each group.
    #[must_use]
    pub fn normalize(&self) -> AnalysisTable {
        let mut ids: BTreeMap<&str, u32> = BTreeMap::new();
        let mut next_id = 0u32;
        let mut observations = Vec::with_capacity(self.rows.len());

        // Renumbering runs strictly over surviving rows: a study filtered
        // out entirely must never consume an id.
        for row in &self.rows {
            let Some(effect) = row.effect else { continue };
            let study_id = *ids.entry(row.study_key.as_str()).or_insert_with(|| {
                next_id += 1;
                next_id
            });
            observations.push(Observation {
                row: 0,
                study_id,
                study_key: row.study_key.clone(),
                time: row.time,
                effect,
                variance: row.variance,
                covariates: row.covariates.clone(),
            });
        }

        observations.sort_by(|a, b| {
            (a.study_id, a.time)
                .partial_cmp(&(b.study_id, b.time))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (index, obs) in observations.iter_mut().enumerate() {
            obs.row = index;
        }

        AnalysisTable {
            observations,
            covariate_names: self.covariate_names.clone(),
            n_studies: next_id,
        }
    }
}

/// One measurement occasion within one study, post-normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    /// Contiguous 0-based row index within the analysis table
    pub row: usize,
    /// Dense study id in `1..=k`, order of first appearance
    pub study_id: u32,
    /// Original study identifier
    pub study_key: String,
    /// Follow-up time
    pub time: f64,
    /// Observed outcome; never missing here
    pub effect: f64,
    /// Sampling variance of the outcome, if recorded
    pub variance: Option<f64>,
    /// Study-level covariates
    pub covariates: BTreeMap<String, f64>,
}

/// Normalized analysis table: the working dataset every fit consumes.
///
/// Immutable once produced. Fitting drivers borrow it; nothing downstream
/// mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisTable {
    observations: Vec<Observation>,
    covariate_names: Vec<String>,
    n_studies: u32,
}

impl AnalysisTable {
    /// All observations, grouped by study id and time-ordered within group.
    #[must_use]
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Number of observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether the table has no observations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Number of distinct surviving studies (`k`; ids are `1..=k`).
    #[must_use]
    pub const fn n_studies(&self) -> u32 {
        self.n_studies
    }

    /// Covariate column names available to model terms.
    #[must_use]
    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    /// Whether a covariate column of this name exists.
    #[must_use]
    pub fn has_covariate(&self, name: &str) -> bool {
        self.covariate_names.iter().any(|c| c == name)
    }

    /// Observations of one study, time-ordered. Empty slice for unknown ids.
    ///
    /// Contiguity is guaranteed by the normalizer's sort, so this is a
    /// subslice, not a filtered copy.
    #[must_use]
    pub fn study(&self, study_id: u32) -> &[Observation] {
        let start = self
            .observations
            .partition_point(|obs| obs.study_id < study_id);
        let end = self
            .observations
            .partition_point(|obs| obs.study_id <= study_id);
        &self.observations[start..end]
    }

    /// Outcome vector, in row order.
    #[must_use]
    pub fn effects(&self) -> Vec<f64> {
        self.observations.iter().map(|obs| obs.effect).collect()
    }

    /// Forget derived fields, for re-running the normalizer.
    ///
    /// `to_long().normalize()` is the identity on an `AnalysisTable`.
    #[must_use]
    pub fn to_long(&self) -> LongTable {
        let rows = self
            .observations
            .iter()
            .map(|obs| LongRow {
                study_key: obs.study_key.clone(),
                time: obs.time,
                effect: Some(obs.effect),
                variance: obs.variance,
                covariates: obs.covariates.clone(),
            })
            .collect();
        LongTable::new(rows, self.covariate_names.clone())
    }

    /// Stable content fingerprint, used as the cache key's data component.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        for obs in &self.observations {
            obs.study_id.hash(&mut hasher);
            obs.study_key.hash(&mut hasher);
            obs.time.to_bits().hash(&mut hasher);
            obs.effect.to_bits().hash(&mut hasher);
            obs.variance.map(f64::to_bits).hash(&mut hasher);
            for (name, value) in &obs.covariates {
                name.hash(&mut hasher);
                value.to_bits().hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}
