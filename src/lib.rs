//! # dbs-meta: Bayesian Meta-Analysis Pipeline
//!
//! A pipeline for repeated-measures meta-analysis of clinical outcomes —
//! the motivating dataset tracks symptom change after deep-brain stimulation
//! across follow-up occasions in multiple studies.
//!
//! The pipeline is a single forward data flow:
//!
//! 1. **Loader** — wide-format table (one row per study, fixed occasion
//!    column pairs) reshaped to long format ([`dataset`]).
//! 2. **Normalizer** — missing outcomes dropped, then dense study ids
//!    assigned over the surviving rows ([`dataset::LongTable::normalize`]).
//! 3. **Specification builder** — declarative terms plus per-coefficient
//!    priors, validated at build time ([`model`]).
//! 4. **Fitting driver** — delegates to a pluggable sampler, gates the
//!    result on convergence diagnostics, caches by content ([`fit`]).
//! 5. **Reporter** — predictive replicates, LOO comparison with uncertainty,
//!    prior sensitivity ([`report`]).
//!
//! Fitted artifacts are immutable; the reporter only borrows them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbs_meta::dataset::{OccasionLayout, WideTable};
//!
//! let layout = OccasionLayout::from_column_groups(
//!     "study",
//!     vec!["mdur".to_string(), "mbase".to_string()],
//!     vec!["es1".into(), "es2".into(), "es3".into(), "es4".into()],
//!     vec!["var1".into(), "var2".into(), "var3".into(), "var4".into()],
//!     vec![3.0, 6.0, 12.0, 24.0],
//! )?;
//! let wide = WideTable::load_parquet("data/dbs.parquet")?;
//! let data = wide.to_long(&layout)?.normalize();
//! println!("{} studies, {} observations", data.n_studies(), data.len());
//! # Ok::<(), dbs_meta::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod dataset;
pub mod error;
pub mod fit;
pub mod model;
pub mod pipeline;
pub mod report;

pub use error::{Error, Result};
