//! Error types for dbs-meta
//!
//! Malformed input (schema, specification) is fatal and aborts before any
//! sampling starts: fitting on malformed data fails silently into misleading
//! results, which this crate treats as strictly worse than failing fast.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// dbs-meta error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input shape (wide table columns, occasion layout, grouping key)
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Invalid model declaration (unknown coefficient, ill-posed smooth term)
    #[error("Specification error: {0}")]
    SpecificationError(String),

    /// The external sampler failed outright (numerical error, bad inputs)
    #[error("Sampler error: {0}")]
    SamplerError(String),

    /// Convergence diagnostics outside tolerance after a configuration-adjusted
    /// refit. Recoverable by resampling with a further-adjusted configuration.
    #[error("Convergence failure for model '{model}': {reasons:?}")]
    ConvergenceFailure {
        /// Name of the model specification that failed to converge
        model: String,
        /// Diagnostic findings (one entry per failed check)
        reasons: Vec<String>,
    },

    /// A comparison was requested over an artifact marked unreliable,
    /// without the explicit override
    #[error("Unreliable artifact '{0}' cannot be ranked; pass allow_unreliable to override")]
    UnreliableArtifact(String),

    /// Diagnostics requested generated quantities the sampler did not emit
    #[error("Missing draws: {0}")]
    MissingDraws(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
