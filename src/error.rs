//! Error taxonomy shared by every pipeline stage.
//!
//! Pure components return `Result<_, PipelineError>`. Stage code wraps these in
//! `anyhow::Error` together with IO context; callers recover the typed value with
//! `downcast_ref::<PipelineError>()`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input table not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    #[error("column(s) not found: {} (available: {})", missing.join(", "), available.join(", "))]
    ColumnNotFound {
        missing: Vec<String>,
        available: Vec<String>,
    },

    #[error("embedding backend unavailable for '{model_id}': {reason}")]
    BackendUnavailable { model_id: String, reason: String },

    #[error("embedding backend '{model_id}' requires credentials: set {env_var}")]
    BackendAuthRequired { model_id: String, env_var: String },

    #[error("degenerate input: {rows} rows, at least {required} required ({reason})")]
    DegenerateInput {
        rows: usize,
        required: usize,
        reason: String,
    },

    #[error("invalid cluster level {level}: must be between 1 and {rows}")]
    InvalidClusterLevel { level: usize, rows: usize },

    #[error("invalid top-n {top_n}: must be at least 1")]
    InvalidTopN { top_n: usize },

    #[error("missing upstream artifact for {stage} stage: {}", path.display())]
    MissingUpstreamArtifact { stage: String, path: PathBuf },

    #[error("row count mismatch: {vectors} vectors vs {metadata} metadata rows")]
    RowCountMismatch { vectors: usize, metadata: usize },

    #[error("dimension mismatch at row {row}: expected {expected}, found {actual}")]
    DimensionMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("column '{column}' already exists")]
    DuplicateColumn { column: String },

    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("malformed {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
}

impl PipelineError {
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
