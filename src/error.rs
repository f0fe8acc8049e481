//! Crate-wide error taxonomy.
//!
//! One `#[non_exhaustive]` enum with `#[error(...)]` messages per variant
//! and `#[from]` conversions at the edges, so callers match on a closed,
//! documented set instead of catching a boxed `dyn Error`.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PulseError>;

/// Errors surfaced across the Recursive Training Core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PulseError {
    // --- Store ---
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("integrity error reading {item_id}: checksum mismatch (expected {expected}, got {actual})")]
    IntegrityError {
        item_id: String,
        expected: String,
        actual: String,
    },

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("budget exceeded: {category} over by {over_by}")]
    BudgetExceeded { category: String, over_by: f64 },

    #[error("invalid content hash: {0}")]
    InvalidContentHash(String),

    // --- Trust ---
    #[error("invalid trust update: {0}")]
    InvalidUpdate(String),

    // --- Trust buffer ---
    #[error("trust update buffer full")]
    BufferFull,

    // --- Feature processor ---
    #[error("pipeline step {step_id} failed: {cause}")]
    PipelineError { step_id: String, cause: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("insufficient data for window step: need {needed}, have {have}")]
    InsufficientData { needed: usize, have: usize },

    // --- Ingestion / adapters ---
    #[error("adapter error ({kind}): {cause}")]
    AdapterError { kind: String, cause: String },

    #[error("validation error: {0}")]
    ValidationError(String),

    // --- Coordinator / workers ---
    #[error("batch cancelled")]
    Cancelled,

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("worker resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("model divergence: {0}")]
    ModelDivergence(String),

    // --- Config ---
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // --- Generic ---
    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("timed out")]
    Timeout,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unclassified error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for PulseError {
    fn from(err: serde_json::Error) -> Self {
        PulseError::SerializationError(err.to_string())
    }
}
