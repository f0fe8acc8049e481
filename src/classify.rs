//! Error classification and recovery strategy selection (spec §4.10).
//!
//! The taxonomy is closed and exhaustive for the classifier: every
//! [`PulseError`] maps to exactly one [`ErrorClass`], falling back to
//! `Unknown` for anything the mapping table doesn't recognize — `unknown`
//! is reserved, never silently consumed, per spec.
//!
//! A flat, documented set of variants a caller matches exhaustively, split
//! into a two-step process (classify, then look up a strategy) instead of
//! one enum doing both jobs.

use crate::error::PulseError;

/// Deterministic, data-driven error class. Unknown signatures fall back to
/// [`ErrorClass::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    DataInvalidInput,
    DataSchemaMismatch,
    DataMissingFeatures,
    DataIntegrity,
    ModelInitialization,
    ModelDivergence,
    ModelResourceExhausted,
    StoragePermission,
    StorageNotFound,
    StorageIo,
    StorageIntegrity,
    NetworkConnect,
    NetworkTimeout,
    NetworkRemoteError,
    SystemResource,
    SystemCancelled,
    SystemBudgetExceeded,
    Unknown,
}

/// The recovery action the Coordinator should take for a given
/// [`ErrorClass`] (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry with backoff; the batch may be re-attempted in place.
    RetryWithBackoff,
    /// Resume from the latest checkpoint.
    ResumeFromCheckpoint,
    /// Abandon this batch only; the run continues.
    AbortBatchOnly,
    /// Abandon the whole run unless an operator raises the constraint.
    AbortRun,
}

/// Classify a [`PulseError`] into its taxonomy class.
pub fn classify(err: &PulseError) -> ErrorClass {
    use ErrorClass::*;
    match err {
        PulseError::InvalidInput(_) | PulseError::InvalidUpdate(_) => DataInvalidInput,
        PulseError::SchemaMismatch(_) | PulseError::SchemaInvalid(_) | PulseError::ValidationError(_) => {
            DataSchemaMismatch
        }
        PulseError::InsufficientData { .. } => DataMissingFeatures,
        PulseError::IntegrityError { .. } | PulseError::InvalidContentHash(_) => DataIntegrity,
        PulseError::ModelDivergence(_) => ModelDivergence,
        PulseError::ResourceExhausted(_) => ModelResourceExhausted,
        PulseError::NotFound(_) | PulseError::RunNotFound(_) => StorageNotFound,
        PulseError::IoError(_) => StorageIo,
        PulseError::Timeout => NetworkTimeout,
        PulseError::NetworkError(_) => NetworkRemoteError,
        PulseError::Cancelled => SystemCancelled,
        PulseError::BudgetExceeded { .. } => SystemBudgetExceeded,
        PulseError::PipelineError { .. } => ModelInitialization,
        PulseError::AdapterError { kind, .. } => match kind.as_str() {
            "connect" => NetworkConnect,
            "timeout" => NetworkTimeout,
            _ => NetworkRemoteError,
        },
        PulseError::BufferFull => SystemResource,
        PulseError::InvalidConfig(_) => DataInvalidInput,
        PulseError::SerializationError(_) => DataInvalidInput,
        PulseError::Unknown(_) => Unknown,
    }
}

/// Select the recovery strategy for a classified error.
pub fn strategy_for(class: ErrorClass) -> RecoveryStrategy {
    use ErrorClass::*;
    use RecoveryStrategy::*;
    match class {
        NetworkConnect | NetworkTimeout | NetworkRemoteError | StorageIo | SystemResource => {
            RetryWithBackoff
        }
        ModelDivergence | SystemCancelled => ResumeFromCheckpoint,
        DataInvalidInput | DataSchemaMismatch | DataMissingFeatures | DataIntegrity
        | StorageIntegrity | StoragePermission | StorageNotFound | ModelInitialization
        | ModelResourceExhausted => AbortBatchOnly,
        SystemBudgetExceeded => AbortRun,
        Unknown => AbortBatchOnly,
    }
}
