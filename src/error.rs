//! Error types for the fracture engine.

use thiserror::Error;

/// Errors surfaced by the engine API.
///
/// Absent data is not an error: unknown sources and short windows degrade to
/// no-ops or low-confidence scores instead of failing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Non-finite sample value rejected at ingest.
    #[error("invalid sample for {subject_id}/{source_id}: {value} is not finite")]
    InvalidSample {
        subject_id: String,
        source_id: String,
        value: f64,
    },

    #[error("unknown subject: {0}")]
    UnknownSubject(String),

    #[error("subject already registered: {0}")]
    DuplicateSubject(String),

    /// Configuration failed validation; the previous configuration is kept.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown intervention {intervention_id} for subject {subject_id}")]
    UnknownIntervention {
        subject_id: String,
        intervention_id: String,
    },

    /// Each intervention takes a single outcome report.
    #[error("outcome already recorded for intervention {intervention_id} of subject {subject_id}")]
    OutcomeAlreadyRecorded {
        subject_id: String,
        intervention_id: String,
    },

    #[error("effectiveness must be within [0, 1], got {0}")]
    InvalidEffectiveness(f64),

    /// Monitoring needs an ambient tokio runtime.
    #[error("no async runtime available: {0}")]
    NoRuntime(String),
}

impl EngineError {
    /// Stable snake_case code, used in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSample { .. } => "invalid_sample",
            Self::UnknownSubject(_) => "unknown_subject",
            Self::DuplicateSubject(_) => "duplicate_subject",
            Self::InvalidConfig(_) => "invalid_config",
            Self::UnknownIntervention { .. } => "unknown_intervention",
            Self::OutcomeAlreadyRecorded { .. } => "outcome_already_recorded",
            Self::InvalidEffectiveness(_) => "invalid_effectiveness",
            Self::NoRuntime(_) => "no_runtime",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
