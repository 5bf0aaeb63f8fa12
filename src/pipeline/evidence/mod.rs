pub mod types;
pub mod normalize;
pub mod prompt;
pub mod ollama_types;
pub mod ollama;
pub mod retry;
pub mod validation;
pub mod classify;
pub mod orchestrator;


pub use types::*;
pub use normalize::*;
pub use prompt::*;
pub use ollama::*;
pub use retry::*;
pub use validation::*;
pub use classify::*;
pub use orchestrator::*;

use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the evidence pipeline.
///
/// The first three variants are the only failures a pipeline call can end
/// with. `InvalidImage` and `Config` are raised while building inputs or the
/// gateway, before any call is made.
#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("Vision inference unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("Vision inference did not answer within {deadline_ms} ms")]
    InferenceTimeout { deadline_ms: u64 },

    #[error("Model response violates the findings schema: {0}")]
    SchemaViolation(String),

    #[error("Invalid evidence image: {0}")]
    InvalidImage(String),

    #[error("Invalid gateway configuration: {0}")]
    Config(String),
}

impl EvidenceError {
    pub fn timeout(deadline: Duration) -> Self {
        Self::InferenceTimeout {
            deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// True when the remote model could not produce an answer at all.
    pub fn is_inference_failure(&self) -> bool {
        matches!(
            self,
            Self::InferenceUnavailable(_) | Self::InferenceTimeout { .. }
        )
    }

    /// Stable machine-readable code, so callers can tell "not evaluated"
    /// apart from any alert level.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InferenceUnavailable(_) => "INFERENCE_UNAVAILABLE",
            Self::InferenceTimeout { .. } => "INFERENCE_TIMEOUT",
            Self::SchemaViolation(_) => "SCHEMA_VIOLATION",
            Self::InvalidImage(_) => "INVALID_IMAGE",
            Self::Config(_) => "CONFIG",
        }
    }
}
