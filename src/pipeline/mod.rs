pub mod policy;
pub mod ollama;
pub mod perception;
pub mod aggregation;
pub mod explanation;
pub mod composer;
pub mod lifecycle;
pub mod orchestrator;
pub mod validation;

pub use composer::*;
pub use orchestrator::*;

use thiserror::Error;

use policy::FailureKind;

/// Error raised by a perception or explanation adapter call.
///
/// Adapters map these to a [`FailureKind`] through `classify_error`; the
/// default mapping is [`AdapterError::default_kind`].
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Adapter call timed out: {0}")]
    Timeout(String),

    #[error("Model output breaks its contract: {0}")]
    InvalidOutput(String),

    #[error("Model service unavailable: {0}")]
    Unavailable(String),

    #[error("Model service returned error (status {status}): {body}")]
    Service { status: u16, body: String },

    #[error("Input rejected by adapter: {0}")]
    InvalidInput(String),

    #[error("Adapter not configured: {0}")]
    NotConfigured(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdapterError {
    pub fn default_kind(&self) -> FailureKind {
        match self {
            AdapterError::Timeout(_) => FailureKind::Timeout,
            AdapterError::InvalidOutput(_) | AdapterError::Json(_) => FailureKind::InvalidOutput,
            AdapterError::Unavailable(_) => FailureKind::TransientFailure,
            // Overloaded or restarting model services answer 5xx/429.
            AdapterError::Service { status, .. } if *status >= 500 || *status == 429 => {
                FailureKind::TransientFailure
            }
            AdapterError::Service { .. } => FailureKind::Fatal,
            AdapterError::InvalidInput(_) | AdapterError::NotConfigured(_) => FailureKind::Fatal,
        }
    }
}
