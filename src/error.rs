//! Error Taxonomy
//!
//! Quota decisions are returned synchronously to the caller; log and
//! metrics failures are isolated inside their components and never fail a
//! request.

use thiserror::Error;
use uuid::Uuid;

/// Why a routing attempt was denied
///
/// Denials are recoverable: the caller may surface backpressure upward or
/// retry later as a new, independent attempt. The reason codes are stable
/// and distinguish exhausted quota from upstream outage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteDenied {
    /// Every eligible lane denied the reservation for lack of budget
    #[error("quota exhausted for model {model}")]
    QuotaExhausted { model: String },

    /// Every eligible lane is circuit-open
    #[error("all lanes circuit open for model {model}")]
    AllLanesCircuitOpen { model: String },

    /// No configured lane carries this model
    #[error("unknown model {model}")]
    UnknownModel { model: String },

    /// The caller supplied a zero token estimate
    #[error("estimated tokens must be greater than zero")]
    InvalidEstimate,
}

impl RouteDenied {
    /// Stable reason code written to the decision log
    pub fn reason(&self) -> &'static str {
        match self {
            RouteDenied::QuotaExhausted { .. } => "quota_exhausted",
            RouteDenied::AllLanesCircuitOpen { .. } => "all_lanes_circuit_open",
            RouteDenied::UnknownModel { .. } => "unknown_model",
            RouteDenied::InvalidEstimate => "invalid_estimate",
        }
    }
}

/// Errors from quota bookkeeping operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// The reservation token was never issued or already fully settled
    #[error("unknown reservation {0}")]
    UnknownReservation(Uuid),
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
