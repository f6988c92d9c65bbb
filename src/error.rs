//! Error taxonomy for the xAPI wrapper.
//!
//! Configuration and validation errors are raised synchronously before a
//! request is queued. Delivery errors arrive later through the
//! [`DeliveryHandle`](crate::queue::DeliveryHandle) returned at enqueue time.

use thiserror::Error;

/// Result type alias for wrapper operations.
pub type Result<T> = std::result::Result<T, XapiError>;

fn describe(named: &str, unnamed: &str, field: &Option<String>, message: &str) -> String {
    match field {
        Some(field) => format!("{} {}: {}", named, field, message),
        None => format!("{}: {}", unnamed, message),
    }
}

/// Invalid or missing connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", describe("Configuration error for", "Configuration error", .field, .message))]
pub struct ConfigError {
    pub message: String,
    /// Option key or environment variable the error refers to
    pub field: Option<String>,
}

impl ConfigError {
    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

/// A statement, query or state request that is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", describe("Invalid", "Invalid request", .field, .message))]
pub struct ValidationError {
    pub message: String,
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// Connection could not be established or was dropped
    #[error("network error: {0}")]
    Network(String),

    /// The per-attempt timeout elapsed
    #[error("request timed out")]
    Timeout,

    /// The LRS answered with a non-success status
    #[error("LRS responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The HTTP layer refused to construct the request
    #[error("malformed request: {0}")]
    Request(String),
}

impl DeliveryFailure {
    /// HTTP status code, if the LRS answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryFailure::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors surfaced by the wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XapiError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Network, 5xx or 429 failures that persisted through every attempt.
    #[error("delivery failed after {attempts} attempts: {failure}")]
    TransientDelivery {
        attempts: u32,
        failure: DeliveryFailure,
    },

    /// 4xx (other than 429) or a request the HTTP layer could not build.
    #[error("delivery rejected on attempt {attempts}: {failure}")]
    FatalDelivery {
        attempts: u32,
        failure: DeliveryFailure,
    },

    #[error("delivery cancelled before completion")]
    Cancelled,

    #[error("delivery queue shut down before the request resolved")]
    QueueClosed,

    #[error("no async runtime available: {0}")]
    Runtime(String),
}

impl XapiError {
    /// Whether the error class denotes transient unavailability.
    pub fn is_retryable(&self) -> bool {
        matches!(self, XapiError::TransientDelivery { .. })
    }

    /// Number of delivery attempts made before the error was surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            XapiError::TransientDelivery { attempts, .. }
            | XapiError::FatalDelivery { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}
