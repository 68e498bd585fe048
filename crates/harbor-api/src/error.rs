//! API error types

use harbor_crane::CraneError;
use harbor_proto::ContainerError;
use thiserror::Error;

/// Prefix marking an error message as retryable
pub const TEMPORARY_PREFIX: &str = "[temp] ";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not allowed: {0}")]
    Policy(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Retryable failure
    #[error("{0}")]
    Temporary(String),

    /// Error reported by the other end of a call
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("API shut down")]
    Abandoned,

    #[error("Call ended")]
    Ended,
}

impl ApiError {
    /// Classify an error message received in an `ERR` frame
    pub fn from_remote(message: &str) -> Self {
        match message.strip_prefix(TEMPORARY_PREFIX) {
            Some(rest) => ApiError::Temporary(rest.to_string()),
            None => ApiError::Remote(message.to_string()),
        }
    }

    /// Render the error for an `ERR` frame
    pub fn to_wire(&self) -> String {
        match self {
            ApiError::Temporary(msg) => format!("{}{}", TEMPORARY_PREFIX, msg),
            ApiError::Remote(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, ApiError::Temporary(_) | ApiError::Timeout(_))
    }
}

impl From<ContainerError> for ApiError {
    fn from(e: ContainerError) -> Self {
        ApiError::Protocol(e.to_string())
    }
}

impl From<CraneError> for ApiError {
    fn from(e: CraneError) -> Self {
        match e {
            CraneError::Timeout(what) => ApiError::Timeout(what),
            CraneError::Stopped => ApiError::Temporary("crane stopped".into()),
            other => ApiError::Protocol(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
