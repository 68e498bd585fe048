//! Engine errors

use harbor_api::ApiError;
use harbor_crane::CraneError;
use harbor_tinker::TinkerError;
use harbor_transport::ShipError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Crane error: {0}")]
    Crane(#[from] CraneError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Transport error: {0}")]
    Ship(#[from] ShipError),

    #[error("Crypto error: {0}")]
    Tinker(#[from] TinkerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity store error: {0}")]
    Store(String),

    #[error("Engine shut down")]
    Shutdown,
}

pub type EngineResult<T> = Result<T, EngineError>;
