use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Datagram too short: need {required} bytes, got {actual}")]
    TooShort { required: usize, actual: usize },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

/// Outcome of relay establishment. A closed set: establishment never panics
/// and expected refusals are values, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayResult {
    Success,
    ConnectionFailure,
    /// The circuit already holds its maximum number of hops
    SerialRelayLimit,
    /// The relay node refused: too many concurrent exchanges
    RelayExchangeLimit,
    InvalidEndpoint,
    DuplicateEndpoint,
    DuplicateRelayId,
}

impl RelayResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for RelayResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::ConnectionFailure => "connection failure",
            Self::SerialRelayLimit => "serial relay limit reached",
            Self::RelayExchangeLimit => "relay exchange limit reached",
            Self::InvalidEndpoint => "invalid endpoint",
            Self::DuplicateEndpoint => "duplicate endpoint",
            Self::DuplicateRelayId => "duplicate relay id",
        };
        f.write_str(name)
    }
}
