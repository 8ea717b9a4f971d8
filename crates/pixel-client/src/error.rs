use std::time::Duration;

use pixel_types::{CellKey, ValidationError};

/// Why the change log could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("source token rejected")]
    Unauthorized,
    #[error("unknown source or table")]
    NotFound,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("malformed shape response: {0}")]
    Decode(String),
    #[error("change log shut down")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("change log unavailable: {0}")]
    Connection(#[from] ConnectionError),
    #[error("rejected: {0}")]
    Validation(String),
    #[error("username {0:?} is already taken")]
    DuplicateUsername(String),
    #[error("storage failed: {0}")]
    Storage(String),
    #[error("write to {key} was accepted but not confirmed within {waited:?}")]
    Stalled { key: CellKey, waited: Duration },
    #[error("local state: {0}")]
    Persist(String),
}

impl ClientError {
    /// Whether resubmitting the same write may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Storage(_) | Self::Stalled { .. })
    }
}

impl From<ValidationError> for ClientError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        Self::Persist(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persist(e.to_string())
    }
}
