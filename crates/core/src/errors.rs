//! Shared error type for the local store and sync pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Remote call failed in a way that is expected to succeed on retry
    /// (network drop, 5xx, rate limit). Queue entries are retained.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The remote rejected the payload itself. Retrying the same entry
    /// can never succeed, so the caller drops it.
    #[error("remote rejected payload: {0}")]
    Validation(String),

    /// Remote row does not exist. For updates and deletes this means the
    /// stores already converged.
    #[error("remote record not found")]
    NotFound,

    #[error("timed out waiting for the sync queue to drain")]
    Timeout,
}

impl Error {
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Transient(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// True when the failure should leave queue entries in place for a
    /// later cycle instead of dropping them.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Timeout)
    }
}
