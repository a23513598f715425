//! Error types for the remote store crate.

use thiserror::Error;

/// Result type alias for remote store operations.
pub type Result<T> = std::result::Result<T, RemoteStoreError>;

/// Retry policy class for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Errors that can occur while talking to the REST backend.
#[derive(Debug, Error)]
pub enum RemoteStoreError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error response from the REST backend
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (missing required data, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (missing or invalid key)
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl RemoteStoreError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(_) => ApiRetryClass::Retryable,
            Self::Json(_) => ApiRetryClass::Permanent,
            Self::InvalidRequest(_) => ApiRetryClass::Permanent,
            Self::Auth(_) => ApiRetryClass::ReauthRequired,
        }
    }
}

/// Translate into the taxonomy the sync engine acts on: missing rows
/// mean convergence, retryable and reauth classes retain queue entries,
/// everything else is a payload rejection.
impl From<RemoteStoreError> for ledgerpouch_core::Error {
    fn from(err: RemoteStoreError) -> Self {
        if err.status_code() == Some(404) {
            return ledgerpouch_core::Error::NotFound;
        }
        match err.retry_class() {
            ApiRetryClass::Retryable | ApiRetryClass::ReauthRequired => {
                ledgerpouch_core::Error::transient(err.to_string())
            }
            ApiRetryClass::Permanent => ledgerpouch_core::Error::validation(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_classify_for_retry() {
        assert_eq!(
            RemoteStoreError::api(503, "down").retry_class(),
            ApiRetryClass::Retryable
        );
        assert_eq!(
            RemoteStoreError::api(429, "slow down").retry_class(),
            ApiRetryClass::Retryable
        );
        assert_eq!(
            RemoteStoreError::api(400, "bad row").retry_class(),
            ApiRetryClass::Permanent
        );
        assert_eq!(
            RemoteStoreError::api(401, "expired").retry_class(),
            ApiRetryClass::ReauthRequired
        );
    }

    #[test]
    fn conversion_preserves_the_engine_taxonomy() {
        let gone: ledgerpouch_core::Error = RemoteStoreError::api(404, "no row").into();
        assert!(matches!(gone, ledgerpouch_core::Error::NotFound));

        let busy: ledgerpouch_core::Error = RemoteStoreError::api(503, "down").into();
        assert!(busy.is_transient());

        let bad: ledgerpouch_core::Error = RemoteStoreError::api(422, "bad").into();
        assert!(matches!(bad, ledgerpouch_core::Error::Validation(_)));
    }
}
