use thiserror::Error;

use crate::feed::{FetchError, ParseError};
use crate::storage::StoreError;

/// Errors surfaced by sync operations, across both local and remote accounts.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Feed or protocol payload could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),
    /// Network-level failure (DNS, connection, TLS, HTTP status).
    #[error("Network error: {0}")]
    Network(String),
    /// Operation exceeded its deadline.
    #[error("Request timed out")]
    Timeout,
    /// Remote service rejected the credentials.
    #[error("Authentication failed")]
    Auth,
    /// The active account kind does not support this operation.
    #[error("Operation not supported by this account type")]
    NotSupported,
    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Store(String),
}

impl From<ParseError> for SyncError {
    fn from(e: ParseError) -> Self {
        SyncError::Parse(e.to_string())
    }
}

impl From<FetchError> for SyncError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Timeout => SyncError::Timeout,
            other => SyncError::Network(other.to_string()),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout
        } else {
            SyncError::Network(e.to_string())
        }
    }
}
