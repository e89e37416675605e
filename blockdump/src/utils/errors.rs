//! Error types shared by the engines and the job manager.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single remote call.
///
/// The first three variants are transient and retried by
/// [`RetryingClient`](crate::remote::RetryingClient); everything else
/// propagates immediately.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Remote server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RemoteError>,
    },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_) | RemoteError::RateLimited { .. } | RemoteError::Server { .. }
        )
    }

    /// Server-requested minimum delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Transport failures, including broken or timed-out bodies, are retryable.
/// A body that arrived whole but does not parse is judged by the caller.
impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            RemoteError::Server {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// Error surfaced by the engines, the store and the job manager.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Migration incomplete: {failed} block(s) could not be created, first error: {first}")]
    PartialMigration { failed: usize, first: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Remote(e) if e.is_transient() => ErrorKind::TransientRemote,
            EngineError::Remote(_) | EngineError::PartialMigration { .. } => {
                ErrorKind::PermanentRemote
            }
            EngineError::Io(_) => ErrorKind::LocalIo,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Validation(_) | EngineError::NotFound(_) => ErrorKind::Validation,
            EngineError::Serialization(_)
            | EngineError::Config(_)
            | EngineError::DeadlineExceeded(_)
            | EngineError::Conflict(_)
            | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

/// Classification recorded on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientRemote,
    PermanentRemote,
    LocalIo,
    Cancelled,
    Validation,
    Internal,
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::RateLimited { retry_after: None }.is_transient());
        assert!(RemoteError::Server { status: 502, message: String::new() }.is_transient());
        assert!(!RemoteError::Unauthorized("token".into()).is_transient());
        assert!(!RemoteError::NotFound("page".into()).is_transient());

        let exhausted = RemoteError::RetriesExhausted {
            attempts: 3,
            last: Box::new(RemoteError::Network("reset".into())),
        };
        assert!(!exhausted.is_transient());
    }

    #[test]
    fn test_error_kind() {
        let e = EngineError::from(RemoteError::Unauthorized("bad token".into()));
        assert_eq!(e.kind(), ErrorKind::PermanentRemote);

        let e = EngineError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(e.kind(), ErrorKind::LocalIo);

        assert_eq!(EngineError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(EngineError::Validation("x".into()).kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_retry_after() {
        let e = RemoteError::RateLimited { retry_after: Some(Duration::from_secs(2)) };
        assert_eq!(e.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(RemoteError::Network("x".into()).retry_after(), None);
    }
}
