//! Typed errors for the control plane.
//!
//! Leader-gated no-ops are not errors. Everything a caller can act on is a
//! variant here; nothing in this crate terminates the process on a store
//! failure.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("agent {0} already exists")]
    AlreadyExists(Uuid),

    #[error("agent {0} not found")]
    NotFound(Uuid),

    /// A compare-and-commit precondition failed because another writer got
    /// there first. Safe to retry.
    #[error("conflicting concurrent write on {key}")]
    Conflict { key: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store operation `{operation}` timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The lease backing the coordination session expired.
    #[error("coordination session lost")]
    SessionLost,

    #[error("malformed value at {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("update processor has stopped")]
    UpdateProcessorStopped,
}

impl Error {
    /// Whether the caller may retry the same operation unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::StoreUnavailable(_)
                | Error::Timeout { .. }
                | Error::SessionLost
        )
    }

    pub(crate) fn codec(key: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Codec {
            key: key.into(),
            source,
        }
    }
}

impl From<fred::error::Error> for Error {
    fn from(err: fred::error::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}
