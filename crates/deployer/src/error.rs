//! Error types for the deployment coordination engine.

use thiserror::Error;

use crate::conflict::ConflictError;
use crate::store::StoreError;

/// Errors surfaced by the deployment coordination engine.
#[derive(Debug, Error)]
pub enum DeployerError {
    /// A request key string could not be decoded
    #[error("Malformed request key '{key}': {reason}")]
    MalformedKey { key: String, reason: String },

    /// A feature id was registered twice
    #[error("Feature '{0}' is already registered")]
    AlreadyRegistered(String),

    /// A deploy was requested for a feature nobody registered
    #[error("Feature '{0}' is not registered")]
    UnregisteredFeature(String),

    /// Another owner holds the resource and the requester cannot preempt it
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// The remote store rejected or failed an operation
    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    /// A document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A drift exclusion selector could not be compiled
    #[error("Invalid patch selector: {0}")]
    InvalidSelector(String),

    /// A document is missing a field every managed resource needs
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

impl DeployerError {
    /// Check whether this error is an ownership conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Borrow the conflict details, if this is an ownership conflict
    #[must_use]
    pub fn as_conflict(&self) -> Option<&ConflictError> {
        match self {
            Self::Conflict(err) => Some(err),
            _ => None,
        }
    }

    pub(crate) fn malformed_key(key: &str, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for DeployerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for DeployerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = DeployerError> = std::result::Result<T, E>;
