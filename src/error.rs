//! Error types for feedsieve.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the failure class: configuration problems are rejected before any
//! mutation, predicate and resolution failures stay local to one post,
//! storage failures abort the whole pass.

use thiserror::Error;

use crate::feed::ScopeId;
use crate::storage::StorageError;

/// A filter handler reference could not be resolved against the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Filter handler not registered: '{handler}'")]
pub struct ResolutionError {
    /// The handler reference that failed to resolve.
    pub handler: String,
}

impl ResolutionError {
    /// Creates a resolution error for the given handler reference.
    #[must_use]
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
        }
    }
}

/// Inconsistent or invalid configuration, detected before anything is applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Crossref filters in scope {scope} disagree on {setting}: {detail}")]
    CrossrefMismatch {
        scope: ScopeId,
        setting: &'static str,
        detail: String,
    },

    #[error("Filter handler '{name}' is already registered")]
    DuplicateHandler {
        name: String,
    },

    #[error("Invalid configuration field '{field}': {reason}")]
    InvalidField {
        field: String,
        reason: String,
    },

    #[error("Invalid unit of work state: {reason}")]
    UnitOfWork {
        reason: String,
    },
}

/// A filter predicate failed while evaluating a post.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PredicateError {
    #[error("Filter '{filter}' requires a parameter")]
    MissingParameter {
        filter: String,
    },

    #[error("Filter '{filter}' got invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        filter: String,
        parameter: String,
        reason: String,
    },

    #[error("Filter '{filter}' failed: {message}")]
    Failed {
        filter: String,
        message: String,
    },
}

impl PredicateError {
    /// Creates a generic failure for the named filter.
    #[must_use]
    pub fn failed(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            filter: filter.into(),
            message: message.into(),
        }
    }
}

/// Top-level error type for feedsieve.
#[derive(Debug, Error)]
pub enum SieveError {
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Predicate error: {0}")]
    Predicate(#[from] PredicateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SieveError {
    /// Returns true if this is a resolution error.
    #[must_use]
    pub const fn is_resolution(&self) -> bool {
        matches!(self, Self::Resolution(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a predicate error.
    #[must_use]
    pub const fn is_predicate(&self) -> bool {
        matches!(self, Self::Predicate(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if the failure only concerns the post being evaluated.
    ///
    /// Rebuild passes keep going after such failures; anything else aborts them.
    #[must_use]
    pub const fn is_post_local(&self) -> bool {
        matches!(self, Self::Resolution(_) | Self::Predicate(_))
    }
}

/// Result type alias for feedsieve operations.
pub type SieveResult<T> = Result<T, SieveError>;
