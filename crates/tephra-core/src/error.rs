//! Error types and result aliases shared across Tephra components.
//!
//! Errors are structured for programmatic handling: the compaction engine
//! routes on variants (rate-limited upstream failures are retried, conflicts
//! are rejected immediately, malformed input always fails closed).

/// The result type used throughout Tephra.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Tephra operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A computed offset or length would exceed the safe integer range.
    #[error("offset arithmetic overflow: {message}")]
    Overflow {
        /// Description of the computation that overflowed.
        message: String,
    },

    /// An upstream dependency is rate limiting us.
    ///
    /// This is the only variant the retry helper will retry.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Description of the rate-limited call.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided by a caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new overflow error with the given message.
    #[must_use]
    pub fn overflow(message: impl Into<String>) -> Self {
        Self::Overflow {
            message: message.into(),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns whether this error is a transient rate-limit failure.
    ///
    /// Used by the retry helper to decide whether another attempt is
    /// worthwhile. Non-transient failures are never retried.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
