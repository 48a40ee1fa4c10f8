//! Error types for the compaction engine.

use tephra_core::Error as CoreError;

/// The result type used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from compaction, parsing and read operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Fragment bytes did not match the expected layout.
    ///
    /// Parsing fails closed: no fabricated row groups are ever returned.
    #[error("malformed fragment: {message}")]
    MalformedFragment {
        /// Description of the violation.
        message: String,
    },

    /// Container (event log) bytes did not match the expected layout.
    #[error("malformed container: {message}")]
    MalformedContainer {
        /// Description of the violation.
        message: String,
    },

    /// Row-group geometry is inconsistent with its source fragment.
    ///
    /// At merge time a single inconsistent row group is skipped with a
    /// warning; this error surfaces only when the inconsistency cannot be
    /// contained that way.
    #[error("inconsistent row-group geometry: {message}")]
    Geometry {
        /// Description of the violation.
        message: String,
    },

    /// A computed offset or length would exceed the safe integer range.
    #[error("offset arithmetic overflow: {message}")]
    Overflow {
        /// Description of the computation that overflowed.
        message: String,
    },

    /// No row group across all merge inputs was selectable.
    #[error("no selectable row groups across {fragments} candidate fragments")]
    NothingSelectable {
        /// Number of candidate fragments examined.
        fragments: usize,
    },

    /// A whole-object read would exceed the maximum-allocation guard.
    ///
    /// The legacy full-file fallback aborts on this rather than risk
    /// unbounded memory growth.
    #[error("object {key} is {size} bytes, exceeding the {limit} byte allocation guard")]
    AllocationGuard {
        /// Storage key of the object.
        key: String,
        /// Object size in bytes.
        size: u64,
        /// Configured allocation limit in bytes.
        limit: u64,
    },

    /// A compaction job for the same dataset is already processing.
    #[error("compaction already in flight for dataset {dataset_id}")]
    JobConflict {
        /// The dataset whose job was rejected.
        dataset_id: String,
    },

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// An error from the core storage/retry layer.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StoreError {
    /// Creates a new malformed-fragment error with the given message.
    #[must_use]
    pub fn malformed_fragment(message: impl Into<String>) -> Self {
        Self::MalformedFragment {
            message: message.into(),
        }
    }

    /// Creates a new malformed-container error with the given message.
    #[must_use]
    pub fn malformed_container(message: impl Into<String>) -> Self {
        Self::MalformedContainer {
            message: message.into(),
        }
    }

    /// Creates a new overflow error with the given message.
    #[must_use]
    pub fn overflow(message: impl Into<String>) -> Self {
        Self::Overflow {
            message: message.into(),
        }
    }
}
