//! # tephra-core
//!
//! Core abstractions for the Tephra event-storage compaction engine.
//!
//! This crate provides the foundational types and traits used across all
//! Tephra components:
//!
//! - **Storage Trait**: Abstract object-storage interface with first-class
//!   byte-range reads, plus in-memory and local-filesystem backends
//! - **Identifiers**: Strongly-typed IDs for jobs and datasets
//! - **Error Types**: Shared error taxonomy and result alias
//! - **Retry**: Bounded exponential backoff for rate-limit-class failures
//! - **Observability**: Logging initialization and span constructors
//!
//! Cross-component interaction happens via the contracts defined here; the
//! engine itself lives in `tephra-store`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod retry;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::JobId;
    pub use crate::retry::{RetryPolicy, with_backoff};
    pub use crate::storage::{
        FsBackend, MemoryBackend, ObjectMeta, PutResult, StorageBackend,
    };
}

pub use error::{Error, Result};
pub use id::JobId;
pub use observability::{LogFormat, init_logging};
pub use retry::{RetryPolicy, with_backoff};
pub use storage::{FsBackend, MemoryBackend, ObjectMeta, PutResult, StorageBackend};
