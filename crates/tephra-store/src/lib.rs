//! # tephra-store
//!
//! The fragment compaction and merge engine for Tephra's split hot/cold
//! event storage.
//!
//! Many small, independently written columnar fragments are periodically
//! consolidated into fewer, larger ones to bound file-count overhead and
//! query fan-out. This crate holds the whole pipeline:
//!
//! - **Footer Codec** ([`footer`]): compact binary struct encoding for
//!   fragment footers
//! - **Fragment Parser** ([`fragment`]): footer-region and full-file
//!   metadata parsing with fail-closed validation
//! - **Schema Grouping** ([`fingerprint`]): fingerprints and
//!   merge-compatibility partitioning
//! - **Merge Engine** ([`merge`]): byte-range-bounded streaming merge
//! - **Validator** ([`validate`]): post-merge structural checks with
//!   quarantine for the engine's own output
//! - **Log Reader** ([`container`]): append-only event-log container
//!   decoding (header + blocks, null/deflate codecs)
//! - **Job Coordinator** ([`coordinator`]): per-dataset single-flight
//!   execution with persisted progress
//! - **Hot/Cold Reader** ([`reader`]): merged tier reads with content-hash
//!   deduplication
//!
//! Object storage and the relational index store are external
//! collaborators reached through the [`tephra_core::StorageBackend`] and
//! [`index::IndexStore`] traits.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod container;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod footer;
pub mod fragment;
pub mod index;
pub mod keys;
pub mod merge;
pub mod reader;
pub mod validate;
mod varint;

pub use coordinator::{JobCoordinator, TriggerRequest};
pub use error::{Result, StoreError};
pub use footer::{ColumnChunkMeta, FooterData, PhysicalType, RowGroupMeta};
pub use fragment::FragmentMeta;
pub use index::{
    BlockIndexEntry, CachedFragmentMeta, FragmentRef, HotRecord, IndexStore, JobRecord, JobStatus,
    MemoryIndexStore,
};
pub use merge::{CompactedFragment, MergeEngine, MergeOptions};
pub use reader::{EventRecord, HotColdReader, ReadQuery, ReadResult};
pub use validate::{ValidateMode, ValidationReport, Validator};
