//! Storage engine for repodb.
//!
//! Maps named collections of JSON records onto a remote git object graph.
//! Each durable write is one commit: blobs for the changed files, a tree
//! layered on the branch head, a commit with the head as parent and a
//! fast-forward of the branch.
//!
//! # Key Types
//!
//! - [`StorageEngine`] -- facade over the queue, loader and path scheme
//! - [`WriteQueue`] -- single-consumer actor that serializes every write
//! - [`ObjectWriter`] -- blob/tree/commit/ref sequence for one write
//! - [`PathScheme`] -- (collection, key, group) to repository path
//! - [`CollectionIndex`] -- `index.json` manifest of live records
//! - [`BulkLoader`] -- reads collections (and the legacy flat layout) back
//! - [`StoreConfig`] -- TOML/env configuration shared with the cache layer

pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod legacy;
pub mod loader;
pub mod paths;
pub mod queue;
pub mod worker;
pub mod writer;

pub use config::{default_collections, CollectionOptions, RetryPolicy, StoreConfig};
pub use engine::StorageEngine;
pub use error::{EngineError, EngineResult};
pub use index::{CollectionIndex, IndexEntry};
pub use legacy::{parse_legacy_name, LegacyFile};
pub use loader::{BulkLoader, LoadedData, LoadedRecord};
pub use paths::PathScheme;
pub use queue::{PendingWrite, QueueStats, WriteQueue};
pub use worker::{StorageWorker, WriteOp, WriteOutcome};
pub use writer::{BranchPointer, FileChange, ObjectWriter};
