//! Write-behind document caches for repodb.
//!
//! Applications talk to a [`DocumentStore`]: it loads every stored record at
//! startup and hands out one [`CollectionCache`] per collection. Caches answer
//! reads from memory and push changes to the storage engine's write queue in
//! the background, debounced per key and retried with bounded backoff.
//!
//! # Key Types
//!
//! - [`DocumentStore`] -- lifecycle, collections, group data, metadata, migration
//! - [`CollectionCache`] -- in-memory records of one collection
//! - [`PersistFailure`] -- broadcast when a record could not be made durable
//! - [`MigrationReport`] -- outcome of a legacy-layout migration

pub mod collection;
pub mod error;
pub mod migrate;
pub mod store;

pub use collection::{CollectionCache, PersistFailure, WritePolicy};
pub use error::{CacheError, CacheResult};
pub use migrate::MigrationReport;
pub use store::{DocumentStore, METADATA_VERSION};
