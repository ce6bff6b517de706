//! Foundation types for repodb.
//!
//! This crate provides the identifier, record and time types shared by every
//! other repodb crate.
//!
//! # Key Types
//!
//! - [`ObjectId`] -- Hex identifier of a blob, tree or commit in the remote object graph
//! - [`Tombstone`] -- Soft-delete bookkeeping carried inside a record document
//! - [`timestamp`] -- ISO-8601 stamps used for `createdAt`, `updatedAt` and `__deletedAt`

pub mod error;
pub mod object;
pub mod record;
pub mod temporal;

pub use error::TypeError;
pub use object::ObjectId;
pub use record::{
    group_value, is_tombstoned, strip_tombstone, Tombstone, DELETED_AT_FIELD, DELETED_FIELD,
};
pub use temporal::{backup_stamp, format_timestamp, timestamp};
