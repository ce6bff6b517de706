//! Remote object-graph access for repodb.
//!
//! repodb keeps its documents in a git repository hosted by a remote
//! platform. This crate is the only place that talks to that platform: it
//! models the git objects the engine builds (blobs, trees, commits), the
//! branch reference it advances, and the content listing it reads back.
//!
//! # Backends
//!
//! All backends implement the [`RemoteStore`] trait:
//!
//! - [`GitHubRemote`] -- the GitHub REST API (`/git/*` and `/contents`)
//! - [`InMemoryRemote`] -- a content-addressed object graph for tests and embedding
//!
//! # Rules
//!
//! 1. Objects are immutable once created; only the branch ref moves.
//! 2. Branch updates are fast-forward only. Anything else is a
//!    [`RemoteError::Conflict`].
//! 3. Reads always resolve against the current branch head.
//! 4. Errors are classified (not found, conflict, transient, malformed) so
//!    callers can decide what is retryable.

pub mod error;
pub mod github;
pub mod memory;
pub mod object;
pub mod traits;

pub use error::{RemoteError, RemoteResult};
pub use github::{GitHubConfig, GitHubRemote};
pub use memory::InMemoryRemote;
pub use object::{Commit, DirEntry, EntryKind, EntryMode, Tree, TreeEntry, TreeUpdate};
pub use traits::RemoteStore;
