use async_trait::async_trait;
use repodb_types::ObjectId;

use crate::error::RemoteResult;
use crate::object::{Commit, DirEntry, TreeUpdate};

/// Access to a remote git object graph and one of its branches.
///
/// All implementations must satisfy these invariants:
/// - Objects (blobs, trees, commits) are immutable once created.
/// - `update_branch` is fast-forward only: if the branch head is not an
///   ancestor of the new commit the call fails with `RemoteError::Conflict`
///   and the branch is left untouched.
/// - `read_file` and `list_dir` resolve against the branch head at the
///   time of the call.
/// - Failures are classified; nothing is silently swallowed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current head commit id of `branch`.
    async fn branch_head(&self, branch: &str) -> RemoteResult<ObjectId>;

    /// Fetch a commit by id.
    async fn commit(&self, id: &ObjectId) -> RemoteResult<Commit>;

    /// Upload file content and return its blob id.
    async fn create_blob(&self, content: &[u8]) -> RemoteResult<ObjectId>;

    /// Create a tree that is `base` with `updates` layered on top.
    ///
    /// Paths not named in `updates` keep their entries from `base`.
    async fn create_tree(&self, base: &ObjectId, updates: &[TreeUpdate]) -> RemoteResult<ObjectId>;

    /// Create a commit object. Does not move any branch.
    async fn create_commit(
        &self,
        message: &str,
        tree: &ObjectId,
        parents: &[ObjectId],
    ) -> RemoteResult<ObjectId>;

    /// Fast-forward `branch` to `commit`.
    async fn update_branch(&self, branch: &str, commit: &ObjectId) -> RemoteResult<()>;

    /// Raw bytes of the file at `path` on the head of `branch`.
    async fn read_file(&self, branch: &str, path: &str) -> RemoteResult<Vec<u8>>;

    /// Immediate children of the directory at `path` on the head of `branch`.
    ///
    /// An empty `path` lists the repository root.
    async fn list_dir(&self, branch: &str, path: &str) -> RemoteResult<Vec<DirEntry>>;
}
