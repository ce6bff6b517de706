use std::sync::Arc;

use repodb_remote::{RemoteError, RemoteStore, TreeUpdate};
use repodb_types::ObjectId;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Cached head of the branch this process writes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchPointer {
    pub commit: ObjectId,
    pub tree: ObjectId,
}

/// One file written by a durable write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub content: Vec<u8>,
}

impl FileChange {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// A pretty-printed JSON document.
    pub fn json<T: Serialize + ?Sized>(path: impl Into<String>, document: &T) -> EngineResult<Self> {
        let mut content = serde_json::to_vec_pretty(document)
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        content.push(b'\n');
        Ok(Self::new(path, content))
    }
}

/// Turns a set of file changes into one commit on the branch.
///
/// Every write refreshes the branch pointer first, layers the new blobs on
/// the head tree, commits with the head as sole parent and fast-forwards the
/// branch. A rejected fast-forward is returned as `Conflict` and never
/// retried here.
pub struct ObjectWriter {
    remote: Arc<dyn RemoteStore>,
    branch: String,
    pointer: Option<BranchPointer>,
    op_seq: u64,
}

impl ObjectWriter {
    pub fn new(remote: Arc<dyn RemoteStore>, branch: impl Into<String>) -> Self {
        Self {
            remote,
            branch: branch.into(),
            pointer: None,
            op_seq: 0,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Pointer cached by the last refresh or successful write.
    pub fn pointer(&self) -> Option<&BranchPointer> {
        self.pointer.as_ref()
    }

    /// Number of writes attempted so far.
    pub fn op_seq(&self) -> u64 {
        self.op_seq
    }

    /// Re-read the branch head and its tree.
    pub async fn refresh(&mut self) -> EngineResult<BranchPointer> {
        let commit = self.remote.branch_head(&self.branch).await?;
        let tree = self.remote.commit(&commit).await?.tree;
        let pointer = BranchPointer { commit, tree };
        self.pointer = Some(pointer.clone());
        Ok(pointer)
    }

    /// Commit `changes` in one commit with `message`.
    pub async fn write(&mut self, changes: &[FileChange], message: &str) -> EngineResult<BranchPointer> {
        if changes.is_empty() {
            return Err(EngineError::Validation("write with no file changes".into()));
        }
        self.op_seq += 1;
        let op = self.op_seq;
        let base = self.refresh().await?;
        debug!(op, base = %base.commit.short_hex(), files = changes.len(), "writing");

        let mut updates = Vec::with_capacity(changes.len());
        for change in changes {
            let blob = self.remote.create_blob(&change.content).await?;
            debug!(op, path = %change.path, blob = %blob.short_hex(), "blob created");
            updates.push(TreeUpdate::file(change.path.clone(), blob));
        }

        let tree = self.remote.create_tree(&base.tree, &updates).await?;
        let commit = self
            .remote
            .create_commit(message, &tree, std::slice::from_ref(&base.commit))
            .await?;

        match self.remote.update_branch(&self.branch, &commit).await {
            Ok(()) => {}
            Err(err @ RemoteError::Conflict { .. }) => {
                warn!(op, branch = %self.branch, "branch moved during write");
                self.pointer = None;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        }

        let pointer = BranchPointer { commit, tree };
        debug!(op, commit = %pointer.commit.short_hex(), message, "branch advanced");
        self.pointer = Some(pointer.clone());
        Ok(pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repodb_remote::InMemoryRemote;
    use serde_json::json;

    fn writer() -> (Arc<InMemoryRemote>, ObjectWriter) {
        let remote = Arc::new(InMemoryRemote::new());
        let writer = ObjectWriter::new(remote.clone(), "main");
        (remote, writer)
    }

    #[tokio::test]
    async fn write_advances_branch() {
        let (remote, mut writer) = writer();
        let change = FileChange::json("data/users/u1.json", &json!({"id": "u1"})).unwrap();
        let pointer = writer.write(&[change], "Update users record: u1").await.unwrap();

        assert_eq!(remote.branch_head("main").await.unwrap(), pointer.commit);
        assert_eq!(writer.pointer(), Some(&pointer));
        assert_eq!(remote.json("main", "data/users/u1.json").unwrap()["id"], "u1");
        let log = remote.commit_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "Update users record: u1");
    }

    #[test]
    fn json_is_pretty_printed() {
        let change = FileChange::json("x.json", &json!({"a": 1})).unwrap();
        let text = String::from_utf8(change.content).unwrap();
        assert_eq!(text, "{\n  \"a\": 1\n}\n");
    }

    #[tokio::test]
    async fn several_files_land_in_one_commit() {
        let (remote, mut writer) = writer();
        let changes = vec![
            FileChange::new("data/users/README.md", "# users\n"),
            FileChange::json("data/users/u1.json", &json!({})).unwrap(),
        ];
        writer.write(&changes, "first").await.unwrap();
        assert_eq!(remote.commit_count(), 1);
        assert!(remote.file("main", "data/users/README.md").is_some());
    }

    #[tokio::test]
    async fn external_commit_is_picked_up_by_refresh() {
        let (remote, mut writer) = writer();
        writer
            .write(&[FileChange::new("a.json", "1")], "a")
            .await
            .unwrap();
        remote.write_external("main", "b.json", b"2").unwrap();

        writer
            .write(&[FileChange::new("c.json", "3")], "c")
            .await
            .unwrap();
        assert_eq!(remote.file("main", "b.json").unwrap(), b"2");
        assert_eq!(remote.file("main", "c.json").unwrap(), b"3");
    }

    #[tokio::test]
    async fn racing_writer_surfaces_conflict_then_recovers() {
        let (remote, mut writer) = writer();
        remote.race_next_update();
        let err = writer
            .write(&[FileChange::new("a.json", "1")], "a")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
        assert!(writer.pointer().is_none());
        assert!(remote.file("main", "a.json").is_none());

        writer
            .write(&[FileChange::new("a.json", "1")], "a")
            .await
            .unwrap();
        assert_eq!(remote.file("main", "a.json").unwrap(), b"1");
    }

    #[tokio::test]
    async fn empty_write_is_rejected() {
        let (_, mut writer) = writer();
        let err = writer.write(&[], "nothing").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(writer.op_seq(), 0);
    }

    #[tokio::test]
    async fn transient_failure_leaves_branch_alone() {
        let (remote, mut writer) = writer();
        let before = remote.branch_head("main").await.unwrap();
        remote.fail_next(1);
        let err = writer
            .write(&[FileChange::new("a.json", "1")], "a")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(remote.branch_head("main").await.unwrap(), before);
    }
}
