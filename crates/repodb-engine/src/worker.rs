use std::collections::HashSet;

use repodb_remote::RemoteError;
use repodb_types::{is_tombstoned, ObjectId, Tombstone};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::index::CollectionIndex;
use crate::loader::BulkLoader;
use crate::paths::{marker_content, marker_path, PathScheme};
use crate::writer::{FileChange, ObjectWriter};

/// A durable operation executed by the write queue.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Write a record. Live copies under `previous_groups` are tombstoned
    /// in the same commit, so a record whose group changed is stored once.
    SaveRecord {
        collection: String,
        key: String,
        group: Option<String>,
        previous_groups: Vec<Option<String>>,
        document: Value,
    },
    /// Tombstone the stored record in place, along with any live copy under
    /// `previous_groups` and in the flat legacy layout.
    DeleteRecord {
        collection: String,
        key: String,
        group: Option<String>,
        previous_groups: Vec<Option<String>>,
    },
    RebuildIndex {
        collection: String,
    },
    /// Write an arbitrary file (metadata, backups).
    CreateFile {
        path: String,
        content: Vec<u8>,
    },
    SaveGroupData {
        collection: String,
        group: String,
        doc_type: String,
        data: Value,
    },
    /// Create the data-folder marker if the folder does not exist yet.
    EnsureDataFolder,
}

impl WriteOp {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SaveRecord { .. } => "save_record",
            Self::DeleteRecord { .. } => "delete_record",
            Self::RebuildIndex { .. } => "rebuild_index",
            Self::CreateFile { .. } => "create_file",
            Self::SaveGroupData { .. } => "save_group_data",
            Self::EnsureDataFolder => "ensure_data_folder",
        }
    }
}

/// Result of a queued operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Primary path the operation targeted.
    pub path: String,
    /// Commit that made the change durable, or `None` when nothing needed
    /// writing (deleting a record that was never stored, say).
    pub commit: Option<ObjectId>,
}

/// Executes [`WriteOp`]s one at a time on behalf of the write queue.
pub struct StorageWorker {
    writer: ObjectWriter,
    paths: PathScheme,
    maintain_index: bool,
    known_dirs: HashSet<String>,
}

impl StorageWorker {
    pub fn new(writer: ObjectWriter, paths: PathScheme, maintain_index: bool) -> Self {
        Self {
            writer,
            paths,
            maintain_index,
            known_dirs: HashSet::new(),
        }
    }

    pub async fn apply(&mut self, op: WriteOp) -> EngineResult<WriteOutcome> {
        match op {
            WriteOp::SaveRecord {
                collection,
                key,
                group,
                previous_groups,
                document,
            } => {
                self.save_record(&collection, &key, group.as_deref(), &previous_groups, &document)
                    .await
            }
            WriteOp::DeleteRecord {
                collection,
                key,
                group,
                previous_groups,
            } => {
                self.delete_record(&collection, &key, group.as_deref(), &previous_groups)
                    .await
            }
            WriteOp::RebuildIndex { collection } => self.rebuild_index(&collection).await,
            WriteOp::CreateFile { path, content } => {
                let message = format!("Create file: {path}");
                self.commit(vec![FileChange::new(path.clone(), content)], &message, Vec::new(), path)
                    .await
            }
            WriteOp::SaveGroupData {
                collection,
                group,
                doc_type,
                data,
            } => self.save_group_data(&collection, &group, &doc_type, &data).await,
            WriteOp::EnsureDataFolder => self.ensure_data_folder().await,
        }
    }

    async fn commit(
        &mut self,
        changes: Vec<FileChange>,
        message: &str,
        new_dirs: Vec<String>,
        path: String,
    ) -> EngineResult<WriteOutcome> {
        let pointer = self.writer.write(&changes, message).await?;
        self.known_dirs.extend(new_dirs);
        Ok(WriteOutcome {
            path,
            commit: Some(pointer.commit),
        })
    }

    async fn dir_exists(&mut self, dir: &str) -> EngineResult<bool> {
        if self.known_dirs.contains(dir) {
            return Ok(true);
        }
        let remote = self.writer.remote().clone();
        match remote.list_dir(self.writer.branch(), dir).await {
            Ok(_) => {
                self.known_dirs.insert(dir.to_string());
                Ok(true)
            }
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Marker files (and an initial index) for directories that do not exist yet.
    async fn scaffolding(
        &mut self,
        collection: &str,
        group: Option<&str>,
    ) -> EngineResult<(Vec<FileChange>, Vec<String>)> {
        let mut changes = Vec::new();
        let mut new_dirs = Vec::new();

        let collection_dir = self.paths.collection_dir(collection)?;
        if !self.dir_exists(&collection_dir).await? {
            debug!(collection, "creating collection directory");
            changes.push(FileChange::new(
                marker_path(&collection_dir),
                marker_content(collection),
            ));
            if self.maintain_index {
                changes.push(FileChange::json(
                    self.paths.index_path(collection)?,
                    &CollectionIndex::empty(collection),
                )?);
            }
            new_dirs.push(collection_dir);
        }

        if let Some(group) = group {
            let group_dir = self.paths.group_dir(collection, group)?;
            if !self.dir_exists(&group_dir).await? {
                debug!(collection, group, "creating group directory");
                changes.push(FileChange::new(
                    marker_path(&group_dir),
                    marker_content(&format!("{collection}/{group}")),
                ));
                new_dirs.push(group_dir);
            }
        }
        Ok((changes, new_dirs))
    }

    /// A tombstoned copy of the document at `path`, or `None` when there is
    /// nothing live to delete.
    async fn tombstone(&self, path: &str) -> EngineResult<Option<FileChange>> {
        let remote = self.writer.remote().clone();
        let bytes = match remote.read_file(self.writer.branch(), path).await {
            Ok(bytes) => bytes,
            Err(RemoteError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut document: Value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Malformed(format!("{path}: {e}")))?;
        if is_tombstoned(&document) {
            return Ok(None);
        }
        Tombstone::now().apply(&mut document)?;
        Ok(Some(FileChange::json(path.to_string(), &document)?))
    }

    /// Tombstones for live copies of `key` outside `group`. Unreadable
    /// copies are left alone; the loader skips them anyway.
    async fn stale_copies(
        &self,
        collection: &str,
        key: &str,
        group: Option<&str>,
        previous_groups: &[Option<String>],
    ) -> EngineResult<Vec<FileChange>> {
        let mut changes = Vec::new();
        let mut seen = HashSet::new();
        for previous in previous_groups.iter().map(Option::as_deref) {
            if previous == group || !seen.insert(previous) {
                continue;
            }
            let path = self.paths.record_path(collection, key, previous)?;
            match self.tombstone(&path).await {
                Ok(Some(change)) => {
                    debug!(collection, key, %path, "tombstoning stale copy");
                    changes.push(change);
                }
                Ok(None) => {}
                Err(EngineError::Malformed(reason)) => {
                    warn!(collection, key, %path, %reason, "stale copy is unreadable, leaving it");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(changes)
    }

    async fn save_record(
        &mut self,
        collection: &str,
        key: &str,
        group: Option<&str>,
        previous_groups: &[Option<String>],
        document: &Value,
    ) -> EngineResult<WriteOutcome> {
        let path = self.paths.record_path(collection, key, group)?;
        let (mut changes, new_dirs) = self.scaffolding(collection, group).await?;
        changes.push(FileChange::json(path.clone(), document)?);
        changes.extend(
            self.stale_copies(collection, key, group, previous_groups)
                .await?,
        );

        let message = format!("Update {collection} record: {key}");
        let outcome = self.commit(changes, &message, new_dirs, path).await?;
        debug!(collection, key, path = %outcome.path, "record saved");
        self.refresh_index(collection).await;
        Ok(outcome)
    }

    async fn delete_record(
        &mut self,
        collection: &str,
        key: &str,
        group: Option<&str>,
        previous_groups: &[Option<String>],
    ) -> EngineResult<WriteOutcome> {
        let path = self.paths.record_path(collection, key, group)?;
        let mut changes = Vec::new();
        if let Some(change) = self.tombstone(&path).await? {
            changes.push(change);
        }
        changes.extend(
            self.stale_copies(collection, key, group, previous_groups)
                .await?,
        );
        let legacy = self.paths.legacy_path(collection, key)?;
        match self.tombstone(&legacy).await {
            Ok(Some(change)) => {
                debug!(collection, key, path = %legacy, "tombstoning legacy copy");
                changes.push(change);
            }
            Ok(None) => {}
            Err(EngineError::Malformed(reason)) => {
                warn!(collection, key, path = %legacy, %reason, "legacy copy is unreadable, leaving it");
            }
            Err(e) => return Err(e),
        }

        if changes.is_empty() {
            debug!(collection, key, "no live copy stored; nothing to delete");
            return Ok(WriteOutcome { path, commit: None });
        }
        let message = format!("Delete {collection} record: {key}");
        let outcome = self.commit(changes, &message, Vec::new(), path).await?;
        debug!(collection, key, "record tombstoned");
        self.refresh_index(collection).await;
        Ok(outcome)
    }

    /// Best-effort index rebuild after a record write.
    async fn refresh_index(&mut self, collection: &str) {
        if !self.maintain_index {
            return;
        }
        if let Err(e) = self.rebuild_index(collection).await {
            warn!(collection, error = %e, "index rebuild failed");
        }
    }

    async fn rebuild_index(&mut self, collection: &str) -> EngineResult<WriteOutcome> {
        let index_path = self.paths.index_path(collection)?;
        let remote = self.writer.remote().clone();
        let records = BulkLoader::new(remote.as_ref(), self.writer.branch(), &self.paths)
            .collection_records(collection)
            .await?;
        let index = CollectionIndex::from_records(collection, &records);
        debug!(collection, count = index.count, "index rebuilt");

        let message = format!("Update {collection} index");
        let change = FileChange::json(index_path.clone(), &index)?;
        self.commit(vec![change], &message, Vec::new(), index_path).await
    }

    async fn save_group_data(
        &mut self,
        collection: &str,
        group: &str,
        doc_type: &str,
        data: &Value,
    ) -> EngineResult<WriteOutcome> {
        let path = self.paths.group_doc_path(collection, group, doc_type)?;
        let (mut changes, new_dirs) = self.scaffolding(collection, Some(group)).await?;
        changes.push(FileChange::json(path.clone(), data)?);
        let message = format!("Update {collection}/{group} {doc_type} data");
        self.commit(changes, &message, new_dirs, path).await
    }

    async fn ensure_data_folder(&mut self) -> EngineResult<WriteOutcome> {
        let root = self.paths.root().to_string();
        let path = self.paths.data_marker_path();
        if self.dir_exists(&root).await? {
            return Ok(WriteOutcome { path, commit: None });
        }
        info!(data_folder = %root, "creating data folder");
        let message = format!("Create file: {path}");
        let change = FileChange::new(path.clone(), marker_content("Data"));
        self.commit(vec![change], &message, vec![root], path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use repodb_remote::InMemoryRemote;
    use serde_json::json;

    fn worker(maintain_index: bool) -> (Arc<InMemoryRemote>, StorageWorker) {
        let remote = Arc::new(InMemoryRemote::new());
        let writer = ObjectWriter::new(remote.clone(), "main");
        let paths = PathScheme::new("data").unwrap();
        (remote, StorageWorker::new(writer, paths, maintain_index))
    }

    fn save(collection: &str, key: &str, group: Option<&str>, document: Value) -> WriteOp {
        WriteOp::SaveRecord {
            collection: collection.into(),
            key: key.into(),
            group: group.map(str::to_string),
            previous_groups: Vec::new(),
            document,
        }
    }

    fn delete(collection: &str, key: &str, group: Option<&str>, previous: &[Option<&str>]) -> WriteOp {
        WriteOp::DeleteRecord {
            collection: collection.into(),
            key: key.into(),
            group: group.map(str::to_string),
            previous_groups: previous.iter().map(|g| g.map(str::to_string)).collect(),
        }
    }

    #[tokio::test]
    async fn first_write_scaffolds_in_one_commit() {
        let (remote, mut worker) = worker(false);
        let outcome = worker
            .apply(save("tasks", "t1", None, json!({"title": "a"})))
            .await
            .unwrap();
        assert_eq!(outcome.path, "data/tasks/t1.json");
        assert!(outcome.commit.is_some());

        let log = remote.commit_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "Update tasks record: t1");
        assert_eq!(log[0].paths, vec!["data/tasks/README.md", "data/tasks/t1.json"]);
    }

    #[tokio::test]
    async fn known_directories_are_not_scaffolded_again() {
        let (remote, mut worker) = worker(false);
        worker.apply(save("tasks", "t1", None, json!({}))).await.unwrap();
        worker.apply(save("tasks", "t2", None, json!({}))).await.unwrap();
        assert_eq!(remote.commits_touching("data/tasks/README.md"), 1);
        assert_eq!(remote.commit_log()[1].paths, vec!["data/tasks/t2.json"]);
    }

    #[tokio::test]
    async fn grouped_record_gets_group_marker() {
        let (remote, mut worker) = worker(false);
        worker
            .apply(save("users", "u1", Some("u1"), json!({"id": "u1"})))
            .await
            .unwrap();
        assert!(remote.file("main", "data/users/README.md").is_some());
        assert!(remote.file("main", "data/users/u1/README.md").is_some());
        assert_eq!(remote.json("main", "data/users/u1/u1.json").unwrap()["id"], "u1");
    }

    #[tokio::test]
    async fn save_refreshes_index() {
        let (remote, mut worker) = worker(true);
        worker.apply(save("tasks", "t1", None, json!({}))).await.unwrap();
        worker.apply(save("tasks", "t2", None, json!({}))).await.unwrap();

        let index = remote.json("main", "data/tasks/index.json").unwrap();
        assert_eq!(index["name"], "tasks");
        assert_eq!(index["count"], 2);
        assert_eq!(index["files"][1]["path"], "data/tasks/t2.json");
        let messages: Vec<_> = remote.commit_log().into_iter().map(|c| c.message).collect();
        assert!(messages.contains(&"Update tasks index".to_string()));
    }

    #[tokio::test]
    async fn delete_tombstones_in_place() {
        let (remote, mut worker) = worker(true);
        worker
            .apply(save("tasks", "t1", None, json!({"title": "a"})))
            .await
            .unwrap();
        let outcome = worker.apply(delete("tasks", "t1", None, &[])).await.unwrap();
        assert!(outcome.commit.is_some());

        let stored = remote.json("main", "data/tasks/t1.json").unwrap();
        assert_eq!(stored["title"], "a");
        assert_eq!(stored["__deleted"], true);
        assert!(stored["__deletedAt"].is_string());

        let index = remote.json("main", "data/tasks/index.json").unwrap();
        assert_eq!(index["count"], 0);
    }

    #[tokio::test]
    async fn deleting_unknown_record_writes_nothing() {
        let (remote, mut worker) = worker(false);
        let outcome = worker.apply(delete("tasks", "ghost", None, &[])).await.unwrap();
        assert_eq!(outcome.commit, None);
        assert_eq!(remote.commit_count(), 0);
    }

    #[tokio::test]
    async fn invalid_names_fail_before_io() {
        let (remote, mut worker) = worker(false);
        let err = worker
            .apply(save("tasks", "../etc", None, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(remote.commit_count(), 0);
    }

    #[tokio::test]
    async fn group_data_is_a_side_document() {
        let (remote, mut worker) = worker(false);
        let outcome = worker
            .apply(WriteOp::SaveGroupData {
                collection: "clientsMessageHistory".into(),
                group: "c1".into(),
                doc_type: "summary".into(),
                data: json!({"unread": 3}),
            })
            .await
            .unwrap();
        assert_eq!(outcome.path, "data/clientsMessageHistory/c1/__summary.json");
        assert_eq!(remote.json("main", &outcome.path).unwrap()["unread"], 3);
        assert_eq!(
            remote.commit_log()[0].message,
            "Update clientsMessageHistory/c1 summary data"
        );
    }

    #[tokio::test]
    async fn ensure_data_folder_is_idempotent() {
        let (remote, mut worker) = worker(false);
        let first = worker.apply(WriteOp::EnsureDataFolder).await.unwrap();
        assert!(first.commit.is_some());
        assert_eq!(remote.commit_log()[0].message, "Create file: data/README.md");

        let second = worker.apply(WriteOp::EnsureDataFolder).await.unwrap();
        assert!(second.commit.is_none());
        assert_eq!(remote.commit_count(), 1);
    }

    #[tokio::test]
    async fn failed_scaffolding_is_retried_next_time() {
        let (remote, mut worker) = worker(false);
        remote.race_next_update();
        assert!(worker.apply(save("tasks", "t1", None, json!({}))).await.is_err());
        worker.apply(save("tasks", "t1", None, json!({}))).await.unwrap();
        assert!(remote.file("main", "data/tasks/README.md").is_some());
    }

    #[tokio::test]
    async fn group_change_tombstones_the_old_copy_in_one_commit() {
        let (remote, mut worker) = worker(false);
        worker
            .apply(save("activeSessions", "s1", Some("u7"), json!({"userId": "u7", "v": 1})))
            .await
            .unwrap();
        worker
            .apply(WriteOp::SaveRecord {
                collection: "activeSessions".into(),
                key: "s1".into(),
                group: Some("u1".into()),
                previous_groups: vec![Some("u7".into()), Some("u1".into())],
                document: json!({"userId": "u1", "v": 2}),
            })
            .await
            .unwrap();

        let last = remote.commit_log().pop().unwrap();
        assert!(last.paths.contains(&"data/activeSessions/u1/s1.json".to_string()));
        assert!(last.paths.contains(&"data/activeSessions/u7/s1.json".to_string()));

        let old = remote.json("main", "data/activeSessions/u7/s1.json").unwrap();
        assert_eq!(old["__deleted"], true);
        let records = BulkLoader::new(remote.as_ref(), "main", &PathScheme::new("data").unwrap())
            .collection_records("activeSessions")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].document["v"], 2);
    }

    #[tokio::test]
    async fn delete_reaches_previous_groups() {
        let (remote, mut worker) = worker(false);
        worker
            .apply(save("activeSessions", "s1", Some("u1"), json!({"userId": "u1"})))
            .await
            .unwrap();
        worker
            .apply(delete("activeSessions", "s1", Some("u7"), &[Some("u1")]))
            .await
            .unwrap();
        let stored = remote.json("main", "data/activeSessions/u1/s1.json").unwrap();
        assert_eq!(stored["__deleted"], true);
    }

    #[tokio::test]
    async fn delete_tombstones_legacy_copy() {
        let (remote, mut worker) = worker(false);
        remote
            .write_external("main", "data/tasks-a.json", br#"{"v":1}"#)
            .unwrap();
        let outcome = worker.apply(delete("tasks", "a", None, &[])).await.unwrap();
        assert!(outcome.commit.is_some());
        assert!(remote.file("main", "data/tasks/a.json").is_none());
        let legacy = remote.json("main", "data/tasks-a.json").unwrap();
        assert_eq!(legacy["__deleted"], true);
        assert_eq!(legacy["v"], 1);

        // Both copies go in one commit once the record was migrated.
        remote
            .write_external("main", "data/tasks-b.json", br#"{"v":2}"#)
            .unwrap();
        worker.apply(save("tasks", "b", None, json!({"v": 2}))).await.unwrap();
        worker.apply(delete("tasks", "b", None, &[])).await.unwrap();
        let last = remote.commit_log().pop().unwrap();
        assert_eq!(last.paths, vec!["data/tasks/b.json", "data/tasks-b.json"]);
    }
}
