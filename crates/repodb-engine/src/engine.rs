use std::sync::Arc;

use repodb_remote::{RemoteError, RemoteStore};
use serde_json::Value;
use tracing::info;

use crate::config::StoreConfig;
use crate::error::{EngineError, EngineResult};
use crate::index::CollectionIndex;
use crate::legacy::LegacyFile;
use crate::loader::{BulkLoader, LoadedData};
use crate::paths::PathScheme;
use crate::queue::{PendingWrite, QueueStats, WriteQueue};
use crate::worker::{StorageWorker, WriteOp, WriteOutcome};
use crate::writer::ObjectWriter;

struct EngineInner {
    remote: Arc<dyn RemoteStore>,
    branch: String,
    paths: PathScheme,
    queue: WriteQueue,
    load_legacy: bool,
}

/// Durable storage for collections of JSON records.
///
/// Writes are funnelled through one [`WriteQueue`]; reads go straight to the
/// head of the branch. Cloning is cheap and shares the queue.
#[derive(Clone)]
pub struct StorageEngine {
    inner: Arc<EngineInner>,
}

impl StorageEngine {
    /// Build an engine over `remote` and start its write queue.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &StoreConfig, remote: Arc<dyn RemoteStore>) -> EngineResult<Self> {
        config.validate()?;
        let paths = PathScheme::new(&config.data_folder)?;
        let writer = ObjectWriter::new(remote.clone(), config.branch.clone());
        let worker = StorageWorker::new(writer, paths.clone(), config.maintain_index);
        let queue = WriteQueue::spawn(worker, config.write_timeout())?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                remote,
                branch: config.branch.clone(),
                paths,
                queue,
                load_legacy: config.load_legacy,
            }),
        })
    }

    pub fn paths(&self) -> &PathScheme {
        &self.inner.paths
    }

    pub fn branch(&self) -> &str {
        &self.inner.branch
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    fn loader(&self) -> BulkLoader<'_> {
        BulkLoader::new(self.inner.remote.as_ref(), &self.inner.branch, &self.inner.paths)
    }

    /// Make sure the data folder exists on the branch.
    pub async fn initialize(&self) -> EngineResult<()> {
        let outcome = self.inner.queue.submit(WriteOp::EnsureDataFolder).await?;
        info!(
            branch = %self.inner.branch,
            data_folder = %self.inner.paths.root(),
            created = outcome.commit.is_some(),
            "storage engine ready"
        );
        Ok(())
    }

    /// Queue `op` behind everything enqueued so far without waiting for it.
    pub fn enqueue(&self, op: WriteOp) -> EngineResult<PendingWrite> {
        self.inner.queue.enqueue(op)
    }

    /// Enqueue an arbitrary operation.
    pub async fn submit(&self, op: WriteOp) -> EngineResult<WriteOutcome> {
        self.inner.queue.submit(op).await
    }

    pub async fn save_record(
        &self,
        collection: &str,
        key: &str,
        group: Option<&str>,
        document: &Value,
    ) -> EngineResult<WriteOutcome> {
        self.submit(WriteOp::SaveRecord {
            collection: collection.to_string(),
            key: key.to_string(),
            group: group.map(str::to_string),
            previous_groups: Vec::new(),
            document: document.clone(),
        })
        .await
    }

    /// Tombstone a stored record, including its flat legacy copy. Deleting a
    /// record that was never stored is a no-op with no commit.
    pub async fn delete_record(
        &self,
        collection: &str,
        key: &str,
        group: Option<&str>,
    ) -> EngineResult<WriteOutcome> {
        self.submit(WriteOp::DeleteRecord {
            collection: collection.to_string(),
            key: key.to_string(),
            group: group.map(str::to_string),
            previous_groups: Vec::new(),
        })
        .await
    }

    pub async fn rebuild_index(&self, collection: &str) -> EngineResult<WriteOutcome> {
        self.submit(WriteOp::RebuildIndex {
            collection: collection.to_string(),
        })
        .await
    }

    pub async fn create_file(&self, path: &str, content: impl Into<Vec<u8>>) -> EngineResult<WriteOutcome> {
        self.submit(WriteOp::CreateFile {
            path: path.to_string(),
            content: content.into(),
        })
        .await
    }

    pub async fn save_group_data(
        &self,
        collection: &str,
        group: &str,
        doc_type: &str,
        data: &Value,
    ) -> EngineResult<WriteOutcome> {
        self.submit(WriteOp::SaveGroupData {
            collection: collection.to_string(),
            group: group.to_string(),
            doc_type: doc_type.to_string(),
            data: data.clone(),
        })
        .await
    }

    /// JSON document at `path`, or `None` if there is no such file.
    pub async fn read_json(&self, path: &str) -> EngineResult<Option<Value>> {
        match self.inner.remote.read_file(&self.inner.branch, path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| EngineError::Malformed(format!("{path}: {e}"))),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `dir` exists on the branch.
    pub async fn dir_exists(&self, dir: &str) -> EngineResult<bool> {
        match self.inner.remote.list_dir(&self.inner.branch, dir).await {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load_group_data(
        &self,
        collection: &str,
        group: &str,
        doc_type: &str,
    ) -> EngineResult<Option<Value>> {
        let path = self.inner.paths.group_doc_path(collection, group, doc_type)?;
        self.read_json(&path).await
    }

    /// Stored index of `collection`, if one has been written.
    pub async fn load_index(&self, collection: &str) -> EngineResult<Option<CollectionIndex>> {
        let path = self.inner.paths.index_path(collection)?;
        match self.read_json(&path).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| EngineError::Malformed(format!("{path}: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn list_collections(&self) -> EngineResult<Vec<String>> {
        self.loader().list_collections().await
    }

    /// Every live record, including legacy flat files when configured.
    pub async fn load_all(&self) -> EngineResult<LoadedData> {
        self.loader().load_all(self.inner.load_legacy).await
    }

    pub async fn list_legacy(&self) -> EngineResult<Vec<LegacyFile>> {
        self.loader().list_legacy().await
    }

    /// Read one legacy record; `None` if missing, malformed or tombstoned.
    pub async fn read_legacy(&self, file: &LegacyFile) -> Option<Value> {
        self.loader().read_record(&file.path).await
    }
}
