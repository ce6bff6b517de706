//! The single-consumer write queue.
//!
//! Every durable mutation of a store goes through one [`WriteQueue`]. The
//! queue owns a [`StorageWorker`] inside a spawned task and feeds it one
//! [`WriteOp`] at a time in submission order, so at most one write is ever in
//! flight against the branch. Each submitter gets its own result back on a
//! oneshot channel; a failed operation does not stop the queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::worker::{StorageWorker, WriteOp, WriteOutcome};

/// Snapshot of queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Operations accepted by `submit`.
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Operations submitted but not yet finished.
    pub fn pending(&self) -> u64 {
        self.submitted.saturating_sub(self.completed + self.failed)
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Envelope {
    op: WriteOp,
    reply: oneshot::Sender<EngineResult<WriteOutcome>>,
}

/// Result of an enqueued operation, delivered once the worker has run it.
#[must_use = "the write outcome is only observed by awaiting it"]
pub struct PendingWrite {
    rx: oneshot::Receiver<EngineResult<WriteOutcome>>,
}

impl PendingWrite {
    pub async fn wait(self) -> EngineResult<WriteOutcome> {
        self.rx.await.map_err(|_| EngineError::QueueClosed)?
    }
}

/// Handle for submitting operations to the queue's worker task.
///
/// Cloning the handle shares the same queue. The worker task exits once
/// every handle is dropped.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    counters: Arc<Counters>,
}

impl WriteQueue {
    /// Spawn the worker task on the current Tokio runtime.
    ///
    /// Each operation may run for at most `write_timeout`; past that it is
    /// dropped and its submitter receives `Timeout`.
    pub fn spawn(worker: StorageWorker, write_timeout: Duration) -> EngineResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| EngineError::Internal(format!("write queue needs a tokio runtime: {e}")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        handle.spawn(run(worker, rx, write_timeout, counters.clone()));
        Ok(Self { tx, counters })
    }

    /// Place `op` at the back of the queue without waiting.
    ///
    /// Operations run in the order `enqueue` was called, which lets callers
    /// that cannot await keep their writes ordered.
    pub fn enqueue(&self, op: WriteOp) -> EngineResult<PendingWrite> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { op, reply })
            .map_err(|_| EngineError::QueueClosed)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(PendingWrite { rx })
    }

    /// Enqueue `op` and wait for its result.
    pub async fn submit(&self, op: WriteOp) -> EngineResult<WriteOutcome> {
        self.enqueue(op)?.wait().await
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run(
    mut worker: StorageWorker,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    write_timeout: Duration,
    counters: Arc<Counters>,
) {
    while let Some(Envelope { op, reply }) = rx.recv().await {
        let label = op.label();
        let result = match tokio::time::timeout(write_timeout, worker.apply(op)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(write_timeout)),
        };
        match &result {
            Ok(outcome) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(op = label, path = %outcome.path, "queued write completed");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(op = label, error = %e, "queued write failed");
            }
        }
        // The submitter may have given up waiting.
        let _ = reply.send(result);
    }
    debug!("write queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use repodb_remote::{Commit, DirEntry, InMemoryRemote, RemoteResult, RemoteStore, TreeUpdate};
    use repodb_types::ObjectId;
    use serde_json::json;

    use crate::paths::PathScheme;
    use crate::writer::ObjectWriter;

    fn queue(remote: Arc<InMemoryRemote>, timeout: Duration) -> WriteQueue {
        let writer = ObjectWriter::new(remote, "main");
        let worker = StorageWorker::new(writer, PathScheme::new("data").unwrap(), false);
        WriteQueue::spawn(worker, timeout).unwrap()
    }

    fn save(key: &str, n: i64) -> WriteOp {
        WriteOp::SaveRecord {
            collection: "tasks".into(),
            key: key.into(),
            group: None,
            previous_groups: Vec::new(),
            document: json!({ "n": n }),
        }
    }

    #[test]
    fn spawn_outside_runtime_fails() {
        let remote = Arc::new(InMemoryRemote::new());
        let writer = ObjectWriter::new(remote, "main");
        let worker = StorageWorker::new(writer, PathScheme::new("data").unwrap(), false);
        assert!(matches!(
            WriteQueue::spawn(worker, Duration::from_secs(1)),
            Err(EngineError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_submissions_are_serialized() {
        let remote = Arc::new(InMemoryRemote::new());
        let queue = queue(remote.clone(), Duration::from_secs(5));

        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.submit(save(&format!("t{i}"), i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Every write landed; none was lost to a conflict.
        assert_eq!(remote.commit_count(), 8);
        for i in 0..8 {
            let doc = remote.json("main", &format!("data/tasks/t{i}.json")).unwrap();
            assert_eq!(doc["n"], i);
        }
        let stats = queue.stats();
        assert_eq!(stats.submitted, 8);
        assert_eq!(stats.completed, 8);
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test]
    async fn failure_does_not_stop_the_queue() {
        let remote = Arc::new(InMemoryRemote::new());
        let queue = queue(remote.clone(), Duration::from_secs(5));

        remote.fail_next(1);
        let err = queue.submit(save("a", 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::TransientNetwork(_)));

        queue.submit(save("a", 2)).await.unwrap();
        assert_eq!(remote.json("main", "data/tasks/a.json").unwrap()["n"], 2);

        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn enqueue_preserves_call_order() {
        let remote = Arc::new(InMemoryRemote::new());
        let queue = queue(remote.clone(), Duration::from_secs(5));

        let first = queue.enqueue(save("a", 1)).unwrap();
        let second = queue
            .enqueue(WriteOp::DeleteRecord {
                collection: "tasks".into(),
                key: "a".into(),
                group: None,
                previous_groups: Vec::new(),
            })
            .unwrap();
        second.wait().await.unwrap();
        first.wait().await.unwrap();

        let doc = remote.json("main", "data/tasks/a.json").unwrap();
        assert_eq!(doc["__deleted"], true);
        assert_eq!(doc["n"], 1);
    }

    #[tokio::test]
    async fn validation_errors_reach_the_submitter() {
        let remote = Arc::new(InMemoryRemote::new());
        let queue = queue(remote, Duration::from_secs(5));
        let err = queue.submit(save("index", 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    /// Delegates to an in-memory remote but stalls on `branch_head`.
    struct StallingRemote(InMemoryRemote);

    #[async_trait]
    impl RemoteStore for StallingRemote {
        async fn branch_head(&self, branch: &str) -> RemoteResult<ObjectId> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.0.branch_head(branch).await
        }
        async fn commit(&self, id: &ObjectId) -> RemoteResult<Commit> {
            self.0.commit(id).await
        }
        async fn create_blob(&self, content: &[u8]) -> RemoteResult<ObjectId> {
            self.0.create_blob(content).await
        }
        async fn create_tree(&self, base: &ObjectId, updates: &[TreeUpdate]) -> RemoteResult<ObjectId> {
            self.0.create_tree(base, updates).await
        }
        async fn create_commit(
            &self,
            message: &str,
            tree: &ObjectId,
            parents: &[ObjectId],
        ) -> RemoteResult<ObjectId> {
            self.0.create_commit(message, tree, parents).await
        }
        async fn update_branch(&self, branch: &str, commit: &ObjectId) -> RemoteResult<()> {
            self.0.update_branch(branch, commit).await
        }
        async fn read_file(&self, branch: &str, path: &str) -> RemoteResult<Vec<u8>> {
            self.0.read_file(branch, path).await
        }
        async fn list_dir(&self, branch: &str, path: &str) -> RemoteResult<Vec<DirEntry>> {
            self.0.list_dir(branch, path).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_write_times_out_and_queue_moves_on() {
        let remote = Arc::new(StallingRemote(InMemoryRemote::new()));
        let writer = ObjectWriter::new(remote, "main");
        let worker = StorageWorker::new(writer, PathScheme::new("data").unwrap(), false);
        let queue = WriteQueue::spawn(worker, Duration::from_millis(50)).unwrap();

        let err = queue.submit(save("a", 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert!(err.is_retryable());

        let err = queue.submit(save("b", 2)).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert_eq!(queue.stats().failed, 2);
    }
}
