//! Migration from the flat legacy layout.
//!
//! Older stores kept every record directly under the data folder as
//! `<collection>-<key>.json`. Migration rewrites each live legacy record to
//! its structured path through the normal write queue. Legacy files are left
//! in place; structured records take precedence when both exist.

use repodb_engine::paths::marker_path;
use repodb_engine::{EngineError, LegacyFile};
use repodb_types::{backup_stamp, group_value, is_tombstoned, strip_tombstone, timestamp};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CacheResult;
use crate::store::DocumentStore;

/// Counts produced by [`DocumentStore::migrate_to_structured_storage`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Tombstoned, vanished, or already present in the structured layout.
    pub skipped: usize,
    /// Unreadable or rejected by the remote.
    pub failed: usize,
    /// Where the pre-migration snapshot was written, if one was taken.
    pub backup_path: Option<String>,
}

pub(crate) async fn run(store: &DocumentStore, backup_first: bool) -> CacheResult<MigrationReport> {
    let engine = store.engine();
    let mut report = MigrationReport::default();
    info!(backup_first, "migrating legacy records to structured storage");

    if backup_first {
        report.backup_path = Some(write_backup(store).await?);
    }

    let legacy = engine.list_legacy().await?;
    info!(files = legacy.len(), "legacy records found");
    for file in &legacy {
        match migrate_one(store, file).await {
            Ok(true) => report.migrated += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => {
                warn!(path = %file.path, error = %e, "legacy record not migrated");
                report.failed += 1;
            }
        }
    }

    if store.config().maintain_index {
        for collection in engine.list_collections().await? {
            if let Err(e) = engine.rebuild_index(&collection).await {
                warn!(%collection, error = %e, "index rebuild failed");
            }
        }
    }
    store.create_database_metadata().await?;

    info!(
        migrated = report.migrated,
        skipped = report.skipped,
        failed = report.failed,
        "migration complete"
    );
    Ok(report)
}

/// Snapshot every cache into `<data>/backups/backup-<stamp>.json`.
async fn write_backup(store: &DocumentStore) -> CacheResult<String> {
    let engine = store.engine();
    let dir = engine.paths().backups_dir();
    if !engine.dir_exists(&dir).await? {
        let readme = format!(
            "# Backups\n\nSnapshots of every collection taken before migrations.\nCreated {}\n",
            timestamp()
        );
        engine.create_file(&marker_path(&dir), readme).await?;
    }

    let path = engine.paths().backup_path(&backup_stamp());
    let mut body = serde_json::to_vec_pretty(&store.snapshot())
        .map_err(|e| EngineError::Internal(format!("encode backup: {e}")))?;
    body.push(b'\n');
    engine.create_file(&path, body).await?;
    info!(%path, "backup written");
    Ok(path)
}

/// Returns `Ok(false)` when the record was skipped.
async fn migrate_one(store: &DocumentStore, file: &LegacyFile) -> CacheResult<bool> {
    let engine = store.engine();
    let Some(raw) = engine.read_json(&file.path).await? else {
        return Ok(false);
    };
    if is_tombstoned(&raw) {
        debug!(path = %file.path, "skipping deleted legacy record");
        return Ok(false);
    }
    let document = strip_tombstone(raw);

    let options = store.options_for(&file.collection);
    let group = options
        .group_by
        .as_deref()
        .and_then(|field| group_value(&document, field));
    let target = engine
        .paths()
        .record_path(&file.collection, &file.key, group.as_deref())?;
    if engine.read_json(&target).await?.is_some() {
        debug!(path = %file.path, %target, "structured record already exists");
        return Ok(false);
    }

    engine
        .save_record(&file.collection, &file.key, group.as_deref(), &document)
        .await?;
    store.remember(&file.collection, &file.key, document)?;
    debug!(collection = %file.collection, key = %file.key, %target, "legacy record migrated");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use repodb_engine::StoreConfig;
    use repodb_remote::InMemoryRemote;
    use serde_json::{json, Value};

    use crate::error::CacheError;
    use crate::store::DocumentStore;

    fn seed(remote: &InMemoryRemote, path: &str, doc: Value) {
        let bytes = serde_json::to_vec(&doc).unwrap();
        remote.write_external("main", path, &bytes).unwrap();
    }

    async fn legacy_store() -> (Arc<InMemoryRemote>, DocumentStore) {
        let remote = Arc::new(InMemoryRemote::new());
        seed(&remote, "data/tasks-t1.json", json!({"title": "a", "__deleted": false}));
        seed(&remote, "data/users-u1.json", json!({"id": "u1", "name": "Ann"}));
        seed(
            &remote,
            "data/tasks-gone.json",
            json!({"title": "old", "__deleted": true, "__deletedAt": "2024-01-01T00:00:00.000Z"}),
        );
        seed(&remote, "data/tasks-t2.json", json!({"title": "legacy"}));
        seed(&remote, "data/tasks/t2.json", json!({"title": "structured"}));
        let store = DocumentStore::new(StoreConfig::default(), remote.clone()).unwrap();
        store.initialize().await.unwrap();
        (remote, store)
    }

    #[tokio::test]
    async fn migrated_payload_matches_legacy_minus_bookkeeping() {
        let (remote, store) = legacy_store().await;
        let report = store.migrate_to_structured_storage(true).await.unwrap();

        assert_eq!(report.migrated, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 0);

        assert_eq!(
            remote.json("main", "data/tasks/t1.json"),
            Some(json!({"title": "a"}))
        );
        assert_eq!(
            remote.json("main", "data/users/u1/u1.json"),
            Some(json!({"id": "u1", "name": "Ann"}))
        );
        assert!(remote.file("main", "data/tasks/gone.json").is_none());
        assert_eq!(remote.json("main", "data/tasks/t2.json").unwrap()["title"], "structured");

        let index = remote.json("main", "data/tasks/index.json").unwrap();
        assert_eq!(index["count"], 2);
        assert!(remote.json("main", "data/.dbconfig.json").is_some());
    }

    #[tokio::test]
    async fn backup_snapshots_the_caches() {
        let (remote, store) = legacy_store().await;
        let report = store.migrate_to_structured_storage(true).await.unwrap();

        let path = report.backup_path.unwrap();
        assert!(path.starts_with("data/backups/backup-"));
        assert!(path.ends_with(".json"));
        assert!(remote.file("main", "data/backups/README.md").is_some());

        let backup = remote.json("main", &path).unwrap();
        assert_eq!(backup["tasks"]["t2"]["title"], "structured");
        assert_eq!(backup["users"]["u1"]["name"], "Ann");
    }

    #[tokio::test]
    async fn migration_without_backup() {
        let (remote, store) = legacy_store().await;
        let report = store.migrate_to_structured_storage(false).await.unwrap();
        assert_eq!(report.backup_path, None);
        assert!(remote.file("main", "data/backups/README.md").is_none());
    }

    #[tokio::test]
    async fn unreadable_legacy_file_is_counted() {
        let remote = Arc::new(InMemoryRemote::new());
        remote
            .write_external("main", "data/tasks-bad.json", b"{oops")
            .unwrap();
        seed(&remote, "data/tasks-ok.json", json!({"ok": true}));
        let store = DocumentStore::new(StoreConfig::default(), remote.clone()).unwrap();
        store.initialize().await.unwrap();

        let report = store.migrate_to_structured_storage(false).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.migrated, 1);
        assert!(remote.json("main", "data/tasks/ok.json").is_some());
    }

    #[tokio::test]
    async fn migration_requires_initialize() {
        let store = DocumentStore::new(StoreConfig::default(), Arc::new(InMemoryRemote::new())).unwrap();
        assert!(matches!(
            store.migrate_to_structured_storage(true).await,
            Err(CacheError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn delete_after_migration_hides_the_legacy_copy() {
        let remote = Arc::new(InMemoryRemote::new());
        seed(&remote, "data/tasks-a.json", json!({"v": 1}));
        let store = DocumentStore::new(StoreConfig::default(), remote.clone()).unwrap();
        store.initialize().await.unwrap();
        store.migrate_to_structured_storage(true).await.unwrap();

        assert!(store.collection("tasks", None).unwrap().delete("a"));
        store.save_all().await.unwrap();
        assert_eq!(remote.json("main", "data/tasks/a.json").unwrap()["__deleted"], true);

        let reloaded = DocumentStore::new(StoreConfig::default(), remote).unwrap();
        reloaded.initialize().await.unwrap();
        assert_eq!(reloaded.collection("tasks", None).unwrap().get("a"), None);
    }

    #[tokio::test]
    async fn migrating_twice_is_a_no_op() {
        let (_remote, store) = legacy_store().await;
        store.migrate_to_structured_storage(false).await.unwrap();
        let again = store.migrate_to_structured_storage(false).await.unwrap();
        assert_eq!(again.migrated, 0);
        assert_eq!(again.failed, 0);
    }
}
