use std::collections::{BTreeMap, BTreeSet};

use repodb_remote::{DirEntry, RemoteError, RemoteStore};
use repodb_types::is_tombstoned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::legacy::{parse_legacy_name, LegacyFile};
use crate::paths::{record_key, validate_collection, validate_group, PathScheme};

/// Live records by collection, then by key.
pub type LoadedData = BTreeMap<String, BTreeMap<String, Value>>;

/// A live record read from the remote.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedRecord {
    pub key: String,
    pub group: Option<String>,
    pub path: String,
    pub document: Value,
}

/// Reads collections back from the head of the branch.
///
/// Malformed and tombstoned documents are skipped. A missing directory reads
/// as empty. Listing failures other than "not found" are returned.
pub struct BulkLoader<'a> {
    remote: &'a dyn RemoteStore,
    branch: &'a str,
    paths: &'a PathScheme,
}

impl<'a> BulkLoader<'a> {
    pub fn new(remote: &'a dyn RemoteStore, branch: &'a str, paths: &'a PathScheme) -> Self {
        Self {
            remote,
            branch,
            paths,
        }
    }

    async fn list(&self, dir: &str) -> EngineResult<Option<Vec<DirEntry>>> {
        match self.remote.list_dir(self.branch, dir).await {
            Ok(entries) => Ok(Some(entries)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse one document, tombstoned or not. `None` if it is gone
    /// or malformed.
    async fn read_document(&self, path: &str) -> Option<Value> {
        let bytes = match self.remote.read_file(self.branch, path).await {
            Ok(bytes) => bytes,
            Err(RemoteError::NotFound(_)) => return None,
            Err(e) => {
                warn!(path, error = %e, "skipping unreadable document");
                return None;
            }
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(path, error = %e, "skipping malformed document");
                None
            }
        }
    }

    /// Read one record, or `None` if it is gone, malformed or tombstoned.
    pub async fn read_record(&self, path: &str) -> Option<Value> {
        let doc = self.read_document(path).await?;
        if is_tombstoned(&doc) {
            debug!(path, "skipping tombstoned document");
            return None;
        }
        Some(doc)
    }

    /// Collection directories under the data folder.
    pub async fn list_collections(&self) -> EngineResult<Vec<String>> {
        let Some(entries) = self.list(self.paths.root()).await? else {
            return Ok(Vec::new());
        };
        Ok(entries
            .into_iter()
            .filter(|e| e.is_dir() && validate_collection(&e.name).is_ok())
            .map(|e| e.name)
            .collect())
    }

    /// Live records of one collection, ungrouped files and every group.
    pub async fn collection_records(&self, collection: &str) -> EngineResult<Vec<LoadedRecord>> {
        Ok(self.scan_collection(collection).await?.0)
    }

    /// Live records of one collection plus the keys that have a tombstoned
    /// copy somewhere in it.
    async fn scan_collection(&self, collection: &str) -> EngineResult<(Vec<LoadedRecord>, BTreeSet<String>)> {
        let mut records = Vec::new();
        let mut deleted = BTreeSet::new();
        let dir = self.paths.collection_dir(collection)?;
        let Some(entries) = self.list(&dir).await? else {
            return Ok((records, deleted));
        };

        for entry in entries {
            if entry.is_file() {
                self.collect(&entry, None, &mut records, &mut deleted).await;
            } else if validate_group(&entry.name).is_ok() {
                let Some(members) = self.list(&entry.path).await? else {
                    continue;
                };
                for member in members.iter().filter(|m| m.is_file()) {
                    self.collect(member, Some(&entry.name), &mut records, &mut deleted)
                        .await;
                }
            }
        }
        Ok((records, deleted))
    }

    async fn collect(
        &self,
        entry: &DirEntry,
        group: Option<&str>,
        out: &mut Vec<LoadedRecord>,
        deleted: &mut BTreeSet<String>,
    ) {
        let Some(key) = record_key(&entry.name) else {
            return;
        };
        let Some(document) = self.read_document(&entry.path).await else {
            return;
        };
        if is_tombstoned(&document) {
            debug!(path = %entry.path, "skipping tombstoned document");
            deleted.insert(key.to_string());
            return;
        }
        out.push(LoadedRecord {
            key: key.to_string(),
            group: group.map(str::to_string),
            path: entry.path.clone(),
            document,
        });
    }

    /// Record files in the flat `<collection>-<key>.json` layout.
    pub async fn list_legacy(&self) -> EngineResult<Vec<LegacyFile>> {
        let Some(entries) = self.list(self.paths.root()).await? else {
            return Ok(Vec::new());
        };
        Ok(entries
            .into_iter()
            .filter(DirEntry::is_file)
            .filter_map(|e| {
                let (collection, key) = parse_legacy_name(&e.name)?;
                Some(LegacyFile {
                    collection: collection.to_string(),
                    key: key.to_string(),
                    path: e.path.clone(),
                })
            })
            .collect())
    }

    /// Every live record in the data folder.
    ///
    /// With `include_legacy`, flat-layout records fill in keys the structured
    /// layout does not have. A tombstoned structured record shadows its
    /// legacy copy.
    pub async fn load_all(&self, include_legacy: bool) -> EngineResult<LoadedData> {
        let mut data = LoadedData::new();
        let mut deleted: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for collection in self.list_collections().await? {
            let (records, tombstoned) = self.scan_collection(&collection).await?;
            debug!(%collection, records = records.len(), "collection loaded");
            let map = data.entry(collection.clone()).or_default();
            for record in records {
                map.insert(record.key, record.document);
            }
            deleted.insert(collection, tombstoned);
        }

        if include_legacy {
            let mut legacy_count = 0usize;
            for file in self.list_legacy().await? {
                let shadowed = deleted
                    .get(&file.collection)
                    .is_some_and(|keys| keys.contains(&file.key));
                if shadowed {
                    debug!(path = %file.path, "legacy record was deleted in the structured layout");
                    continue;
                }
                let Some(document) = self.read_record(&file.path).await else {
                    continue;
                };
                let map = data.entry(file.collection).or_default();
                if !map.contains_key(&file.key) {
                    map.insert(file.key, document);
                    legacy_count += 1;
                }
            }
            if legacy_count > 0 {
                info!(records = legacy_count, "loaded records from legacy layout");
            }
        }

        let total: usize = data.values().map(BTreeMap::len).sum();
        info!(collections = data.len(), records = total, "bulk load complete");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repodb_remote::InMemoryRemote;
    use serde_json::json;

    fn seed(remote: &InMemoryRemote, path: &str, doc: &Value) {
        let bytes = serde_json::to_vec(doc).unwrap();
        remote.write_external("main", path, &bytes).unwrap();
    }

    fn scheme() -> PathScheme {
        PathScheme::new("data").unwrap()
    }

    #[tokio::test]
    async fn missing_data_folder_loads_empty() {
        let remote = InMemoryRemote::new();
        let paths = scheme();
        let loader = BulkLoader::new(&remote, "main", &paths);
        assert!(loader.load_all(true).await.unwrap().is_empty());
        assert!(loader.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn loads_ungrouped_and_grouped_records() {
        let remote = InMemoryRemote::new();
        seed(&remote, "data/tasks/t1.json", &json!({"id": "t1"}));
        seed(&remote, "data/tasks/index.json", &json!({"name": "tasks"}));
        seed(&remote, "data/users/u1/u1.json", &json!({"id": "u1"}));
        seed(&remote, "data/users/u1/__profile.json", &json!({"bio": "x"}));
        remote
            .write_external("main", "data/users/README.md", b"# users")
            .unwrap();

        let paths = scheme();
        let loader = BulkLoader::new(&remote, "main", &paths);
        let data = loader.load_all(false).await.unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(data["tasks"].len(), 1);
        assert_eq!(data["tasks"]["t1"], json!({"id": "t1"}));
        assert_eq!(data["users"].len(), 1);
        assert_eq!(data["users"]["u1"]["id"], "u1");

        let records = loader.collection_records("users").await.unwrap();
        assert_eq!(records[0].group.as_deref(), Some("u1"));
        assert_eq!(records[0].path, "data/users/u1/u1.json");
    }

    #[tokio::test]
    async fn skips_malformed_and_tombstoned() {
        let remote = InMemoryRemote::new();
        seed(&remote, "data/tasks/live.json", &json!({"ok": true}));
        seed(
            &remote,
            "data/tasks/gone.json",
            &json!({"ok": true, "__deleted": true, "__deletedAt": "2024-01-01T00:00:00.000Z"}),
        );
        remote
            .write_external("main", "data/tasks/broken.json", b"{not json")
            .unwrap();

        let paths = scheme();
        let data = BulkLoader::new(&remote, "main", &paths)
            .load_all(false)
            .await
            .unwrap();
        let keys: Vec<_> = data["tasks"].keys().cloned().collect();
        assert_eq!(keys, vec!["live"]);
    }

    #[tokio::test]
    async fn backups_dir_is_not_a_collection() {
        let remote = InMemoryRemote::new();
        seed(&remote, "data/backups/backup-1.json", &json!({}));
        seed(&remote, "data/tasks/a.json", &json!({}));

        let paths = scheme();
        let loader = BulkLoader::new(&remote, "main", &paths);
        assert_eq!(loader.list_collections().await.unwrap(), vec!["tasks"]);
    }

    #[tokio::test]
    async fn legacy_records_have_lower_precedence() {
        let remote = InMemoryRemote::new();
        seed(&remote, "data/tasks/t1.json", &json!({"v": "structured"}));
        seed(&remote, "data/tasks-t1.json", &json!({"v": "legacy"}));
        seed(&remote, "data/tasks-t2.json", &json!({"v": "legacy"}));
        seed(&remote, "data/notes-n-1.json", &json!({"v": "legacy"}));

        let paths = scheme();
        let loader = BulkLoader::new(&remote, "main", &paths);

        let legacy = loader.list_legacy().await.unwrap();
        assert_eq!(legacy.len(), 3);
        assert!(legacy
            .iter()
            .any(|f| f.collection == "notes" && f.key == "n-1" && f.path == "data/notes-n-1.json"));

        let data = loader.load_all(true).await.unwrap();
        assert_eq!(data["tasks"]["t1"]["v"], "structured");
        assert_eq!(data["tasks"]["t2"]["v"], "legacy");
        assert_eq!(data["notes"]["n-1"]["v"], "legacy");

        let without = loader.load_all(false).await.unwrap();
        assert!(!without["tasks"].contains_key("t2"));
        assert!(!without.contains_key("notes"));
    }

    #[tokio::test]
    async fn listing_failure_is_returned() {
        let remote = InMemoryRemote::new();
        seed(&remote, "data/tasks/a.json", &json!({}));
        remote.fail_next(1);
        let paths = scheme();
        let err = BulkLoader::new(&remote, "main", &paths)
            .load_all(false)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn deleted_structured_record_shadows_legacy_copy() {
        let remote = InMemoryRemote::new();
        seed(&remote, "data/tasks-a.json", &json!({"v": 1}));
        seed(
            &remote,
            "data/tasks/a.json",
            &json!({"v": 1, "__deleted": true, "__deletedAt": "2024-01-01T00:00:00.000Z"}),
        );
        seed(&remote, "data/tasks-b.json", &json!({"v": 2}));

        let paths = scheme();
        let data = BulkLoader::new(&remote, "main", &paths)
            .load_all(true)
            .await
            .unwrap();
        assert!(!data["tasks"].contains_key("a"));
        assert_eq!(data["tasks"]["b"]["v"], 2);
    }

    #[tokio::test]
    async fn live_copy_beats_tombstone_in_another_group() {
        let remote = InMemoryRemote::new();
        seed(
            &remote,
            "data/activeSessions/u7/s1.json",
            &json!({"userId": "u7", "__deleted": true, "__deletedAt": "2024-01-01T00:00:00.000Z"}),
        );
        seed(&remote, "data/activeSessions/u1/s1.json", &json!({"userId": "u1"}));

        let paths = scheme();
        let data = BulkLoader::new(&remote, "main", &paths)
            .load_all(true)
            .await
            .unwrap();
        assert_eq!(data["activeSessions"]["s1"]["userId"], "u1");
    }
}
