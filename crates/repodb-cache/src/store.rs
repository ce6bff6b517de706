use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use repodb_engine::paths::validate_collection;
use repodb_engine::{CollectionOptions, EngineError, StorageEngine, StoreConfig};
use repodb_remote::{GitHubConfig, GitHubRemote, RemoteStore};
use repodb_types::timestamp;
use serde_json::{json, Map, Value};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::collection::{CollectionCache, PersistFailure, WritePolicy};
use crate::error::{CacheError, CacheResult};
use crate::migrate::{self, MigrationReport};

/// Version written into the database metadata file.
pub const METADATA_VERSION: &str = "1.0.0";

const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// Entry point for applications: owns the storage engine and one
/// [`CollectionCache`] per collection.
///
/// Call [`initialize`](Self::initialize) once before using collections; it
/// loads every stored record into memory.
pub struct DocumentStore {
    config: StoreConfig,
    engine: StorageEngine,
    runtime: Handle,
    policy: WritePolicy,
    collections: RwLock<BTreeMap<String, CollectionCache>>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    failures: broadcast::Sender<PersistFailure>,
}

impl DocumentStore {
    /// Build a store over an existing remote. Must run inside a Tokio runtime.
    pub fn new(config: StoreConfig, remote: Arc<dyn RemoteStore>) -> CacheResult<Self> {
        let engine = StorageEngine::new(&config, remote)?;
        let runtime = Handle::try_current()
            .map_err(|e| EngineError::Internal(format!("document store needs a tokio runtime: {e}")))?;
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Ok(Self {
            policy: WritePolicy::from_config(&config),
            config,
            engine,
            runtime,
            collections: RwLock::new(BTreeMap::new()),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            failures,
        })
    }

    /// Build a store backed by the GitHub repository named in `config`.
    pub fn connect(config: StoreConfig) -> CacheResult<Self> {
        config.validate_remote()?;
        let remote = GitHubRemote::new(GitHubConfig {
            api_url: config.api_url.clone(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            token: config.token.clone(),
            request_timeout: config.request_timeout(),
        })
        .map_err(EngineError::from)?;
        info!(owner = %config.owner, repo = %config.repo, branch = %config.branch, "connecting to github");
        Self::new(config, Arc::new(remote))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> CacheResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CacheError::NotInitialized)
        }
    }

    fn read_collections(&self) -> RwLockReadGuard<'_, BTreeMap<String, CollectionCache>> {
        self.collections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_collections(&self) -> RwLockWriteGuard<'_, BTreeMap<String, CollectionCache>> {
        self.collections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the data folder if needed and load every stored record.
    ///
    /// Calling it again after success does nothing.
    pub async fn initialize(&self) -> CacheResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        self.engine.initialize().await?;
        let data = self.engine.load_all().await?;
        let mut records = 0;
        for (name, loaded) in data {
            let cache = self.get_or_create(&name, None)?;
            let added = cache.seed(loaded);
            debug!(collection = %name, records = added, "collection cache seeded");
            records += added;
        }

        self.initialized.store(true, Ordering::Release);
        info!(
            collections = self.read_collections().len(),
            records,
            "document store initialized"
        );
        Ok(())
    }

    fn get_or_create(&self, name: &str, options: Option<CollectionOptions>) -> CacheResult<CollectionCache> {
        if let Some(cache) = self.read_collections().get(name) {
            return Ok(cache.clone());
        }
        validate_collection(name)?;
        let mut collections = self.write_collections();
        let cache = collections.entry(name.to_string()).or_insert_with(|| {
            let options = options.unwrap_or_else(|| self.config.collection_options(name));
            debug!(collection = name, ?options, "collection cache created");
            CollectionCache::new(
                name.to_string(),
                options,
                self.engine.clone(),
                self.runtime.clone(),
                self.policy.clone(),
                self.failures.clone(),
            )
        });
        Ok(cache.clone())
    }

    /// The cache for `name`, created on first use.
    ///
    /// `options` only apply when the cache is created; without them the
    /// configured options for `name` are used.
    pub fn collection(&self, name: &str, options: Option<CollectionOptions>) -> CacheResult<CollectionCache> {
        self.ensure_initialized()?;
        self.get_or_create(name, options)
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.read_collections().contains_key(name)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.read_collections().keys().cloned().collect()
    }

    fn caches(&self) -> Vec<CollectionCache> {
        self.read_collections().values().cloned().collect()
    }

    /// Grouping options in effect for `name`.
    pub(crate) fn options_for(&self, name: &str) -> CollectionOptions {
        match self.read_collections().get(name) {
            Some(cache) => cache.options().clone(),
            None => self.config.collection_options(name),
        }
    }

    /// Put a record into the cache of `collection` without writing it.
    pub(crate) fn remember(&self, collection: &str, key: &str, document: Value) -> CacheResult<()> {
        self.get_or_create(collection, None)?
            .seed([(key.to_string(), document)]);
        Ok(())
    }

    /// Flush every collection. Each collection is flushed even if an
    /// earlier one fails; the first error is returned.
    pub async fn save_all(&self) -> CacheResult<()> {
        let mut first_error = None;
        for cache in self.caches() {
            if let Err(e) = cache.save_all().await {
                warn!(collection = cache.name(), error = %e, "collection flush failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Contents of every cache, keyed by collection name.
    pub fn snapshot(&self) -> Value {
        let map: Map<String, Value> = self
            .caches()
            .into_iter()
            .map(|cache| (cache.name().to_string(), Value::Object(cache.to_object())))
            .collect();
        Value::Object(map)
    }

    pub async fn save_group_data(
        &self,
        collection: &str,
        group: &str,
        doc_type: &str,
        data: &Value,
    ) -> CacheResult<()> {
        self.ensure_initialized()?;
        self.engine
            .save_group_data(collection, group, doc_type, data)
            .await?;
        Ok(())
    }

    pub async fn load_group_data(
        &self,
        collection: &str,
        group: &str,
        doc_type: &str,
    ) -> CacheResult<Option<Value>> {
        self.ensure_initialized()?;
        Ok(self.engine.load_group_data(collection, group, doc_type).await?)
    }

    /// Write `<data>/.dbconfig.json` describing the store. The first
    /// creation time is kept when the file already exists.
    pub async fn create_database_metadata(&self) -> CacheResult<Value> {
        self.ensure_initialized()?;
        let path = self.engine.paths().metadata_path();
        let now = timestamp();
        let created = match self.engine.read_json(&path).await {
            Ok(Some(existing)) => existing
                .get("created")
                .and_then(Value::as_str)
                .map(str::to_string),
            Ok(None) => None,
            Err(e) => {
                warn!(%path, error = %e, "ignoring unreadable metadata file");
                None
            }
        };

        let grouped = self
            .caches()
            .iter()
            .any(|cache| cache.options().group_by.is_some());
        let metadata = json!({
            "version": METADATA_VERSION,
            "collections": self.collection_names(),
            "created": created.unwrap_or_else(|| now.clone()),
            "lastUpdated": now,
            "config": {
                "useStructuredStorage": true,
                "useGrouping": grouped,
                "shardingEnabled": grouped,
                "dataFolder": self.config.data_folder,
                "branch": self.config.branch,
                "maintainIndex": self.config.maintain_index,
                "autoSave": self.config.auto_save,
            }
        });

        let mut body = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| EngineError::Internal(format!("encode metadata: {e}")))?;
        body.push(b'\n');
        self.engine.create_file(&path, body).await?;
        info!(%path, "database metadata written");
        Ok(metadata)
    }

    /// Rewrite records still in the flat `<collection>-<key>.json` layout
    /// into the structured layout.
    pub async fn migrate_to_structured_storage(&self, backup_first: bool) -> CacheResult<MigrationReport> {
        self.ensure_initialized()?;
        migrate::run(self, backup_first).await
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<PersistFailure> {
        self.failures.subscribe()
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .field("collections", &self.collection_names())
            .finish()
    }
}
