//! In-memory collection caches.
//!
//! A [`CollectionCache`] owns the live records of one collection. Reads are
//! served from memory and never suspend. Mutations update memory first and
//! then schedule a durable write on the engine's queue: immediately, after a
//! per-key debounce window, or (with `auto_save` off) only when the caller
//! asks for it.
//!
//! Writes are enqueued synchronously while the key bookkeeping is locked, so
//! for any one key the queue sees changes in the order they were made. A
//! failed write is retried with exponential backoff; once the retry budget is
//! spent, or the error is permanent, a [`PersistFailure`] is broadcast.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use repodb_engine::paths::{validate_group, validate_key};
use repodb_engine::{CollectionOptions, EngineError, RetryPolicy, StorageEngine, StoreConfig, WriteOp};
use repodb_types::{group_value, timestamp};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};

/// A record whose durable write was abandoned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistFailure {
    pub collection: String,
    pub key: String,
    /// Attempts made, including the first.
    pub attempts: u32,
    pub error: String,
}

/// When and how a cache writes through to the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct WritePolicy {
    pub debounce: Duration,
    pub auto_save: bool,
    pub retry: RetryPolicy,
}

impl WritePolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            debounce: config.debounce(),
            auto_save: config.auto_save,
            retry: config.retry.clone(),
        }
    }
}

#[derive(Clone, Debug)]
enum Intent {
    Save,
    Delete { group: Option<String> },
}

/// A debounce or backoff timer for one key.
struct Timer {
    id: u64,
    generation: u64,
    attempt: u32,
    intent: Intent,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct KeyState {
    /// Bumped on every change to a key; a failed write for an older
    /// generation is not retried.
    generations: HashMap<String, u64>,
    timers: HashMap<String, Timer>,
    dirty: BTreeSet<String>,
    /// Groups that may still hold a live stored copy of each key. `None`
    /// stands for the ungrouped path.
    stored: HashMap<String, BTreeSet<Option<String>>>,
    next_timer: u64,
}

impl KeyState {
    fn bump(&mut self, key: &str) -> u64 {
        let generation = self.generations.entry(key.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    fn generation(&self, key: &str) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    fn cancel(&mut self, key: &str) {
        if let Some(timer) = self.timers.remove(key) {
            timer.handle.abort();
        }
    }

    fn stored_outside(&self, key: &str, group: &Option<String>) -> Vec<Option<String>> {
        self.stored
            .get(key)
            .map(|groups| groups.iter().filter(|g| *g != group).cloned().collect())
            .unwrap_or_default()
    }

    /// Record where `key` lives after a successful write: `Some(group)` for a
    /// save, `None` for a delete. Skipped when a newer change is already on
    /// its way.
    fn settle(&mut self, key: &str, generation: u64, landed: Option<Option<String>>) {
        if self.generation(key) != generation {
            return;
        }
        match landed {
            Some(group) => {
                self.stored.insert(key.to_string(), BTreeSet::from([group]));
            }
            None => {
                self.stored.remove(key);
            }
        }
    }
}

type WriteTask = JoinHandle<Result<(), String>>;

struct CacheInner {
    name: String,
    options: CollectionOptions,
    engine: StorageEngine,
    runtime: Handle,
    policy: WritePolicy,
    failures: broadcast::Sender<PersistFailure>,
    data: RwLock<BTreeMap<String, Value>>,
    // Lock order: `keys` before `data`, never the reverse.
    keys: Mutex<KeyState>,
    inflight: Mutex<Vec<WriteTask>>,
}

/// Write-behind cache of one collection.
///
/// Cloning is cheap; clones share the same records and timers. Values are
/// cloned out of the cache, never borrowed.
#[derive(Clone)]
pub struct CollectionCache {
    inner: Arc<CacheInner>,
}

impl CollectionCache {
    pub(crate) fn new(
        name: String,
        options: CollectionOptions,
        engine: StorageEngine,
        runtime: Handle,
        policy: WritePolicy,
        failures: broadcast::Sender<PersistFailure>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name,
                options,
                engine,
                runtime,
                policy,
                failures,
                data: RwLock::new(BTreeMap::new()),
                keys: Mutex::new(KeyState::default()),
                inflight: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.inner.options
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.inner.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Value>> {
        self.inner.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, KeyState> {
        self.inner.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inflight(&self) -> MutexGuard<'_, Vec<WriteTask>> {
        self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- reads ---------------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.read().values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All records as one JSON object keyed by record key.
    pub fn to_object(&self) -> Map<String, Value> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// First record (in key order) matching `pred`.
    ///
    /// The predicate runs under the cache's read lock and must not mutate
    /// this cache.
    pub fn find<F>(&self, mut pred: F) -> Option<(String, Value)>
    where
        F: FnMut(&str, &Value) -> bool,
    {
        self.read()
            .iter()
            .find(|(k, v)| pred(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Every record matching `pred`, in key order.
    pub fn filter<F>(&self, mut pred: F) -> Vec<(String, Value)>
    where
        F: FnMut(&str, &Value) -> bool,
    {
        self.read()
            .iter()
            .filter(|(k, v)| pred(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Keys waiting on a debounce or retry timer.
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.state().timers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys changed since the last flush when `auto_save` is off.
    pub fn dirty_keys(&self) -> Vec<String> {
        self.state().dirty.iter().cloned().collect()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<PersistFailure> {
        self.inner.failures.subscribe()
    }

    // -- mutations -----------------------------------------------------------

    /// Replace the record at `key`.
    ///
    /// Memory is updated before this returns. With `immediate` the durable
    /// write is queued now; otherwise the key's debounce timer is restarted
    /// and only the latest value is written when it expires.
    pub fn set(&self, key: &str, value: Value, immediate: bool) -> CacheResult<()> {
        validate_key(key)?;
        if let Some(group) = self.group_for(&value) {
            validate_group(&group)?;
        }
        self.write().insert(key.to_string(), value);

        let mut state = self.state();
        let generation = state.bump(key);
        state.cancel(key);
        if !self.inner.policy.auto_save {
            state.dirty.insert(key.to_string());
            return Ok(());
        }
        if immediate {
            self.dispatch(&mut state, key, Intent::Save, generation, 1);
        } else {
            let delay = self.inner.policy.debounce;
            self.schedule(&mut state, key, Intent::Save, generation, 1, delay);
        }
        Ok(())
    }

    /// Remove `key` and queue a tombstone write. Returns `false` if the key
    /// was not cached.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.write().remove(key);
        let Some(previous) = removed else {
            return false;
        };
        let group = self.group_for(&previous);

        let mut state = self.state();
        let generation = state.bump(key);
        state.cancel(key);
        state.dirty.remove(key);
        if self.inner.policy.auto_save {
            self.dispatch(&mut state, key, Intent::Delete { group }, generation, 1);
        }
        true
    }

    /// Remove `key` and write its tombstone now, whether or not `auto_save`
    /// is on. Returns `Ok(false)` if the key was not cached.
    pub async fn delete_now(&self, key: &str) -> CacheResult<bool> {
        let (pending, generation, intent) = {
            let mut state = self.state();
            let Some(previous) = self.write().remove(key) else {
                return Ok(false);
            };
            let generation = state.bump(key);
            state.cancel(key);
            state.dirty.remove(key);
            let group = self.group_for(&previous);
            let op = self.delete_op(&state, key, &group);
            (self.inner.engine.enqueue(op), generation, Intent::Delete { group })
        };

        let result = match pending {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => {
                debug!(collection = %self.inner.name, key, path = %outcome.path, "record deleted");
                self.state().settle(key, generation, None);
                Ok(true)
            }
            Err(e) => {
                let mut state = self.state();
                self.handle_failure(&mut state, key, intent, generation, 1, &e);
                Err(e.into())
            }
        }
    }

    /// Delete every record. Returns how many were removed.
    pub fn clear(&self) -> usize {
        self.keys().iter().filter(|key| self.delete(key)).count()
    }

    /// Insert a new record, stamping `id`, `createdAt` and `updatedAt`, and
    /// write it immediately. An `id` already present in `data` is kept.
    pub fn create(&self, data: Value) -> CacheResult<Value> {
        let Value::Object(mut doc) = data else {
            return Err(self.invalid("create expects a JSON object"));
        };
        let existing = match doc.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        let id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::now_v7().to_string();
                doc.insert("id".into(), Value::String(id.clone()));
                id
            }
        };
        let now = timestamp();
        doc.insert("createdAt".into(), Value::String(now.clone()));
        doc.insert("updatedAt".into(), Value::String(now));

        let doc = Value::Object(doc);
        self.set(&id, doc.clone(), true)?;
        Ok(doc)
    }

    /// Shallow-merge `partial` into the record at `key`, bump `updatedAt`
    /// and write it immediately.
    pub fn update(&self, key: &str, partial: Value) -> CacheResult<Value> {
        let Value::Object(patch) = partial else {
            return Err(self.invalid("update expects a JSON object"));
        };
        let current = self.get(key).ok_or_else(|| CacheError::RecordNotFound {
            collection: self.inner.name.clone(),
            key: key.to_string(),
        })?;
        let Value::Object(mut doc) = current else {
            return Err(self.invalid(format!("record {key} is not a JSON object")));
        };
        doc.extend(patch);
        doc.insert("updatedAt".into(), Value::String(timestamp()));

        let doc = Value::Object(doc);
        self.set(key, doc.clone(), true)?;
        Ok(doc)
    }

    /// Write the current value of `key` and wait for the result.
    ///
    /// Any pending timer for the key is cancelled. On failure the error is
    /// returned and the key goes back to the usual retry (or dirty) handling.
    pub async fn persist(&self, key: &str) -> CacheResult<()> {
        let (pending, generation, landed) = {
            let mut state = self.state();
            state.cancel(key);
            state.dirty.remove(key);
            let generation = state.generation(key);
            let Some(op) = self.build_op(&state, key, &Intent::Save) else {
                return Err(CacheError::RecordNotFound {
                    collection: self.inner.name.clone(),
                    key: key.to_string(),
                });
            };
            let landed = Self::track(&mut state, key, &op);
            (self.inner.engine.enqueue(op), generation, landed)
        };

        let result = match pending {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => {
                debug!(collection = %self.inner.name, key, path = %outcome.path, "record persisted");
                self.state().settle(key, generation, landed);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state();
                self.handle_failure(&mut state, key, Intent::Save, generation, 1, &e);
                Err(e.into())
            }
        }
    }

    /// Flush every pending and dirty key now and wait for all queued writes
    /// of this cache. Keys whose write failed are reported in
    /// [`CacheError::Unsaved`].
    pub async fn save_all(&self) -> CacheResult<()> {
        {
            let mut state = self.state();
            let timers: Vec<(String, Timer)> = state.timers.drain().collect();
            for (key, timer) in timers {
                timer.handle.abort();
                self.dispatch(&mut state, &key, timer.intent, timer.generation, timer.attempt);
            }
            let dirty = std::mem::take(&mut state.dirty);
            for key in dirty {
                let generation = state.generation(&key);
                self.dispatch(&mut state, &key, Intent::Save, generation, 1);
            }
        }

        let tasks = std::mem::take(&mut *self.inflight());
        let mut failed = Vec::new();
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(key)) => failed.push(key),
                Err(e) => warn!(collection = %self.inner.name, error = %e, "write task ended abnormally"),
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        failed.sort();
        failed.dedup();
        Err(CacheError::Unsaved {
            collection: self.inner.name.clone(),
            keys: failed,
        })
    }

    /// Fill the cache from loaded records without writing anything back.
    /// Keys already in memory win.
    pub(crate) fn seed(&self, records: impl IntoIterator<Item = (String, Value)>) -> usize {
        let mut state = self.state();
        let mut data = self.write();
        let mut added = 0;
        for (key, value) in records {
            state
                .stored
                .entry(key.clone())
                .or_default()
                .insert(self.group_for(&value));
            if !data.contains_key(&key) {
                data.insert(key, value);
                added += 1;
            }
        }
        added
    }

    // -- write plumbing ------------------------------------------------------

    fn group_for(&self, doc: &Value) -> Option<String> {
        let field = self.inner.options.group_by.as_deref()?;
        group_value(doc, field)
    }

    fn invalid(&self, reason: impl Into<String>) -> CacheError {
        CacheError::InvalidDocument {
            collection: self.inner.name.clone(),
            reason: reason.into(),
        }
    }

    fn build_op(&self, state: &KeyState, key: &str, intent: &Intent) -> Option<WriteOp> {
        match intent {
            Intent::Save => {
                let document = self.read().get(key)?.clone();
                let group = self.group_for(&document);
                Some(WriteOp::SaveRecord {
                    collection: self.inner.name.clone(),
                    key: key.to_string(),
                    previous_groups: state.stored_outside(key, &group),
                    group,
                    document,
                })
            }
            Intent::Delete { group } => Some(self.delete_op(state, key, group)),
        }
    }

    fn delete_op(&self, state: &KeyState, key: &str, group: &Option<String>) -> WriteOp {
        WriteOp::DeleteRecord {
            collection: self.inner.name.clone(),
            key: key.to_string(),
            group: group.clone(),
            previous_groups: state.stored_outside(key, group),
        }
    }

    /// Note the group a queued save targets. Returns what to
    /// [`settle`](KeyState::settle) once the write lands.
    fn track(state: &mut KeyState, key: &str, op: &WriteOp) -> Option<Option<String>> {
        match op {
            WriteOp::SaveRecord { group, .. } => {
                state
                    .stored
                    .entry(key.to_string())
                    .or_default()
                    .insert(group.clone());
                Some(group.clone())
            }
            _ => None,
        }
    }

    /// Queue a write for `key` and track its completion.
    fn dispatch(&self, state: &mut KeyState, key: &str, intent: Intent, generation: u64, attempt: u32) {
        let Some(op) = self.build_op(state, key, &intent) else {
            debug!(collection = %self.inner.name, key, "record removed before its write, skipping");
            return;
        };
        let landed = Self::track(state, key, &op);
        let pending = match self.inner.engine.enqueue(op) {
            Ok(pending) => pending,
            Err(e) => {
                self.handle_failure(state, key, intent, generation, attempt, &e);
                return;
            }
        };

        let cache = self.clone();
        let key = key.to_string();
        let task = self.inner.runtime.spawn(async move {
            match pending.wait().await {
                Ok(outcome) => {
                    debug!(
                        collection = %cache.inner.name,
                        key = %key,
                        path = %outcome.path,
                        attempt,
                        "record persisted"
                    );
                    cache.state().settle(&key, generation, landed);
                    Ok(())
                }
                Err(e) => {
                    let mut state = cache.state();
                    cache.handle_failure(&mut state, &key, intent, generation, attempt, &e);
                    Err(key)
                }
            }
        });

        let mut inflight = self.inflight();
        inflight.retain(|task| !task.is_finished());
        inflight.push(task);
    }

    fn schedule(
        &self,
        state: &mut KeyState,
        key: &str,
        intent: Intent,
        generation: u64,
        attempt: u32,
        delay: Duration,
    ) {
        state.cancel(key);
        state.next_timer += 1;
        let id = state.next_timer;

        let cache = self.clone();
        let owned = key.to_string();
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            cache.fire(&owned, id);
        });
        state.timers.insert(
            key.to_string(),
            Timer {
                id,
                generation,
                attempt,
                intent,
                handle,
            },
        );
    }

    fn fire(&self, key: &str, id: u64) {
        let mut state = self.state();
        match state.timers.get(key) {
            Some(timer) if timer.id == id => {}
            _ => return,
        }
        if let Some(timer) = state.timers.remove(key) {
            self.dispatch(&mut state, key, timer.intent, timer.generation, timer.attempt);
        }
    }

    fn handle_failure(
        &self,
        state: &mut KeyState,
        key: &str,
        intent: Intent,
        generation: u64,
        attempt: u32,
        err: &EngineError,
    ) {
        let name = &self.inner.name;
        if state.generation(key) != generation {
            debug!(collection = %name, key, error = %err, "failed write superseded by a newer change");
            return;
        }
        if !self.inner.policy.auto_save {
            if matches!(intent, Intent::Save) {
                state.dirty.insert(key.to_string());
            }
            warn!(collection = %name, key, error = %err, "write failed; record stays dirty");
            return;
        }

        let retry = &self.inner.policy.retry;
        if err.is_retryable() && retry.allows_retry(attempt) {
            let delay = retry.delay_for(attempt);
            warn!(
                collection = %name,
                key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "write failed, retrying"
            );
            self.schedule(state, key, intent, generation, attempt + 1, delay);
            return;
        }

        error!(collection = %name, key, attempts = attempt, error = %err, "giving up on durable write");
        // Nobody listening is fine; the error log above stands.
        let _ = self.inner.failures.send(PersistFailure {
            collection: name.clone(),
            key: key.to_string(),
            attempts: attempt,
            error: err.to_string(),
        });
    }
}

impl std::fmt::Debug for CollectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionCache")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .field("records", &self.len())
            .finish()
    }
}
