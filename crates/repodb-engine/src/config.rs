use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::paths::{validate_collection, PathScheme};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Per-collection layout options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionOptions {
    /// Field whose value selects the record's group directory.
    pub group_by: Option<String>,
    /// Nominal records per group. Advisory only.
    pub shard_size: usize,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            group_by: None,
            shard_size: 1000,
        }
    }
}

impl CollectionOptions {
    /// Options grouping records by `field`.
    pub fn grouped_by(field: impl Into<String>) -> Self {
        Self {
            group_by: Some(field.into()),
            ..Self::default()
        }
    }
}

/// Bounded exponential backoff for failed durable writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 5_000,
            multiplier: 2.0,
            max_backoff_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Returns `true` if another attempt is allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Configuration for one document store.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub owner: String,
    pub repo: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub branch: String,
    pub data_folder: String,
    pub api_url: String,
    /// Quiet period before a non-immediate `set` is written.
    pub debounce_ms: u64,
    /// When false, writes happen only on `save_all`/`persist`.
    pub auto_save: bool,
    pub write_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub maintain_index: bool,
    /// Serve records still in the flat `<collection>-<key>.json` layout.
    pub load_legacy: bool,
    pub collections: BTreeMap<String, CollectionOptions>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            token: String::new(),
            branch: "main".into(),
            data_folder: "data".into(),
            api_url: DEFAULT_API_URL.into(),
            debounce_ms: 1000,
            auto_save: true,
            write_timeout_ms: 60_000,
            request_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            maintain_index: true,
            load_legacy: true,
            collections: default_collections(),
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("token", &if self.token.is_empty() { "" } else { "<redacted>" })
            .field("branch", &self.branch)
            .field("data_folder", &self.data_folder)
            .field("api_url", &self.api_url)
            .field("debounce_ms", &self.debounce_ms)
            .field("auto_save", &self.auto_save)
            .field("write_timeout_ms", &self.write_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("retry", &self.retry)
            .field("maintain_index", &self.maintain_index)
            .field("load_legacy", &self.load_legacy)
            .field("collections", &self.collections)
            .finish()
    }
}

/// Grouping used by the application's built-in collections.
pub fn default_collections() -> BTreeMap<String, CollectionOptions> {
    BTreeMap::from([
        ("users".to_string(), CollectionOptions::grouped_by("id")),
        ("activeSessions".to_string(), CollectionOptions::grouped_by("userId")),
        (
            "clientsMessageHistory".to_string(),
            CollectionOptions::grouped_by("clientId"),
        ),
    ])
}

impl StoreConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> EngineResult<Self> {
        toml::from_str(s).map_err(|e| EngineError::Validation(format!("invalid config: {e}")))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `GITHUB_*` variables from the process environment.
    pub fn apply_env(&mut self) -> EngineResult<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overlay `GITHUB_*` variables using `lookup` as the environment.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> EngineResult<()> {
        let set = |target: &mut String, name: &str| {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                *target = value;
            }
        };
        set(&mut self.token, "GITHUB_TOKEN");
        set(&mut self.owner, "GITHUB_OWNER");
        set(&mut self.repo, "GITHUB_REPO");
        set(&mut self.branch, "GITHUB_BRANCH");
        set(&mut self.data_folder, "GITHUB_DATA_FOLDER");
        set(&mut self.api_url, "GITHUB_API_URL");

        if let Some(raw) = lookup("GITHUB_SAVE_DEBOUNCE").filter(|v| !v.is_empty()) {
            self.debounce_ms = raw.trim().parse().map_err(|_| {
                EngineError::Validation(format!("GITHUB_SAVE_DEBOUNCE is not a number: {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup("GITHUB_AUTO_SAVE") {
            self.auto_save = raw.trim() != "false";
        }
        Ok(())
    }

    /// Check everything except remote credentials.
    pub fn validate(&self) -> EngineResult<()> {
        if self.branch.trim().is_empty() {
            return Err(EngineError::Validation("branch is empty".into()));
        }
        PathScheme::new(&self.data_folder)?;
        if self.write_timeout_ms == 0 {
            return Err(EngineError::Validation("write_timeout_ms must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(EngineError::Validation("request_timeout_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Validation("retry.max_attempts must be at least 1".into()));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(EngineError::Validation("retry.multiplier must be >= 1.0".into()));
        }
        for (name, options) in &self.collections {
            validate_collection(name)?;
            if options.group_by.as_deref().is_some_and(str::is_empty) {
                return Err(EngineError::Validation(format!(
                    "collection {name}: group_by is empty"
                )));
            }
        }
        Ok(())
    }

    /// Check the credentials a hosted remote needs.
    pub fn validate_remote(&self) -> EngineResult<()> {
        let missing: Vec<&str> = [
            ("token", &self.token),
            ("owner", &self.owner),
            ("repo", &self.repo),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "missing remote settings: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Options for `name`, falling back to ungrouped defaults.
    pub fn collection_options(&self, name: &str) -> CollectionOptions {
        self.collections.get(name).cloned().unwrap_or_default()
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
