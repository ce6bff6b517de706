use repodb_types::timestamp;
use serde::{Deserialize, Serialize};

use crate::loader::LoadedRecord;

/// Manifest of the live records in one collection, stored as `index.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionIndex {
    pub name: String,
    pub count: usize,
    pub last_updated: String,
    pub files: Vec<IndexEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Record key.
    pub id: String,
    /// Repository path of the record file.
    pub path: String,
}

impl CollectionIndex {
    /// Index of a collection with no records.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::from_entries(name, Vec::new())
    }

    /// Index over `records`; callers pass only live (non-tombstoned) records.
    pub fn from_records(name: impl Into<String>, records: &[LoadedRecord]) -> Self {
        let entries = records
            .iter()
            .map(|r| IndexEntry {
                id: r.key.clone(),
                path: r.path.clone(),
            })
            .collect();
        Self::from_entries(name, entries)
    }

    fn from_entries(name: impl Into<String>, mut files: Vec<IndexEntry>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            name: name.into(),
            count: files.len(),
            last_updated: timestamp(),
            files,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.files.iter().any(|f| f.id == id)
    }
}
