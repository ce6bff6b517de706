use serde::{Deserialize, Serialize};
use repodb_types::ObjectId;

use crate::error::{RemoteError, RemoteResult};

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// File mode for a tree entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryMode {
    /// Normal file (0o100644).
    Regular,
    /// Subtree / directory (0o040000).
    Directory,
}

impl EntryMode {
    /// Mode string as the git data API expects it.
    pub fn as_git_str(&self) -> &'static str {
        match self {
            Self::Regular => "100644",
            Self::Directory => "040000",
        }
    }

    /// Parse a git mode string.
    pub fn from_git_str(s: &str) -> Option<Self> {
        match s {
            "100644" => Some(Self::Regular),
            "040000" | "40000" => Some(Self::Directory),
            _ => None,
        }
    }

    /// Object type the git data API pairs with this mode.
    pub fn git_type(&self) -> &'static str {
        match self {
            Self::Directory => "tree",
            Self::Regular => "blob",
        }
    }
}

impl std::fmt::Display for EntryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_git_str())
    }
}

/// A single entry in a tree object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub mode: EntryMode,
    /// Entry name (one path segment).
    pub name: String,
    pub object_id: ObjectId,
}

impl TreeEntry {
    /// Create a new tree entry.
    pub fn new(mode: EntryMode, name: impl Into<String>, object_id: ObjectId) -> Self {
        Self {
            mode,
            name: name.into(),
            object_id,
        }
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

/// Directory listing object (analogous to git tree).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Entries sorted by name.
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Create a new tree; entries are sorted for deterministic hashing.
    pub fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort();
        Self { entries }
    }

    /// Create an empty tree.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Insert or replace an entry, keeping the entries sorted.
    pub fn upsert(&mut self, entry: TreeEntry) {
        match self.entries.binary_search_by(|e| e.name.cmp(&entry.name)) {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => self.entries.insert(pos, entry),
        }
    }

    /// Serialized form used for content addressing.
    pub fn to_bytes(&self) -> RemoteResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RemoteError::Malformed(e.to_string()))
    }

    /// Content-addressed id of this tree.
    pub fn compute_id(&self) -> RemoteResult<ObjectId> {
        Ok(ObjectId::hash_object("tree", &self.to_bytes()?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One path layered onto a base tree by `create_tree`.
///
/// `path` is repository-relative and slash-separated; intermediate
/// directories are created as needed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeUpdate {
    pub path: String,
    pub mode: EntryMode,
    pub blob: ObjectId,
}

impl TreeUpdate {
    /// A regular file at `path` pointing at `blob`.
    pub fn file(path: impl Into<String>, blob: ObjectId) -> Self {
        Self {
            path: path.into(),
            mode: EntryMode::Regular,
            blob,
        }
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// A commit as the remote reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: ObjectId,
    /// Root tree of the commit.
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Directory listing
// ---------------------------------------------------------------------------

/// Kind of a directory listing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// An entry returned by `list_dir`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Final path segment.
    pub name: String,
    /// Full repository-relative path.
    pub path: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}
