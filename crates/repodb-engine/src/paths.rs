//! Mapping from (collection, key, group) to repository paths.
//!
//! Layout under the data folder:
//!
//! ```text
//! <data>/README.md                          data-folder marker
//! <data>/.dbconfig.json                     database metadata
//! <data>/backups/backup-<ts>.json           cache snapshots
//! <data>/<collection>-<key>.json            legacy flat record
//! <data>/<collection>/README.md             collection marker
//! <data>/<collection>/index.json            collection index
//! <data>/<collection>/<key>.json            ungrouped record
//! <data>/<collection>/<group>/README.md     group marker
//! <data>/<collection>/<group>/<key>.json    grouped record
//! <data>/<collection>/<group>/__<doc>.json  group side-document
//! ```
//!
//! Segment validation keeps every row of that table disjoint from every
//! other row, so the mapping is injective.

use crate::error::{EngineError, EngineResult};

pub const RECORD_EXT: &str = ".json";
pub const INDEX_FILE: &str = "index.json";
pub const MARKER_FILE: &str = "README.md";
pub const METADATA_FILE: &str = ".dbconfig.json";
pub const BACKUPS_DIR: &str = "backups";
pub const GROUP_DOC_PREFIX: &str = "__";

const RESERVED_KEY: &str = "index";

/// Check one user-supplied path segment.
fn validate_segment(kind: &str, value: &str) -> EngineResult<()> {
    let reject = |why: &str| Err(EngineError::Validation(format!("{kind} {value:?} {why}")));
    if value.is_empty() {
        return reject("is empty");
    }
    if value == "." || value == ".." {
        return reject("is a relative path component");
    }
    if value.contains('/') || value.contains('\\') {
        return reject("contains a path separator");
    }
    if value.chars().any(char::is_control) {
        return reject("contains control characters");
    }
    if value.starts_with('.') {
        return reject("starts with '.'");
    }
    if value.starts_with(GROUP_DOC_PREFIX) {
        return reject("starts with '__'");
    }
    Ok(())
}

pub fn validate_collection(name: &str) -> EngineResult<()> {
    validate_segment("collection", name)?;
    if name == BACKUPS_DIR {
        return Err(EngineError::Validation(format!(
            "collection name {name:?} is reserved"
        )));
    }
    if name.contains('-') {
        return Err(EngineError::Validation(format!(
            "collection {name:?} contains '-'"
        )));
    }
    reject_file_like("collection", name)
}

fn reject_file_like(kind: &str, name: &str) -> EngineResult<()> {
    if name.ends_with(RECORD_EXT) || name == MARKER_FILE {
        return Err(EngineError::Validation(format!(
            "{kind} {name:?} collides with a file name"
        )));
    }
    Ok(())
}

pub fn validate_key(key: &str) -> EngineResult<()> {
    validate_segment("key", key)?;
    if key == RESERVED_KEY {
        return Err(EngineError::Validation(format!("key {key:?} is reserved")));
    }
    Ok(())
}

/// Group ids name directories that sit beside record files, so they may
/// not look like a record, index or marker file name.
pub fn validate_group(group: &str) -> EngineResult<()> {
    validate_segment("group", group)?;
    reject_file_like("group", group)
}

pub fn validate_doc_type(doc_type: &str) -> EngineResult<()> {
    validate_segment("document type", doc_type)
}

/// Record key for a file name inside a collection or group directory.
///
/// Returns `None` for anything that is not a record: the index, markers,
/// side-documents and hidden files.
pub fn record_key(file_name: &str) -> Option<&str> {
    let key = file_name.strip_suffix(RECORD_EXT)?;
    if file_name == INDEX_FILE || validate_key(key).is_err() {
        return None;
    }
    Some(key)
}

/// Path layout for one data folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathScheme {
    root: String,
}

impl PathScheme {
    /// Layout rooted at `data_folder` (e.g. `data` or `stores/prod`).
    pub fn new(data_folder: &str) -> EngineResult<Self> {
        let root = data_folder.trim_matches('/');
        if root.is_empty() {
            return Err(EngineError::Validation("data folder is empty".into()));
        }
        for segment in root.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(EngineError::Validation(format!(
                    "data folder {data_folder:?} has an invalid segment"
                )));
            }
        }
        Ok(Self {
            root: root.to_string(),
        })
    }

    /// The data folder itself.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn data_marker_path(&self) -> String {
        marker_path(&self.root)
    }

    pub fn metadata_path(&self) -> String {
        format!("{}/{METADATA_FILE}", self.root)
    }

    pub fn backups_dir(&self) -> String {
        format!("{}/{BACKUPS_DIR}", self.root)
    }

    pub fn backup_path(&self, stamp: &str) -> String {
        format!("{}/backup-{stamp}.json", self.backups_dir())
    }

    pub fn collection_dir(&self, collection: &str) -> EngineResult<String> {
        validate_collection(collection)?;
        Ok(format!("{}/{collection}", self.root))
    }

    pub fn group_dir(&self, collection: &str, group: &str) -> EngineResult<String> {
        validate_group(group)?;
        Ok(format!("{}/{group}", self.collection_dir(collection)?))
    }

    pub fn index_path(&self, collection: &str) -> EngineResult<String> {
        Ok(format!("{}/{INDEX_FILE}", self.collection_dir(collection)?))
    }

    /// Path of a record, inside its group directory when `group` is set.
    pub fn record_path(&self, collection: &str, key: &str, group: Option<&str>) -> EngineResult<String> {
        validate_key(key)?;
        let dir = match group {
            Some(group) => self.group_dir(collection, group)?,
            None => self.collection_dir(collection)?,
        };
        Ok(format!("{dir}/{key}{RECORD_EXT}"))
    }

    /// Path of a per-group side-document such as `__summary.json`.
    pub fn group_doc_path(&self, collection: &str, group: &str, doc_type: &str) -> EngineResult<String> {
        validate_doc_type(doc_type)?;
        Ok(format!(
            "{}/{GROUP_DOC_PREFIX}{doc_type}{RECORD_EXT}",
            self.group_dir(collection, group)?
        ))
    }

    /// Path of a record in the pre-directory flat layout.
    pub fn legacy_path(&self, collection: &str, key: &str) -> EngineResult<String> {
        validate_collection(collection)?;
        validate_key(key)?;
        Ok(format!("{}/{collection}-{key}{RECORD_EXT}", self.root))
    }
}

/// Marker file placed in `dir` when the directory is first created.
pub fn marker_path(dir: &str) -> String {
    format!("{dir}/{MARKER_FILE}")
}

/// Markdown body of a directory marker.
pub fn marker_content(title: &str) -> String {
    format!(
        "# {title}\n\nThis directory is managed by repodb. Each record is stored as a JSON file.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scheme() -> PathScheme {
        PathScheme::new("data").unwrap()
    }

    #[test]
    fn record_paths() {
        let s = scheme();
        assert_eq!(s.record_path("users", "u1", None).unwrap(), "data/users/u1.json");
        assert_eq!(
            s.record_path("activeSessions", "s1", Some("u1")).unwrap(),
            "data/activeSessions/u1/s1.json"
        );
    }

    #[test]
    fn auxiliary_paths() {
        let s = scheme();
        assert_eq!(s.index_path("users").unwrap(), "data/users/index.json");
        assert_eq!(marker_path("data/users"), "data/users/README.md");
        assert_eq!(s.data_marker_path(), "data/README.md");
        assert_eq!(
            s.group_doc_path("clientsMessageHistory", "c1", "summary").unwrap(),
            "data/clientsMessageHistory/c1/__summary.json"
        );
        assert_eq!(s.legacy_path("users", "u-1").unwrap(), "data/users-u-1.json");
        assert_eq!(s.metadata_path(), "data/.dbconfig.json");
        assert_eq!(s.backup_path("2024"), "data/backups/backup-2024.json");
    }

    #[test]
    fn nested_data_folder_is_trimmed() {
        let s = PathScheme::new("/stores/prod/").unwrap();
        assert_eq!(s.root(), "stores/prod");
        assert_eq!(s.record_path("users", "a", None).unwrap(), "stores/prod/users/a.json");
    }

    #[test]
    fn rejects_bad_data_folder() {
        assert!(PathScheme::new("").is_err());
        assert!(PathScheme::new("/").is_err());
        assert!(PathScheme::new("data/../etc").is_err());
        assert!(PathScheme::new("a//b").is_err());
    }

    #[test]
    fn rejects_bad_segments() {
        let s = scheme();
        for key in ["", ".", "..", "a/b", "a\\b", "index", ".hidden", "__meta", "tab\there"] {
            assert!(
                matches!(s.record_path("users", key, None), Err(EngineError::Validation(_))),
                "key {key:?} should be rejected"
            );
        }
        for collection in ["backups", "user-list", "", "a/b", "README.md", "x.json"] {
            assert!(s.collection_dir(collection).is_err(), "{collection:?}");
        }
        for group in ["x.json", "README.md", "__x", ".."] {
            assert!(s.group_dir("users", group).is_err(), "{group:?}");
        }
    }

    #[test]
    fn record_key_filters_non_records() {
        assert_eq!(record_key("u1.json"), Some("u1"));
        assert_eq!(record_key("a.b.json"), Some("a.b"));
        assert_eq!(record_key("index.json"), None);
        assert_eq!(record_key("README.md"), None);
        assert_eq!(record_key("__summary.json"), None);
        assert_eq!(record_key(".dbconfig.json"), None);
        assert_eq!(record_key("notes.txt"), None);
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    fn segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_.]{1,6}".prop_filter("valid segment", |s| {
            validate_key(s).is_ok() && validate_group(s).is_ok()
        })
    }

    fn collection() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9]{0,5}".prop_filter("valid collection", |s| validate_collection(s).is_ok())
    }

    proptest! {
        #[test]
        fn grouped_and_ungrouped_paths_never_collide(
            c1 in collection(), k1 in segment(),
            c2 in collection(), k2 in segment(), g2 in segment()
        ) {
            let s = scheme();
            let ungrouped = s.record_path(&c1, &k1, None).unwrap();
            let grouped = s.record_path(&c2, &k2, Some(&g2)).unwrap();
            prop_assert_ne!(&ungrouped, &grouped);
            // A group directory never shadows a record file.
            prop_assert_ne!(&ungrouped, &s.group_dir(&c2, &g2).unwrap());
            prop_assert_ne!(&ungrouped, &s.index_path(&c1).unwrap());
        }

        #[test]
        fn record_paths_are_injective(
            c1 in collection(), k1 in segment(), g1 in proptest::option::of(segment()),
            c2 in collection(), k2 in segment(), g2 in proptest::option::of(segment())
        ) {
            let s = scheme();
            let p1 = s.record_path(&c1, &k1, g1.as_deref()).unwrap();
            let p2 = s.record_path(&c2, &k2, g2.as_deref()).unwrap();
            prop_assert_eq!(p1 == p2, (c1, k1, g1) == (c2, k2, g2));
        }

        #[test]
        fn side_documents_are_not_records(
            c in collection(), g in segment(), doc in segment()
        ) {
            let s = scheme();
            let path = s.group_doc_path(&c, &g, &doc).unwrap();
            let file = path.rsplit('/').next().unwrap();
            prop_assert!(record_key(file).is_none());
        }
    }
}
