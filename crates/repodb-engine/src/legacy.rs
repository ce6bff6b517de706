//! The flat layout used before collections had their own directories.
//!
//! Legacy records live directly in the data folder as
//! `<collection>-<key>.json`. Collection names never contain `-`, so the
//! first `-` separates the two parts and the key may contain more of them.

use crate::paths::{validate_collection, validate_key, RECORD_EXT};

/// A record file in the legacy flat layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyFile {
    pub collection: String,
    pub key: String,
    /// Full repository path of the file.
    pub path: String,
}

/// Split a legacy file name into `(collection, key)`.
pub fn parse_legacy_name(file_name: &str) -> Option<(&str, &str)> {
    let stem = file_name.strip_suffix(RECORD_EXT)?;
    let (collection, key) = stem.split_once('-')?;
    validate_collection(collection).ok()?;
    validate_key(key).ok()?;
    Some((collection, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_at_first_dash() {
        assert_eq!(parse_legacy_name("users-u1.json"), Some(("users", "u1")));
        assert_eq!(
            parse_legacy_name("activeSessions-3f2a-41c9.json"),
            Some(("activeSessions", "3f2a-41c9"))
        );
    }

    #[test]
    fn ignores_non_legacy_files() {
        assert_eq!(parse_legacy_name("README.md"), None);
        assert_eq!(parse_legacy_name("users.json"), None);
        assert_eq!(parse_legacy_name(".dbconfig.json"), None);
        assert_eq!(parse_legacy_name("-u1.json"), None);
        assert_eq!(parse_legacy_name("users-.json"), None);
        assert_eq!(parse_legacy_name("backups-x.json"), None);
        assert_eq!(parse_legacy_name("users-index.json"), None);
    }
}
