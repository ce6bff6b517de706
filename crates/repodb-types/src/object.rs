use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Identifier of an object (blob, tree or commit) in the remote object graph.
///
/// Git hosts hand out 40-character SHA-1 ids; the in-memory backend derives
/// 64-character BLAKE3 ids. Both are kept as lowercase hex so ids from either
/// source compare and serialize the same way.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// Parse from a hex string, normalizing to lowercase.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.len() != 40 && s.len() != 64 {
            return Err(TypeError::InvalidLength { actual: s.len() });
        }
        if let Some(bad) = s.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(TypeError::InvalidHex(format!("unexpected character {bad:?} in {s}")));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Content-address `data` under a kind tag (`blob`, `tree`, `commit`).
    ///
    /// The header mirrors git's `<kind> <len>\0` framing so the same bytes
    /// stored as different kinds never share an id.
    pub fn hash_object(kind: &str, data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(data);
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    /// Full hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}
