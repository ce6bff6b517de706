//! Record-level helpers: soft-delete bookkeeping and grouping fields.
//!
//! Records are plain JSON objects. A deleted record keeps its payload and
//! gains two bookkeeping fields instead of being removed from the object
//! graph.

use serde_json::Value;

use crate::error::TypeError;
use crate::temporal::timestamp;

/// Field flagging a record as soft-deleted.
pub const DELETED_FIELD: &str = "__deleted";

/// Field holding the ISO-8601 deletion time.
pub const DELETED_AT_FIELD: &str = "__deletedAt";

/// Soft-delete marker applied in place of physical removal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tombstone {
    pub deleted_at: String,
}

impl Tombstone {
    /// A tombstone stamped with the current time.
    pub fn now() -> Self {
        Self {
            deleted_at: timestamp(),
        }
    }

    /// Mark `doc` as deleted. Fails if `doc` is not a JSON object.
    pub fn apply(&self, doc: &mut Value) -> Result<(), TypeError> {
        let map = doc.as_object_mut().ok_or(TypeError::NotAnObject)?;
        map.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        map.insert(
            DELETED_AT_FIELD.to_string(),
            Value::String(self.deleted_at.clone()),
        );
        Ok(())
    }
}

/// Returns `true` if the document carries `__deleted: true`.
pub fn is_tombstoned(doc: &Value) -> bool {
    matches!(doc.get(DELETED_FIELD), Some(Value::Bool(true)))
}

/// Remove tombstone bookkeeping fields, leaving the payload untouched.
pub fn strip_tombstone(mut doc: Value) -> Value {
    if let Some(map) = doc.as_object_mut() {
        map.remove(DELETED_FIELD);
        map.remove(DELETED_AT_FIELD);
    }
    doc
}

/// Extract a group id from `field` of `doc`.
///
/// Strings are used as-is and numbers are rendered in decimal; anything else
/// (missing, null, empty string, objects) means the record is not grouped.
pub fn group_value(doc: &Value, field: &str) -> Option<String> {
    match doc.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_adds_both_fields() {
        let mut doc = json!({"name": "Ann"});
        let stone = Tombstone {
            deleted_at: "2024-01-01T00:00:00.000Z".into(),
        };
        stone.apply(&mut doc).unwrap();
        assert_eq!(doc["__deleted"], json!(true));
        assert_eq!(doc["__deletedAt"], json!("2024-01-01T00:00:00.000Z"));
        assert_eq!(doc["name"], json!("Ann"));
        assert!(is_tombstoned(&doc));
    }

    #[test]
    fn apply_rejects_non_object() {
        let mut doc = json!([1, 2, 3]);
        assert_eq!(Tombstone::now().apply(&mut doc), Err(TypeError::NotAnObject));
    }

    #[test]
    fn deleted_false_is_not_tombstoned() {
        assert!(!is_tombstoned(&json!({"__deleted": false})));
        assert!(!is_tombstoned(&json!({"__deleted": "true"})));
        assert!(!is_tombstoned(&json!({})));
    }

    #[test]
    fn strip_removes_bookkeeping_only() {
        let doc = json!({"v": 1, "__deleted": false, "__deletedAt": "x"});
        assert_eq!(strip_tombstone(doc), json!({"v": 1}));
    }

    #[test]
    fn group_value_accepts_strings_and_numbers() {
        let doc = json!({"userId": "u-7", "shard": 42, "empty": "", "obj": {}});
        assert_eq!(group_value(&doc, "userId").as_deref(), Some("u-7"));
        assert_eq!(group_value(&doc, "shard").as_deref(), Some("42"));
        assert_eq!(group_value(&doc, "empty"), None);
        assert_eq!(group_value(&doc, "obj"), None);
        assert_eq!(group_value(&doc, "missing"), None);
    }
}
