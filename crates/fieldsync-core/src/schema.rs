//! # Schema Model
//!
//! Versioned description of the stores a LocalStore holds.
//!
//! ## Upgrade Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Schema Upgrades                                   │
//! │                                                                         │
//! │  persisted v1                      requested v2                         │
//! │  ┌──────────────────┐              ┌──────────────────┐                 │
//! │  │ patients (id)    │  ─────────►  │ patients (id)    │  ✅ kept        │
//! │  │   by_facility    │              │   by_facility    │  ✅ kept        │
//! │  │                  │              │   by_village     │  ✅ new index   │
//! │  └──────────────────┘              │ encounters (id)  │  ✅ new store   │
//! │                                    └──────────────────┘                 │
//! │                                                                         │
//! │  ❌ dropping a store or index     ❌ changing a key path                │
//! │  ❌ lower version than persisted  ❌ additions without a version bump   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Key paths are dotted paths into a JSON value (`"id"`, `"meta.uuid"`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::{CACHE_STORE, SYNC_QUEUE_STATUS_INDEX, SYNC_QUEUE_STORE};

// =============================================================================
// Schema Types
// =============================================================================

/// A secondary index on a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
    pub name: String,
    #[serde(alias = "key_path")]
    pub key_path: String,
}

/// One object store: a primary key path plus named indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    pub name: String,
    #[serde(alias = "key_path")]
    pub key_path: String,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        StoreSchema {
            name: name.into(),
            key_path: key_path.into(),
            indexes: Vec::new(),
        }
    }

    /// Adds an index (builder style).
    pub fn index(mut self, name: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.indexes.push(IndexSchema {
            name: name.into(),
            key_path: key_path.into(),
        });
        self
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// The full, versioned schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    #[serde(default)]
    pub stores: Vec<StoreSchema>,
}

/// What an upgrade adds on top of the persisted schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Stores that do not exist yet.
    pub new_stores: Vec<String>,
    /// `(store, index)` pairs on existing stores that need back-filling.
    pub new_indexes: Vec<(String, String)>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.new_stores.is_empty() && self.new_indexes.is_empty()
    }
}

impl Schema {
    pub fn new(version: u32) -> Self {
        Schema {
            version,
            stores: Vec::new(),
        }
    }

    /// Adds a store (builder style).
    pub fn store(mut self, store: StoreSchema) -> Self {
        self.stores.push(store);
        self
    }

    pub fn find_store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.iter().find(|s| s.name == name)
    }

    /// Adds the system stores (`sync_queue`, `cache`) when absent.
    pub fn with_system_stores(mut self) -> Self {
        if self.find_store(SYNC_QUEUE_STORE).is_none() {
            self.stores.push(
                StoreSchema::new(SYNC_QUEUE_STORE, "id").index(SYNC_QUEUE_STATUS_INDEX, "status"),
            );
        }
        if self.find_store(CACHE_STORE).is_none() {
            self.stores.push(StoreSchema::new(CACHE_STORE, "key"));
        }
        self
    }

    /// Checks names are unique and key paths are well-formed.
    pub fn validate(&self) -> CoreResult<()> {
        let mut seen_stores = std::collections::HashSet::new();

        for store in &self.stores {
            if !seen_stores.insert(store.name.as_str()) {
                return Err(CoreError::DuplicateStore(store.name.clone()));
            }
            check_key_path(&store.name, &store.key_path)?;

            let mut seen_indexes = std::collections::HashSet::new();
            for index in &store.indexes {
                if !seen_indexes.insert(index.name.as_str()) {
                    return Err(CoreError::DuplicateIndex {
                        store: store.name.clone(),
                        index: index.name.clone(),
                    });
                }
                check_key_path(&store.name, &index.key_path)?;
            }
        }

        Ok(())
    }

    /// Compares this (requested) schema against the persisted one.
    ///
    /// Returns what must be created or back-filled.
    pub fn check_upgrade(&self, persisted: &Schema) -> CoreResult<SchemaDiff> {
        if self.version < persisted.version {
            return Err(CoreError::VersionRegression {
                requested: self.version,
                persisted: persisted.version,
            });
        }

        let mut diff = SchemaDiff::default();

        for old in &persisted.stores {
            let new = self.find_store(&old.name).ok_or_else(|| {
                CoreError::NonAdditiveChange(format!("store '{}' was removed", old.name))
            })?;

            if new.key_path != old.key_path {
                return Err(CoreError::NonAdditiveChange(format!(
                    "key path of store '{}' changed from '{}' to '{}'",
                    old.name, old.key_path, new.key_path
                )));
            }

            for old_index in &old.indexes {
                match new.find_index(&old_index.name) {
                    None => {
                        return Err(CoreError::NonAdditiveChange(format!(
                            "index '{}' was removed from store '{}'",
                            old_index.name, old.name
                        )))
                    }
                    Some(i) if i.key_path != old_index.key_path => {
                        return Err(CoreError::NonAdditiveChange(format!(
                            "key path of index '{}' on store '{}' changed",
                            old_index.name, old.name
                        )))
                    }
                    Some(_) => {}
                }
            }

            for index in &new.indexes {
                if old.find_index(&index.name).is_none() {
                    diff.new_indexes.push((new.name.clone(), index.name.clone()));
                }
            }
        }

        for store in &self.stores {
            if persisted.find_store(&store.name).is_none() {
                diff.new_stores.push(store.name.clone());
            }
        }

        if !diff.is_empty() && self.version == persisted.version {
            return Err(CoreError::NonAdditiveChange(format!(
                "schema changed without a version bump (still v{})",
                self.version
            )));
        }

        Ok(diff)
    }
}

fn check_key_path(store: &str, path: &str) -> CoreResult<()> {
    if path.is_empty() || path.split('.').any(|seg| seg.trim().is_empty()) {
        return Err(CoreError::InvalidKeyPath {
            store: store.to_string(),
            path: path.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Key Paths
// =============================================================================

/// Walks a dotted path into a JSON value.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

/// Reads the primary key at `path`.
///
/// Strings are used as-is, numbers are rendered in decimal. Anything else
/// (missing, null, object, array, bool) is not a usable key.
pub fn extract_key(value: &Value, path: &str) -> CoreResult<String> {
    match extract_path(value, path) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(CoreError::MissingKey {
            path: path.to_string(),
        }),
    }
}

/// Encodes a scalar for index lookups, tagged with its JSON type so the
/// string `"42"` and the number `42` stay distinct. Non-scalars are not
/// indexed.
pub fn index_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(format!("s:{s}")),
        Value::Number(n) => Some(format!("n:{n}")),
        Value::Bool(b) => Some(format!("b:{b}")),
        _ => None,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v1() -> Schema {
        Schema::new(1).store(StoreSchema::new("patients", "id").index("by_facility", "facilityId"))
    }

    #[test]
    fn test_extract_key_dotted_path() {
        let value = json!({ "meta": { "uuid": "abc" }, "n": 7 });
        assert_eq!(extract_key(&value, "meta.uuid").unwrap(), "abc");
        assert_eq!(extract_key(&value, "n").unwrap(), "7");
        assert!(matches!(
            extract_key(&value, "meta.missing"),
            Err(CoreError::MissingKey { .. })
        ));
        assert!(extract_key(&value, "meta").is_err());
    }

    #[test]
    fn test_index_value_scalars_only() {
        assert_eq!(index_value(&json!("pending")).as_deref(), Some("s:pending"));
        assert_eq!(index_value(&json!(3)).as_deref(), Some("n:3"));
        assert_eq!(index_value(&json!(true)).as_deref(), Some("b:true"));
        assert_ne!(index_value(&json!("42")), index_value(&json!(42)));
        assert_ne!(index_value(&json!("true")), index_value(&json!(true)));
        assert_eq!(index_value(&json!(null)), None);
        assert_eq!(index_value(&json!({ "a": 1 })), None);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_paths() {
        let dup = v1().store(StoreSchema::new("patients", "id"));
        assert_eq!(
            dup.validate(),
            Err(CoreError::DuplicateStore("patients".into()))
        );

        let bad = Schema::new(1).store(StoreSchema::new("x", "meta..id"));
        assert!(matches!(bad.validate(), Err(CoreError::InvalidKeyPath { .. })));

        let dup_index = Schema::new(1).store(
            StoreSchema::new("x", "id")
                .index("a", "f")
                .index("a", "g"),
        );
        assert!(matches!(
            dup_index.validate(),
            Err(CoreError::DuplicateIndex { .. })
        ));
    }

    #[test]
    fn test_system_stores_added_once() {
        let schema = v1().with_system_stores().with_system_stores();
        assert_eq!(schema.stores.len(), 3);

        let queue = schema.find_store(SYNC_QUEUE_STORE).unwrap();
        assert!(queue.find_index(SYNC_QUEUE_STATUS_INDEX).is_some());
        assert_eq!(schema.find_store(CACHE_STORE).unwrap().key_path, "key");
    }

    #[test]
    fn test_additive_upgrade_reports_diff() {
        let v2 = Schema::new(2)
            .store(
                StoreSchema::new("patients", "id")
                    .index("by_facility", "facilityId")
                    .index("by_village", "village"),
            )
            .store(StoreSchema::new("encounters", "id"));

        let diff = v2.check_upgrade(&v1()).unwrap();
        assert_eq!(diff.new_stores, vec!["encounters".to_string()]);
        assert_eq!(
            diff.new_indexes,
            vec![("patients".to_string(), "by_village".to_string())]
        );
    }

    #[test]
    fn test_upgrade_rejects_regression_and_removals() {
        let v2 = Schema {
            version: 2,
            ..v1()
        };
        assert!(matches!(
            v1().check_upgrade(&v2),
            Err(CoreError::VersionRegression {
                requested: 1,
                persisted: 2
            })
        ));

        let dropped = Schema::new(2).store(StoreSchema::new("patients", "id"));
        assert!(matches!(
            dropped.check_upgrade(&v1()),
            Err(CoreError::NonAdditiveChange(_))
        ));

        let rekeyed = Schema::new(2)
            .store(StoreSchema::new("patients", "uuid").index("by_facility", "facilityId"));
        assert!(matches!(
            rekeyed.check_upgrade(&v1()),
            Err(CoreError::NonAdditiveChange(_))
        ));
    }

    #[test]
    fn test_same_version_same_schema_is_noop() {
        assert!(v1().check_upgrade(&v1()).unwrap().is_empty());

        let sneaky = v1().store(StoreSchema::new("encounters", "id"));
        assert!(sneaky.check_upgrade(&v1()).is_err());
    }
}
