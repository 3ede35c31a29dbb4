//! In-memory normalized cache store.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::normalize::{self, CacheKeyFn};
use super::Record;
use crate::logging::targets;
use crate::operation::Operation;

/// Prefix of the per-operation root record key.
const ROOT_PREFIX: &str = "ROOT:";

/// A thread-safe mapping from object identity to normalized field data.
///
/// Operations on one key are serialized; operations on different keys
/// may run concurrently. Each write replaces or merges a record under
/// the entry lock, so a reader never observes a half-applied write.
///
/// Entries never expire; capacity is unbounded.
///
/// # Example
///
/// ```ignore
/// let store = CacheStore::new();
/// store.write("Film:1", record);
/// assert!(store.read("Film:1").is_some());
/// store.evict("Film:1");
/// ```
pub struct CacheStore {
    records: DashMap<String, Record>,
    key_fn: CacheKeyFn,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Create an empty store using [`normalize::default_cache_key`].
    pub fn new() -> Self {
        Self::with_cache_key_fn(Arc::new(normalize::default_cache_key))
    }

    /// Create an empty store with a custom object-identity function.
    pub fn with_cache_key_fn(key_fn: CacheKeyFn) -> Self {
        Self {
            records: DashMap::new(),
            key_fn,
        }
    }

    /// The object-identity function used for normalization.
    pub fn cache_key_fn(&self) -> &CacheKeyFn {
        &self.key_fn
    }

    /// Compute the identity of an object, if it has one.
    pub fn cache_key_for(&self, object: &Record) -> Option<String> {
        (self.key_fn)(object)
    }

    /// Read the record stored under `key`.
    pub fn read(&self, key: &str) -> Option<Record> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    /// Store `record` under `key`, replacing any previous record.
    pub fn write(&self, key: impl Into<String>, record: Record) {
        self.records.insert(key.into(), record);
    }

    /// Merge the fields of `record` into the record under `key`.
    ///
    /// Fields present in `record` overwrite existing ones; other existing
    /// fields are kept. Creates the record if absent.
    pub fn merge(&self, key: impl Into<String>, record: Record) {
        self.records.entry(key.into()).or_default().extend(record);
    }

    /// Remove the record under `key`.
    pub fn evict(&self, key: &str) {
        self.records.remove(key);
    }

    /// Check whether a record exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Remove every record.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Number of stored records, including operation root records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All stored keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Key of the root record for an operation's result.
    pub fn root_key(operation: &Operation) -> String {
        format!("{ROOT_PREFIX}{}", operation.cache_key())
    }

    /// Normalize `data` and store it as the result of `operation`.
    ///
    /// Identifiable objects are merged into their records; the
    /// operation's root record is replaced. Returns the keys of the
    /// identifiable records that were written. Non-object data is not
    /// cached.
    pub fn write_result(&self, operation: &Operation, data: &Value) -> Vec<String> {
        let (root, records) = normalize::normalize(data, &self.key_fn);
        let Value::Object(root) = root else {
            return Vec::new();
        };

        let mut written = Vec::with_capacity(records.len());
        for (key, record) in records {
            self.merge(key.clone(), record);
            if !written.contains(&key) {
                written.push(key);
            }
        }
        self.write(Self::root_key(operation), root);

        tracing::debug!(
            target: targets::CACHE,
            operation = operation.name().unwrap_or("<anonymous>"),
            records = written.len(),
            "Stored operation result"
        );
        written
    }

    /// Rebuild the cached result of `operation`.
    ///
    /// Records are projected onto the fields the operation selected, so
    /// fields merged in by other operations are not returned. Returns
    /// `None` if the operation was never stored, or if a record or field
    /// it selected has since been evicted.
    pub fn read_result(&self, operation: &Operation) -> Option<Value> {
        let root = self.read(&Self::root_key(operation))?;
        normalize::denormalize(&Value::Object(root), &|key| self.read(key))
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_read_before_write_is_absent() {
        let store = CacheStore::new();
        assert!(store.read("Film:1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_write_read_evict() {
        let store = CacheStore::new();
        let v1 = record(json!({"title": "A New Hope"}));
        let v2 = record(json!({"title": "Empire"}));

        store.write("Film:1", v1.clone());
        assert_eq!(store.read("Film:1"), Some(v1.clone()));
        assert_eq!(store.read("Film:1"), Some(v1));

        store.write("Film:1", v2.clone());
        assert_eq!(store.read("Film:1"), Some(v2));

        store.evict("Film:1");
        assert!(store.read("Film:1").is_none());
        assert!(!store.contains("Film:1"));
    }

    #[test]
    fn test_merge_keeps_existing_fields() {
        let store = CacheStore::new();
        store.write("Film:1", record(json!({"id": "1", "title": "A New Hope"})));
        store.merge("Film:1", record(json!({"id": "1", "episode": 4})));

        assert_eq!(
            store.read("Film:1"),
            Some(record(json!({"id": "1", "title": "A New Hope", "episode": 4})))
        );
    }

    #[test]
    fn test_write_and_read_result() {
        let store = CacheStore::new();
        let op = Operation::query("query FilmList { films { __typename id title } }");
        let data = json!({"films": [
            {"__typename": "Film", "id": "1", "title": "A New Hope"},
            {"__typename": "Film", "id": "2", "title": "Empire"}
        ]});

        let written = store.write_result(&op, &data);
        assert_eq!(written, vec!["Film:1".to_string(), "Film:2".to_string()]);
        assert!(store.contains("Film:1"));
        assert!(store.contains("Film:2"));
        assert_eq!(store.read_result(&op), Some(data));

        store.evict("Film:2");
        assert_eq!(store.read_result(&op), None);
    }

    #[test]
    fn test_result_reflects_later_writes_to_shared_records() {
        let store = CacheStore::new();
        let list = Operation::query("query L { films { __typename id title } }");
        let detail = Operation::query("query D { film { __typename id title } }");

        store.write_result(
            &list,
            &json!({"films": [{"__typename": "Film", "id": "1", "title": "Old"}]}),
        );
        store.write_result(
            &detail,
            &json!({"film": {"__typename": "Film", "id": "1", "title": "New"}}),
        );

        let list_data = store.read_result(&list).unwrap();
        assert_eq!(list_data["films"][0]["title"], "New");
    }

    #[test]
    fn test_back_references_are_served_from_cache() {
        let store = CacheStore::new();
        let op = Operation::query("{ film { __typename id director { __typename id films { __typename id } } } }");
        let data = json!({"film": {
            "__typename": "Film", "id": "1",
            "director": {"__typename": "Person", "id": "9",
                         "films": [{"__typename": "Film", "id": "1"}]}
        }});

        store.write_result(&op, &data);
        assert_eq!(store.read_result(&op), Some(data));
    }

    #[test]
    fn test_fields_from_other_operations_do_not_leak() {
        let store = CacheStore::new();
        let list = Operation::query("query L { films { __typename id } }");
        let detail = Operation::query("query D { film { __typename id secret } }");

        store.write_result(&list, &json!({"films": [{"__typename": "Film", "id": "1"}]}));
        store.write_result(
            &detail,
            &json!({"film": {"__typename": "Film", "id": "1", "secret": "x"}}),
        );

        assert_eq!(
            store.read_result(&list),
            Some(json!({"films": [{"__typename": "Film", "id": "1"}]}))
        );
        assert_eq!(store.read_result(&detail).unwrap()["film"]["secret"], "x");
    }

    #[test]
    fn test_custom_cache_key_fn() {
        let store = CacheStore::with_cache_key_fn(Arc::new(|object: &Record| {
            object.get("uuid")?.as_str().map(|id| format!("uuid:{id}"))
        }));
        let op = Operation::query("{ thing { uuid } }");
        store.write_result(&op, &json!({"thing": {"uuid": "abc"}}));
        assert!(store.contains("uuid:abc"));
    }

    #[test]
    fn test_concurrent_writers_on_distinct_keys() {
        let store = Arc::new(CacheStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.write(format!("Item:{t}-{i}"), record(json!({"n": i})));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }
}
