//! Normalization of response trees into identity-keyed records.
//!
//! Objects for which the cache-key function returns an identity are
//! lifted out of the tree into their own record and replaced by a
//! `{"__ref": "<key>"}` link. Objects without an identity stay inline.
//!
//! Records are shared between operations, so a record may hold fields
//! that a given operation never asked for. The operation's own tree keeps
//! the fields it selected next to each top-level link
//! (`{"__ref": "Film:1", "__fields": {"id": true, ...}}`), and reads
//! project records onto that selection.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::Record;

/// Field name of a reference link inside normalized data.
pub const REF_FIELD: &str = "__ref";

/// Field name of the selection recorded next to a root-tree reference.
pub const FIELDS_FIELD: &str = "__fields";

/// Function deriving an object's identity from its fields.
pub type CacheKeyFn = Arc<dyn Fn(&Record) -> Option<String> + Send + Sync>;

/// Default object identity: `"<__typename>:<id>"`, falling back to `_id`.
///
/// Objects without a `__typename` or without an id are not identifiable.
pub fn default_cache_key(object: &Record) -> Option<String> {
    let typename = object.get("__typename")?.as_str()?;
    let id = object.get("id").or_else(|| object.get("_id"))?;
    match id {
        Value::String(id) => Some(format!("{typename}:{id}")),
        Value::Number(id) => Some(format!("{typename}:{id}")),
        _ => None,
    }
}

/// Build a reference link value.
pub fn reference(key: &str) -> Value {
    let mut link = Map::new();
    link.insert(REF_FIELD.to_string(), Value::String(key.to_string()));
    Value::Object(link)
}

/// Build a reference link that carries the fields selected at its site.
pub fn selected_reference(key: &str, selection: Value) -> Value {
    let mut link = Map::new();
    link.insert(REF_FIELD.to_string(), Value::String(key.to_string()));
    link.insert(FIELDS_FIELD.to_string(), selection);
    Value::Object(link)
}

/// If `value` is a reference link, return the referenced key.
pub fn as_reference(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map)
            if map
                .keys()
                .all(|name| name == REF_FIELD || name == FIELDS_FIELD) =>
        {
            map.get(REF_FIELD)?.as_str()
        }
        _ => None,
    }
}

/// The selection shape of a response value.
///
/// Objects map each field name to the selection of its value; scalars
/// and nulls select as `true`. The elements of a list share one merged
/// selection, since a GraphQL selection set applies to every element.
pub fn selection_of(value: &Value) -> Value {
    match value {
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(name, field)| (name.clone(), selection_of(field)))
                .collect(),
        ),
        Value::Array(items) => items
            .iter()
            .map(selection_of)
            .fold(Value::Bool(true), merge_selection),
        _ => Value::Bool(true),
    }
}

fn merge_selection(left: Value, right: Value) -> Value {
    match (left, right) {
        (Value::Object(mut left), Value::Object(right)) => {
            for (name, sub) in right {
                let merged = match left.remove(&name) {
                    Some(existing) => merge_selection(existing, sub),
                    None => sub,
                };
                left.insert(name, merged);
            }
            Value::Object(left)
        }
        (Value::Object(left), _) | (_, Value::Object(left)) => Value::Object(left),
        (leaf, _) => leaf,
    }
}

/// Flatten `data` into identity-keyed records.
///
/// Returns the rewritten tree (with selection-carrying references in
/// place of identifiable objects) and the extracted records in discovery
/// order. Links inside records are plain references. The same key may
/// appear more than once when an object occurs at several places.
pub fn normalize(data: &Value, key_fn: &CacheKeyFn) -> (Value, Vec<(String, Record)>) {
    let mut records = Vec::new();
    let root = normalize_value(data, key_fn, &mut records, true);
    (root, records)
}

fn normalize_value(
    value: &Value,
    key_fn: &CacheKeyFn,
    records: &mut Vec<(String, Record)>,
    in_root: bool,
) -> Value {
    match value {
        Value::Object(object) => {
            let key = key_fn(object);
            let nested_in_root = in_root && key.is_none();
            let fields: Record = object
                .iter()
                .map(|(name, field)| {
                    let field = normalize_value(field, key_fn, records, nested_in_root);
                    (name.clone(), field)
                })
                .collect();
            match key {
                Some(key) => {
                    let link = if in_root {
                        selected_reference(&key, selection_of(value))
                    } else {
                        reference(&key)
                    };
                    records.push((key, fields));
                    link
                }
                None => Value::Object(fields),
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| normalize_value(item, key_fn, records, in_root))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Rebuild a root tree by resolving its references through `lookup`.
///
/// Each reference is projected onto the selection stored beside it, so
/// the result holds exactly the fields the operation asked for. Returns
/// `None` when a referenced record or a selected field is missing, or
/// when a reference carries no selection.
pub fn denormalize<F>(value: &Value, lookup: &F) -> Option<Value>
where
    F: Fn(&str) -> Option<Record>,
{
    if as_reference(value).is_some() {
        let selection = value.get(FIELDS_FIELD)?;
        return project(value, selection, lookup);
    }

    match value {
        Value::Object(object) => {
            let mut fields = Map::with_capacity(object.len());
            for (name, field) in object {
                fields.insert(name.clone(), denormalize(field, lookup)?);
            }
            Some(Value::Object(fields))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| denormalize(item, lookup))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        other => Some(other.clone()),
    }
}

/// Project `value` onto `selection`, following references through
/// `lookup`. Recursion is bounded by the depth of the selection.
fn project<F>(value: &Value, selection: &Value, lookup: &F) -> Option<Value>
where
    F: Fn(&str) -> Option<Record>,
{
    let Value::Object(selected) = selection else {
        // Leaf: the stored value must not need resolving.
        return (!holds_reference(value)).then(|| value.clone());
    };

    if let Some(key) = as_reference(value) {
        let record = lookup(key)?;
        return project_fields(&record, selected, lookup);
    }
    match value {
        Value::Null => Some(Value::Null),
        Value::Object(object) => project_fields(object, selected, lookup),
        Value::Array(items) => items
            .iter()
            .map(|item| project(item, selection, lookup))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        _ => None,
    }
}

fn project_fields<F>(object: &Record, selected: &Map<String, Value>, lookup: &F) -> Option<Value>
where
    F: Fn(&str) -> Option<Record>,
{
    let mut fields = Map::with_capacity(selected.len());
    for (name, sub) in selected {
        fields.insert(name.clone(), project(object.get(name)?, sub, lookup)?);
    }
    Some(Value::Object(fields))
}

fn holds_reference(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().any(holds_reference),
        Value::Object(object) => {
            as_reference(value).is_some() || object.values().any(holds_reference)
        }
        _ => false,
    }
}
