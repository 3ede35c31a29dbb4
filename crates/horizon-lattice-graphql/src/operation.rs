//! GraphQL operation types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::interceptor::CachePolicy;
use crate::logging::targets;

/// The kind of a GraphQL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// A read-only query.
    #[default]
    Query,
    /// A mutation.
    Mutation,
    /// A subscription (streamed over the subscription transport).
    Subscription,
}

impl OperationKind {
    /// Lowercase keyword as it appears in a GraphQL document.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named GraphQL request with variables.
///
/// Operations are immutable once submitted; transports share them by `Arc`.
///
/// # Example
///
/// ```ignore
/// let operation = Operation::query(r#"
///     query FilmList($first: Int) {
///         allFilms(first: $first) { films { __typename id title } }
///     }
/// "#)
/// .operation_name("FilmList")
/// .variable("first", 10);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    document: String,
    operation_name: Option<String>,
    variables: Option<Value>,
    extensions: Option<Value>,
    kind: OperationKind,
    cache_policy: Option<CachePolicy>,
}

impl Operation {
    fn with_kind(document: String, kind: OperationKind) -> Self {
        Self {
            document,
            operation_name: None,
            variables: None,
            extensions: None,
            kind,
            cache_policy: None,
        }
    }

    /// Create a query operation.
    pub fn query(document: impl Into<String>) -> Self {
        Self::with_kind(document.into(), OperationKind::Query)
    }

    /// Create a mutation operation.
    pub fn mutation(document: impl Into<String>) -> Self {
        Self::with_kind(document.into(), OperationKind::Mutation)
    }

    /// Create a subscription operation.
    pub fn subscription(document: impl Into<String>) -> Self {
        Self::with_kind(document.into(), OperationKind::Subscription)
    }

    /// Create an operation, inferring its kind from the document.
    ///
    /// Anonymous shorthand documents (`{ ... }`) are queries.
    pub fn new(document: impl Into<String>) -> Self {
        let document = document.into();
        let kind = infer_kind(&document);
        Self::with_kind(document, kind)
    }

    /// Set a single variable.
    pub fn variable(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        let name = name.into();
        let Some(value) = to_json(value, &name) else {
            return self;
        };
        let variables = self
            .variables
            .get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = variables {
            map.insert(name, value);
        }
        self
    }

    /// Replace all variables with a serializable value.
    pub fn variables(mut self, variables: impl Serialize) -> Self {
        self.variables = to_json(variables, "variables");
        self
    }

    /// Replace all variables from a map.
    pub fn variables_map(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = Some(Value::Object(variables.into_iter().collect()));
        self
    }

    /// Set the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Set request extensions.
    pub fn extensions(mut self, extensions: impl Serialize) -> Self {
        self.extensions = to_json(extensions, "extensions");
        self
    }

    /// Override the client's cache policy for this operation.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    /// The document text.
    pub fn document(&self) -> &str {
        &self.document
    }

    /// The operation name, if set.
    pub fn name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    /// The variables, if any.
    pub fn variables_value(&self) -> Option<&Value> {
        self.variables.as_ref()
    }

    /// The request extensions, if any.
    pub fn extensions_value(&self) -> Option<&Value> {
        self.extensions.as_ref()
    }

    /// The operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The per-operation cache policy override.
    pub fn cache_policy_override(&self) -> Option<CachePolicy> {
        self.cache_policy
    }

    /// Whether this operation only reads data.
    pub fn is_query(&self) -> bool {
        self.kind == OperationKind::Query
    }

    /// Whether this operation is a subscription.
    pub fn is_subscription(&self) -> bool {
        self.kind == OperationKind::Subscription
    }

    /// Lowercase hex SHA-256 of the document, as used by persisted queries.
    pub fn document_hash(&self) -> String {
        hex::encode(Sha256::digest(self.document.as_bytes()))
    }

    /// Deterministic key identifying this operation's result in the cache.
    ///
    /// Variables are serialized with sorted keys, so two operations that
    /// differ only in variable insertion order share a key.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.operation_name.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);
        hasher.update(self.document.as_bytes());
        hasher.update([0]);
        if let Some(ref variables) = self.variables {
            hasher.update(canonical_json(variables).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Build the JSON request body.
    ///
    /// When `include_document` is false only the persisted-query hash is
    /// sent in `extensions.persistedQuery`.
    pub(crate) fn request_body(&self, include_document: bool, persisted_hash: Option<&str>) -> Value {
        let mut body = serde_json::Map::new();
        if include_document {
            body.insert("query".into(), Value::String(self.document.clone()));
        }
        if let Some(ref name) = self.operation_name {
            body.insert("operationName".into(), Value::String(name.clone()));
        }
        if let Some(ref variables) = self.variables {
            body.insert("variables".into(), variables.clone());
        }

        let mut extensions = match &self.extensions {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(hash) = persisted_hash {
            extensions.insert(
                "persistedQuery".into(),
                serde_json::json!({ "version": 1, "sha256Hash": hash }),
            );
        }
        if !extensions.is_empty() {
            body.insert("extensions".into(), Value::Object(extensions));
        }

        Value::Object(body)
    }
}

/// Serialize a value with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sort(v))).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Serialize a builder input, logging values that cannot be represented.
fn to_json(value: impl Serialize, what: &str) -> Option<Value> {
    serde_json::to_value(value)
        .inspect_err(|e| {
            tracing::warn!(
                target: targets::CLIENT,
                field = what,
                error = %e,
                "Dropping value that failed to serialize"
            );
        })
        .ok()
}

fn infer_kind(document: &str) -> OperationKind {
    // Skip leading comments and fragments until the first operation keyword.
    for line in document.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("subscription") {
            return OperationKind::Subscription;
        }
        if line.starts_with("mutation") {
            return OperationKind::Mutation;
        }
        if line.starts_with("query") || line.starts_with('{') {
            return OperationKind::Query;
        }
    }
    OperationKind::Query
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unserializable_values_are_dropped() {
        let bad: std::collections::BTreeMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();

        let op = Operation::query("query A($id: ID) { a(id: $id) }")
            .variable("id", "1")
            .variable("bad", &bad);
        assert_eq!(op.variables_value(), Some(&json!({"id": "1"})));

        let op = Operation::query("{ a }").variables(&bad).extensions(&bad);
        assert_eq!(op.variables_value(), None);
        assert_eq!(op.extensions_value(), None);
    }

    #[test]
    fn test_infer_kind() {
        assert_eq!(Operation::new("query A { a }").kind(), OperationKind::Query);
        assert_eq!(Operation::new("{ a }").kind(), OperationKind::Query);
        assert_eq!(
            Operation::new("  mutation M { m }").kind(),
            OperationKind::Mutation
        );
        assert_eq!(
            Operation::new("# comment\nsubscription S { s }").kind(),
            OperationKind::Subscription
        );
        assert_eq!(
            Operation::new("fragment F on T { x }\nsubscription S { ...F }").kind(),
            OperationKind::Subscription
        );
    }

    #[test]
    fn test_variables() {
        let op = Operation::query("query Q($id: ID!) { node(id: $id) { id } }")
            .variable("id", "1")
            .variable("limit", 10);
        assert_eq!(op.variables_value(), Some(&json!({"id": "1", "limit": 10})));
    }

    #[test]
    fn test_cache_key_ignores_variable_order() {
        let a = Operation::query("query Q { q }")
            .variable("a", 1)
            .variable("b", json!({"y": 2, "x": 1}));
        let b = Operation::query("query Q { q }")
            .variable("b", json!({"x": 1, "y": 2}))
            .variable("a", 1);
        assert_eq!(a.cache_key(), b.cache_key());

        let c = Operation::query("query Q { q }").variable("a", 2);
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_cache_key_distinguishes_kind() {
        let q = Operation::query("{ a }");
        let m = Operation::mutation("{ a }");
        assert_ne!(q.cache_key(), m.cache_key());
    }

    #[test]
    fn test_document_hash() {
        let op = Operation::query("{ a }");
        let hash = op.document_hash();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, Operation::mutation("{ a }").document_hash());
    }

    #[test]
    fn test_request_body_hash_only() {
        let op = Operation::query("query FilmList { films { id } }").operation_name("FilmList");
        let hash = op.document_hash();

        let body = op.request_body(false, Some(&hash));
        assert!(body.get("query").is_none());
        assert_eq!(body["operationName"], "FilmList");
        assert_eq!(body["extensions"]["persistedQuery"]["version"], 1);
        assert_eq!(body["extensions"]["persistedQuery"]["sha256Hash"], hash.as_str());

        let body = op.request_body(true, None);
        assert_eq!(body["query"], "query FilmList { films { id } }");
        assert!(body.get("extensions").is_none());
    }
}
