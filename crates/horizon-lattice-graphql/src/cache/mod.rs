//! Normalized in-memory response cache.
//!
//! Responses are decomposed into flat records keyed by object identity
//! (`"Film:1"`), linked together with `{"__ref": key}` values. Each
//! cached operation also gets a root record pointing into those records
//! together with the fields it selected, so a later read can rebuild the
//! response without a network call.

mod normalize;
mod store;

pub use normalize::{
    as_reference, default_cache_key, denormalize, normalize, reference, selected_reference,
    selection_of, CacheKeyFn, FIELDS_FIELD, REF_FIELD,
};
pub use store::CacheStore;

/// A normalized record: field name to value, with nested identifiable
/// objects replaced by references.
pub type Record = serde_json::Map<String, serde_json::Value>;
