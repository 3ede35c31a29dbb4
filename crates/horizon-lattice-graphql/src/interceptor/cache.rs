use std::sync::Arc;

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::logging::targets;
use crate::operation::OperationKind;
use crate::response::{GraphQLResult, ResultSource};

use super::{CachePolicy, Flow, Request};

/// Serves a query from the cache when a complete result is stored.
#[derive(Debug, Clone)]
pub struct CacheRead {
    store: Arc<CacheStore>,
}

impl CacheRead {
    /// Create the step over a shared store.
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    pub(super) fn process(&self, request: &mut Request) -> Result<Flow> {
        if !request.operation().is_query() || request.cache_policy != CachePolicy::CacheFirst {
            return Ok(Flow::Proceed);
        }

        match self.store.read_result(request.operation()) {
            Some(data) => {
                tracing::debug!(
                    target: targets::CACHE,
                    operation = request.operation().name().unwrap_or("<anonymous>"),
                    "Cache hit"
                );
                Ok(Flow::Finish(GraphQLResult::from_cache(data)))
            }
            None => Ok(Flow::Proceed),
        }
    }
}

/// Normalizes the parsed response into the cache and finishes the chain.
///
/// Responses carrying errors are delivered but not stored, so a later
/// cache read never serves data the server flagged as incomplete.
#[derive(Debug, Clone)]
pub struct CacheWrite {
    store: Arc<CacheStore>,
}

impl CacheWrite {
    /// Create the step over a shared store.
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    pub(super) fn process(&self, request: &mut Request) -> Result<Flow> {
        let parsed = request
            .parsed
            .take()
            .ok_or_else(|| Error::Parse("No parsed response to store".into()))?;

        let cacheable = request.cache_policy != CachePolicy::NoCache
            && request.operation().kind() != OperationKind::Subscription
            && parsed.errors.is_empty();
        if cacheable && let Some(ref data) = parsed.data {
            self.store.write_result(request.operation(), data);
        }

        Ok(Flow::Finish(GraphQLResult::from_response(
            parsed,
            ResultSource::Server,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::response::{GraphQLError, GraphQLResponse};
    use serde_json::json;

    fn films() -> serde_json::Value {
        json!({"films": [{"__typename": "Film", "id": "1", "title": "A New Hope"}]})
    }

    fn request(op: Operation, policy: CachePolicy) -> Request {
        let mut request = Request::new(Arc::new(op), 1);
        request.cache_policy = policy;
        request
    }

    #[test]
    fn test_write_then_read() {
        let store = Arc::new(CacheStore::new());
        let op = Operation::query("query F { films { __typename id title } }");

        let mut req = request(op.clone(), CachePolicy::CacheFirst);
        req.parsed = Some(GraphQLResponse {
            data: Some(films()),
            ..Default::default()
        });
        let flow = CacheWrite::new(store.clone()).process(&mut req).unwrap();
        assert!(matches!(flow, Flow::Finish(ref r) if r.source == ResultSource::Server));
        assert!(store.contains("Film:1"));

        let mut req = request(op, CachePolicy::CacheFirst);
        match CacheRead::new(store).process(&mut req).unwrap() {
            Flow::Finish(result) => {
                assert_eq!(result.source, ResultSource::Cache);
                assert_eq!(result.data, Some(films()));
            }
            other => panic!("expected cache hit, got {other:?}"),
        }
    }

    #[test]
    fn test_read_skips_mutations_and_network_policies() {
        let store = Arc::new(CacheStore::new());
        let query = Operation::query("query F { films { __typename id title } }");
        store.write_result(&query, &films());

        let mut req = request(query.clone(), CachePolicy::NetworkOnly);
        assert_eq!(CacheRead::new(store.clone()).process(&mut req).unwrap(), Flow::Proceed);

        let mutation = Operation::mutation("query F { films { __typename id title } }");
        store.write_result(&mutation, &films());
        let mut req = request(mutation, CachePolicy::CacheFirst);
        assert_eq!(CacheRead::new(store).process(&mut req).unwrap(), Flow::Proceed);
    }

    #[test]
    fn test_no_cache_and_errors_skip_write() {
        let store = Arc::new(CacheStore::new());
        let op = Operation::query("query F { films { __typename id title } }");

        let mut req = request(op.clone(), CachePolicy::NoCache);
        req.parsed = Some(GraphQLResponse {
            data: Some(films()),
            ..Default::default()
        });
        CacheWrite::new(store.clone()).process(&mut req).unwrap();
        assert!(store.is_empty());

        let mut req = request(op, CachePolicy::CacheFirst);
        req.parsed = Some(GraphQLResponse {
            data: Some(films()),
            errors: vec![GraphQLError::new("partial")],
            extensions: None,
        });
        let flow = CacheWrite::new(store.clone()).process(&mut req).unwrap();
        assert!(matches!(flow, Flow::Finish(ref r) if r.has_errors()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_write_without_parsed_response_fails() {
        let store = Arc::new(CacheStore::new());
        let mut req = request(Operation::query("{ a }"), CachePolicy::CacheFirst);
        assert!(matches!(
            CacheWrite::new(store).process(&mut req),
            Err(Error::Parse(_))
        ));
    }
}
