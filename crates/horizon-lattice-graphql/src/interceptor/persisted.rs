use crate::error::Result;
use crate::logging::targets;

use super::{Flow, PersistedQueryMode, Request};

/// Automatic persisted queries.
///
/// While registered, the chain starts every run by sending only the
/// document hash. When the server does not know the hash, this step asks
/// for one retry that carries the full document.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistedQuery;

impl PersistedQuery {
    pub(super) fn process(&self, request: &mut Request) -> Result<Flow> {
        if request.persisted_query != PersistedQueryMode::HashOnly {
            return Ok(Flow::Proceed);
        }
        let not_found = request
            .parsed
            .as_ref()
            .is_some_and(|parsed| parsed.is_persisted_query_not_found());
        if !not_found {
            return Ok(Flow::Proceed);
        }

        tracing::debug!(
            target: targets::CHAIN,
            operation = request.operation().name().unwrap_or("<anonymous>"),
            "Persisted query not found, resending with document"
        );
        request.persisted_query = PersistedQueryMode::WithDocument;
        Ok(Flow::Retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::response::{GraphQLError, GraphQLResponse};
    use std::sync::Arc;

    fn not_found() -> GraphQLResponse {
        GraphQLResponse {
            errors: vec![GraphQLError::new("PersistedQueryNotFound")],
            ..Default::default()
        }
    }

    #[test]
    fn test_not_found_requests_retry_with_document() {
        let mut request = Request::new(Arc::new(Operation::query("{ a }")), 1);
        request.persisted_query = PersistedQueryMode::HashOnly;
        request.parsed = Some(not_found());

        assert_eq!(PersistedQuery.process(&mut request).unwrap(), Flow::Retry);
        assert_eq!(request.persisted_query, PersistedQueryMode::WithDocument);
        assert!(request.body().get("query").is_some());
    }

    #[test]
    fn test_only_retries_once() {
        let mut request = Request::new(Arc::new(Operation::query("{ a }")), 2);
        request.persisted_query = PersistedQueryMode::WithDocument;
        request.parsed = Some(not_found());

        assert_eq!(PersistedQuery.process(&mut request).unwrap(), Flow::Proceed);
    }

    #[test]
    fn test_hash_only_body() {
        let mut request = Request::new(Arc::new(Operation::query("{ a }")), 1);
        request.persisted_query = PersistedQueryMode::HashOnly;
        let body = request.body();
        assert!(body.get("query").is_none());
        assert_eq!(
            body["extensions"]["persistedQuery"]["sha256Hash"],
            request.operation().document_hash()
        );
    }
}
