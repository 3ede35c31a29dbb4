//! Ordered interceptor chain for query and mutation execution.
//!
//! Every attempt builds a fresh [`Request`] and drives it through the
//! registered [`Step`]s in order. Each step either lets the request
//! [`Proceed`](Flow::Proceed), ends the run with a result
//! ([`Finish`](Flow::Finish)), asks for another attempt
//! ([`Retry`](Flow::Retry)), or fails with an [`Error`].
//!
//! The default order is built by [`InterceptorChain::standard`]:
//!
//! 1. [`RetryGuard`]
//! 2. [`CacheRead`]
//! 3. [`HeaderAugment`] (when a header source is configured)
//! 4. custom steps
//! 5. [`NetworkFetch`]
//! 6. [`StatusCheck`]
//! 7. [`Parse`]
//! 8. [`PersistedQuery`] (when enabled)
//! 9. [`CacheWrite`]

mod cache;
mod headers;
mod network;
mod persisted;
mod retry;

use std::sync::Arc;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::http::{HttpFetcher, RawResponse};
use crate::logging::targets;
use crate::operation::Operation;
use crate::response::{GraphQLResponse, GraphQLResult, ResultSource};

pub use cache::{CacheRead, CacheWrite};
pub use headers::{HeaderAugment, HeaderSource};
pub use network::{NetworkFetch, Parse, StatusCheck};
pub use persisted::PersistedQuery;
pub use retry::{RetryConfig, RetryGuard};

/// How the cache participates in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Serve complete cached results; fetch and store otherwise.
    #[default]
    CacheFirst,
    /// Always fetch, then store the result.
    NetworkOnly,
    /// Always fetch and never store.
    NoCache,
}

/// What the chain does after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Continue with the next step.
    Proceed,
    /// Stop and deliver this result.
    Finish(GraphQLResult),
    /// Start a new attempt from the first step.
    Retry,
}

/// How the document is sent when persisted queries are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistedQueryMode {
    /// Persisted queries are not in use; send the document.
    Off,
    /// Send only the document hash.
    HashOnly,
    /// Send the hash together with the document so the server stores it.
    WithDocument,
}

/// Mutable envelope passed through the chain for one attempt.
#[derive(Debug)]
pub struct Request {
    operation: Arc<Operation>,
    attempt: u32,
    /// Headers sent with the HTTP request.
    pub headers: HeaderMap,
    /// Effective cache policy for this operation.
    pub cache_policy: CachePolicy,
    /// Persisted-query state carried across attempts.
    pub persisted_query: PersistedQueryMode,
    /// Raw response, set by [`NetworkFetch`].
    pub response: Option<RawResponse>,
    /// Decoded response, set by [`Parse`].
    pub parsed: Option<GraphQLResponse>,
}

impl Request {
    /// Create a request for the given attempt (1-based).
    pub fn new(operation: Arc<Operation>, attempt: u32) -> Self {
        Self {
            operation,
            attempt,
            headers: HeaderMap::new(),
            cache_policy: CachePolicy::default(),
            persisted_query: PersistedQueryMode::Off,
            response: None,
            parsed: None,
        }
    }

    /// The operation being executed.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// The attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// JSON body for the network call, honoring the persisted-query state.
    pub fn body(&self) -> serde_json::Value {
        match self.persisted_query {
            PersistedQueryMode::Off => self.operation.request_body(true, None),
            PersistedQueryMode::HashOnly => {
                let hash = self.operation.document_hash();
                self.operation.request_body(false, Some(&hash))
            }
            PersistedQueryMode::WithDocument => {
                let hash = self.operation.document_hash();
                self.operation.request_body(true, Some(&hash))
            }
        }
    }
}

/// A synchronous caller-supplied step.
pub type CustomStep = Arc<dyn Fn(&mut Request) -> Result<Flow> + Send + Sync>;

/// A single interceptor in the chain.
#[derive(Clone)]
pub enum Step {
    /// Bounds attempts and re-drives the chain after transient failures.
    RetryGuard(RetryGuard),
    /// Serves complete cached query results.
    CacheRead(CacheRead),
    /// Adds headers from a [`HeaderSource`].
    HeaderAugment(HeaderAugment),
    /// Performs the HTTP call.
    NetworkFetch(NetworkFetch),
    /// Rejects non-2xx responses.
    StatusCheck(StatusCheck),
    /// Decodes the response body.
    Parse(Parse),
    /// Automatic persisted queries.
    PersistedQuery(PersistedQuery),
    /// Stores the result and finishes the chain.
    CacheWrite(CacheWrite),
    /// Caller-supplied step.
    Custom {
        /// Name used in logs.
        name: String,
        /// The step body.
        step: CustomStep,
    },
}

impl Step {
    /// Create a custom step.
    pub fn custom<F>(name: impl Into<String>, step: F) -> Self
    where
        F: Fn(&mut Request) -> Result<Flow> + Send + Sync + 'static,
    {
        Self::Custom {
            name: name.into(),
            step: Arc::new(step),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::RetryGuard(_) => "retry_guard",
            Self::CacheRead(_) => "cache_read",
            Self::HeaderAugment(_) => "header_augment",
            Self::NetworkFetch(_) => "network_fetch",
            Self::StatusCheck(_) => "status_check",
            Self::Parse(_) => "parse",
            Self::PersistedQuery(_) => "persisted_query",
            Self::CacheWrite(_) => "cache_write",
            Self::Custom { name, .. } => name,
        }
    }

    async fn process(&self, request: &mut Request) -> Result<Flow> {
        match self {
            Self::RetryGuard(step) => step.process(request),
            Self::CacheRead(step) => step.process(request),
            Self::HeaderAugment(step) => step.process(request),
            Self::NetworkFetch(step) => step.process(request).await,
            Self::StatusCheck(step) => step.process(request),
            Self::Parse(step) => step.process(request),
            Self::PersistedQuery(step) => step.process(request),
            Self::CacheWrite(step) => step.process(request),
            Self::Custom { step, .. } => step(request),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Step").field(&self.name()).finish()
    }
}

/// Inputs for [`InterceptorChain::standard`].
#[derive(Clone)]
pub struct ChainConfig {
    /// GraphQL HTTP endpoint.
    pub url: Url,
    /// Network seam.
    pub fetcher: Arc<dyn HttpFetcher>,
    /// Shared normalized cache.
    pub store: Arc<CacheStore>,
    /// Retry settings; `None` disables the retry guard.
    pub retry: Option<RetryConfig>,
    /// Source of per-request headers.
    pub header_source: Option<Arc<dyn HeaderSource>>,
    /// Enable automatic persisted queries.
    pub persisted_queries: bool,
    /// Steps inserted just before the network fetch.
    pub custom_steps: Vec<Step>,
    /// Client-wide cache policy.
    pub cache_policy: CachePolicy,
    /// Headers present on every request before augmentation.
    pub default_headers: HeaderMap,
}

/// An ordered list of steps and the driver that runs them.
#[derive(Clone, Debug)]
pub struct InterceptorChain {
    steps: Vec<Step>,
    cache_policy: CachePolicy,
    default_headers: HeaderMap,
}

impl InterceptorChain {
    /// Create a chain from explicitly ordered steps.
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            cache_policy: CachePolicy::default(),
            default_headers: HeaderMap::new(),
        }
    }

    /// Build the default step order.
    pub fn standard(config: ChainConfig) -> Self {
        let mut steps = Vec::with_capacity(9 + config.custom_steps.len());
        if let Some(retry) = config.retry {
            steps.push(Step::RetryGuard(RetryGuard::new(retry)));
        }
        steps.push(Step::CacheRead(CacheRead::new(config.store.clone())));
        if let Some(source) = config.header_source {
            steps.push(Step::HeaderAugment(HeaderAugment::new(source)));
        }
        steps.extend(config.custom_steps);
        steps.push(Step::NetworkFetch(NetworkFetch::new(config.fetcher, config.url)));
        steps.push(Step::StatusCheck(StatusCheck));
        steps.push(Step::Parse(Parse));
        if config.persisted_queries {
            steps.push(Step::PersistedQuery(PersistedQuery));
        }
        steps.push(Step::CacheWrite(CacheWrite::new(config.store)));

        Self::new(steps)
            .with_cache_policy(config.cache_policy)
            .with_default_headers(config.default_headers)
    }

    /// Set the policy used when an operation has no override.
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Set headers present on every request.
    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    /// The registered steps, in order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    fn retry_guard(&self) -> Option<&RetryGuard> {
        self.steps.iter().find_map(|step| match step {
            Step::RetryGuard(guard) => Some(guard),
            _ => None,
        })
    }

    fn uses_persisted_queries(&self) -> bool {
        self.steps
            .iter()
            .any(|step| matches!(step, Step::PersistedQuery(_)))
    }

    /// Drive `operation` through the chain until it yields exactly one
    /// outcome.
    pub async fn run(&self, operation: Arc<Operation>) -> Result<GraphQLResult> {
        let guard = self.retry_guard();
        let cache_policy = operation
            .cache_policy_override()
            .unwrap_or(self.cache_policy);
        let mut persisted_query = if self.uses_persisted_queries() {
            PersistedQueryMode::HashOnly
        } else {
            PersistedQueryMode::Off
        };
        // Step-requested retries are honored once even without a guard.
        let max_attempts = guard.map_or(2, |g| g.max_attempts());
        // `attempt` counts every pass; `counted` excludes the one
        // persisted-query document resend, which has its own allowance.
        let mut attempt = 1;
        let mut counted = 1;
        let mut document_resent = false;

        loop {
            let mut request = Request::new(operation.clone(), attempt);
            request.headers = self.default_headers.clone();
            request.cache_policy = cache_policy;
            request.persisted_query = persisted_query;

            match self.run_attempt(&mut request).await {
                Ok(Flow::Finish(result)) => {
                    tracing::debug!(
                        target: targets::CHAIN,
                        operation = operation.name().unwrap_or("<anonymous>"),
                        attempt,
                        cached = result.source == ResultSource::Cache,
                        "Chain finished"
                    );
                    return Ok(result);
                }
                Ok(Flow::Proceed) => {
                    return Err(Error::Parse(
                        "Interceptor chain completed without producing a result".into(),
                    ));
                }
                Ok(Flow::Retry) => {
                    let resend_document = !document_resent
                        && persisted_query == PersistedQueryMode::HashOnly
                        && request.persisted_query == PersistedQueryMode::WithDocument;
                    if resend_document {
                        tracing::debug!(
                            target: targets::CHAIN,
                            attempt,
                            "Resending with the full document"
                        );
                        document_resent = true;
                    } else if counted >= max_attempts {
                        tracing::debug!(
                            target: targets::CHAIN,
                            attempt,
                            "Retry requested but attempts are exhausted"
                        );
                        return match request.parsed {
                            Some(parsed) => {
                                Ok(GraphQLResult::from_response(parsed, ResultSource::Server))
                            }
                            None => Err(Error::Parse(
                                "Retry requested after the last attempt".into(),
                            )),
                        };
                    } else {
                        counted += 1;
                    }
                    persisted_query = request.persisted_query;
                    attempt += 1;
                }
                Err(err) => {
                    let Some(guard) = guard else {
                        return Err(err);
                    };
                    if !guard.should_retry(&err, counted) {
                        return Err(err);
                    }
                    let delay = guard.delay_for_retry(counted);
                    tracing::debug!(
                        target: targets::CHAIN,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    persisted_query = request.persisted_query;
                    counted += 1;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_attempt(&self, request: &mut Request) -> Result<Flow> {
        for step in &self.steps {
            match step.process(request).await? {
                Flow::Proceed => continue,
                flow => {
                    tracing::trace!(
                        target: targets::CHAIN,
                        step = step.name(),
                        "Step ended the attempt"
                    );
                    return Ok(flow);
                }
            }
        }
        Ok(Flow::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finish_with(value: serde_json::Value) -> Flow {
        Flow::Finish(GraphQLResult::from_response(
            GraphQLResponse {
                data: Some(value),
                ..Default::default()
            },
            ResultSource::Server,
        ))
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());
        let chain = InterceptorChain::new(vec![
            Step::custom("a", move |_| {
                a.lock().push("a");
                Ok(Flow::Proceed)
            }),
            Step::custom("b", move |_| {
                b.lock().push("b");
                Ok(finish_with(json!({"ok": true})))
            }),
            Step::custom("unreached", |_| panic!("runs after finish")),
        ]);

        let result = chain.run(Arc::new(Operation::query("{ ok }"))).await.unwrap();
        assert_eq!(result.data, Some(json!({"ok": true})));
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_exhausted_chain_is_parse_failure() {
        let chain = InterceptorChain::new(vec![Step::custom("noop", |_| Ok(Flow::Proceed))]);
        let err = chain
            .run(Arc::new(Operation::query("{ ok }")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn test_transport_failures_retry_until_bound() {
        let calls = Arc::new(parking_lot::Mutex::new(0u32));
        let counter = calls.clone();
        let chain = InterceptorChain::new(vec![
            Step::RetryGuard(RetryGuard::new(RetryConfig {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            })),
            Step::custom("flaky", move |_| {
                *counter.lock() += 1;
                Err(Error::transport("connection reset"))
            }),
        ]);

        let err = chain
            .run(Arc::new(Operation::query("{ ok }")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_non_transient_failures_are_not_retried() {
        let calls = Arc::new(parking_lot::Mutex::new(0u32));
        let counter = calls.clone();
        let chain = InterceptorChain::new(vec![
            Step::RetryGuard(RetryGuard::new(RetryConfig::default())),
            Step::custom("failing", move |_| {
                *counter.lock() += 1;
                Err(Error::Protocol {
                    status: 500,
                    body: "oops".into(),
                })
            }),
        ]);

        let err = chain
            .run(Arc::new(Operation::query("{ ok }")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { status: 500, .. }));
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_retry_flow_sees_next_attempt() {
        let chain = InterceptorChain::new(vec![Step::custom("second", |request| {
            if request.attempt() == 1 {
                Ok(Flow::Retry)
            } else {
                Ok(finish_with(json!({"attempt": request.attempt()})))
            }
        })]);

        let result = chain.run(Arc::new(Operation::query("{ ok }"))).await.unwrap();
        assert_eq!(result.data, Some(json!({"attempt": 2})));
    }

    #[tokio::test]
    async fn test_operation_cache_policy_overrides_chain_default() {
        let chain = InterceptorChain::new(vec![Step::custom("policy", |request| {
            Ok(finish_with(json!({
                "network_only": request.cache_policy == CachePolicy::NetworkOnly
            })))
        })])
        .with_cache_policy(CachePolicy::CacheFirst);

        let op = Operation::query("{ ok }").cache_policy(CachePolicy::NetworkOnly);
        let result = chain.run(Arc::new(op)).await.unwrap();
        assert_eq!(result.data, Some(json!({"network_only": true})));
    }

    fn not_found(request: &mut Request) {
        request.parsed = Some(GraphQLResponse {
            errors: vec![crate::response::GraphQLError::new("PersistedQueryNotFound")],
            ..Default::default()
        });
    }

    #[tokio::test]
    async fn test_document_resend_without_retry_budget() {
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = calls.clone();
        let chain = InterceptorChain::new(vec![
            Step::RetryGuard(RetryGuard::new(RetryConfig::no_retries())),
            Step::custom("server", move |request| {
                log.lock().push(request.persisted_query);
                match request.persisted_query {
                    PersistedQueryMode::HashOnly => {
                        not_found(request);
                        Ok(Flow::Proceed)
                    }
                    _ => Ok(finish_with(json!({"ok": true}))),
                }
            }),
            Step::PersistedQuery(PersistedQuery),
        ]);

        let result = chain.run(Arc::new(Operation::query("{ ok }"))).await.unwrap();
        assert_eq!(result.data, Some(json!({"ok": true})));
        assert_eq!(
            *calls.lock(),
            vec![PersistedQueryMode::HashOnly, PersistedQueryMode::WithDocument]
        );
    }

    #[tokio::test]
    async fn test_document_resend_keeps_transport_retry() {
        let calls = Arc::new(parking_lot::Mutex::new(0u32));
        let counter = calls.clone();
        let chain = InterceptorChain::new(vec![
            Step::RetryGuard(RetryGuard::new(RetryConfig {
                max_retries: 1,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            })),
            Step::custom("server", move |request| {
                let mut calls = counter.lock();
                *calls += 1;
                match (request.persisted_query, *calls) {
                    (PersistedQueryMode::HashOnly, _) => {
                        not_found(request);
                        Ok(Flow::Proceed)
                    }
                    (_, 2) => Err(Error::transport("connection reset")),
                    _ => Ok(finish_with(json!({"ok": true}))),
                }
            }),
            Step::PersistedQuery(PersistedQuery),
        ]);

        let result = chain.run(Arc::new(Operation::query("{ ok }"))).await.unwrap();
        assert_eq!(result.data, Some(json!({"ok": true})));
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_document_is_resent_only_once() {
        let calls = Arc::new(parking_lot::Mutex::new(0u32));
        let counter = calls.clone();
        let chain = InterceptorChain::new(vec![
            Step::RetryGuard(RetryGuard::new(RetryConfig::no_retries())),
            Step::custom("server", move |request| {
                *counter.lock() += 1;
                not_found(request);
                Ok(Flow::Proceed)
            }),
            Step::PersistedQuery(PersistedQuery),
            Step::custom("deliver", |request| {
                let parsed = request.parsed.take().unwrap_or_default();
                Ok(Flow::Finish(GraphQLResult::from_response(
                    parsed,
                    ResultSource::Server,
                )))
            }),
        ]);

        let result = chain.run(Arc::new(Operation::query("{ ok }"))).await.unwrap();
        assert_eq!(result.errors[0].message, "PersistedQueryNotFound");
        assert_eq!(*calls.lock(), 2);
    }

    struct StaticFetcher {
        calls: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl HttpFetcher for StaticFetcher {
        async fn fetch(
            &self,
            _url: &Url,
            _headers: &HeaderMap,
            _body: bytes::Bytes,
        ) -> Result<RawResponse> {
            self.calls.lock().push("network_fetch");
            Ok(RawResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: bytes::Bytes::from_static(
                    br#"{"data":{"films":[{"__typename":"Film","id":"1"}]}}"#,
                ),
            })
        }
    }

    #[tokio::test]
    async fn test_standard_order() {
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (headers_log, custom_log) = (calls.clone(), calls.clone());
        let source: Arc<dyn HeaderSource> = Arc::new(move || {
            headers_log.lock().push("header_augment");
            std::collections::HashMap::new()
        });
        let chain = InterceptorChain::standard(ChainConfig {
            url: Url::parse("https://api.example.com/graphql").unwrap(),
            fetcher: Arc::new(StaticFetcher {
                calls: calls.clone(),
            }),
            store: Arc::new(CacheStore::new()),
            retry: Some(RetryConfig::default()),
            header_source: Some(source),
            persisted_queries: true,
            custom_steps: vec![Step::custom("audit", move |_| {
                custom_log.lock().push("audit");
                Ok(Flow::Proceed)
            })],
            cache_policy: CachePolicy::CacheFirst,
            default_headers: HeaderMap::new(),
        });

        let names: Vec<_> = chain.steps().iter().map(Step::name).collect();
        assert_eq!(
            names,
            vec![
                "retry_guard",
                "cache_read",
                "header_augment",
                "audit",
                "network_fetch",
                "status_check",
                "parse",
                "persisted_query",
                "cache_write",
            ]
        );

        let op = Arc::new(Operation::query("query FilmList { films { __typename id } }"));
        let first = chain.run(op.clone()).await.unwrap();
        assert_eq!(first.source, ResultSource::Server);
        assert_eq!(*calls.lock(), vec!["header_augment", "audit", "network_fetch"]);

        // A hit finishes at the cache read, before any later step.
        calls.lock().clear();
        let second = chain.run(op).await.unwrap();
        assert_eq!(second.source, ResultSource::Cache);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_standard_order_without_optional_steps() {
        let chain = InterceptorChain::standard(ChainConfig {
            url: Url::parse("https://api.example.com/graphql").unwrap(),
            fetcher: Arc::new(StaticFetcher {
                calls: Arc::default(),
            }),
            store: Arc::new(CacheStore::new()),
            retry: None,
            header_source: None,
            persisted_queries: false,
            custom_steps: Vec::new(),
            cache_policy: CachePolicy::default(),
            default_headers: HeaderMap::new(),
        });

        let names: Vec<_> = chain.steps().iter().map(Step::name).collect();
        assert_eq!(
            names,
            vec!["cache_read", "network_fetch", "status_check", "parse", "cache_write"]
        );
    }
}
