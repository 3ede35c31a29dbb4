//! Transport router: queries and mutations over HTTP, subscriptions over
//! the shared WebSocket connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use url::Url;

use crate::cache::{CacheKeyFn, CacheStore};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::http::{HttpClientConfig, HttpFetcher, HttpTransport, RequestHandle, ReqwestFetcher};
use crate::interceptor::{
    CachePolicy, ChainConfig, HeaderSource, InterceptorChain, RetryConfig, Step,
};
use crate::logging::targets;
use crate::operation::Operation;
use crate::response::GraphQLResult;
use crate::subscription::{
    ConnectionState, SubscriptionConfig, SubscriptionHandle, SubscriptionStream,
    SubscriptionTransport,
};
use crate::tls::{CertificateValidator, TlsConfig};

/// Builder for creating a GraphQL client.
pub struct GraphQLClientBuilder {
    http_url: String,
    subscription_url: Option<String>,
    http_config: HttpClientConfig,
    fetcher: Option<Arc<dyn HttpFetcher>>,
    default_headers: Vec<(String, String)>,
    header_source: Option<Arc<dyn HeaderSource>>,
    retry: Option<RetryConfig>,
    cache_policy: CachePolicy,
    persisted_queries: bool,
    store: Option<Arc<CacheStore>>,
    cache_key_fn: Option<CacheKeyFn>,
    custom_steps: Vec<Step>,
    subscription: SubscriptionConfig,
}

impl GraphQLClientBuilder {
    /// Create a new builder with the specified GraphQL endpoint URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http_url: url.into(),
            subscription_url: None,
            http_config: HttpClientConfig::default(),
            fetcher: None,
            default_headers: Vec::new(),
            header_source: None,
            retry: Some(RetryConfig::default()),
            cache_policy: CachePolicy::default(),
            persisted_queries: false,
            store: None,
            cache_key_fn: None,
            custom_steps: Vec::new(),
            subscription: SubscriptionConfig::default(),
        }
    }

    /// Build a client builder from file configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.builder()
    }

    /// Set a separate WebSocket URL for subscriptions.
    ///
    /// If not set, the HTTP URL will be converted to WebSocket protocol
    /// (http:// -> ws://, https:// -> wss://).
    pub fn subscription_url(mut self, url: impl Into<String>) -> Self {
        self.subscription_url = Some(url.into());
        self
    }

    /// Add a header sent with every HTTP request. Headers set here are
    /// never overwritten by the header source.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Add multiple headers.
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.default_headers.extend(headers);
        self
    }

    /// Set the collaborator supplying per-request headers and the
    /// subscription `connection_init` payload.
    pub fn header_source(mut self, source: impl HeaderSource + 'static) -> Self {
        self.header_source = Some(Arc::new(source));
        self
    }

    /// Set the retry configuration for transient HTTP failures.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Disable the retry guard.
    pub fn no_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    /// Set the default cache policy.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Enable automatic persisted queries.
    pub fn persisted_queries(mut self, enabled: bool) -> Self {
        self.persisted_queries = enabled;
        self
    }

    /// Share an existing cache store.
    pub fn store(mut self, store: Arc<CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom object-identity function for a new store.
    pub fn cache_key_fn(mut self, key_fn: CacheKeyFn) -> Self {
        self.cache_key_fn = Some(key_fn);
        self
    }

    /// Register a custom step, run just before the network fetch.
    pub fn interceptor(mut self, step: Step) -> Self {
        self.custom_steps.push(step);
        self
    }

    /// Replace the network seam of the HTTP transport.
    pub fn fetcher(mut self, fetcher: Arc<dyn HttpFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Set the HTTP client configuration.
    pub fn http_config(mut self, config: HttpClientConfig) -> Self {
        self.http_config = config;
        self
    }

    /// Set the HTTP request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.http_config.timeout = Some(timeout);
        self
    }

    /// Set the TLS configuration for both transports.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.http_config.tls = tls.clone();
        self.subscription.tls = tls;
        self
    }

    /// Validate peer certificates on both transports, replacing
    /// trust-store validation.
    pub fn certificate_validator(self, validator: impl CertificateValidator + 'static) -> Self {
        let validator: Arc<dyn CertificateValidator> = Arc::new(validator);
        let tls = self.http_config.tls.clone().shared_validator(validator);
        self.tls(tls)
    }

    /// Set the subscription transport configuration.
    ///
    /// The TLS settings and header source configured on this builder take
    /// precedence over those in `config`.
    pub fn subscription_config(mut self, config: SubscriptionConfig) -> Self {
        let tls = std::mem::take(&mut self.subscription.tls);
        self.subscription = config;
        if !tls.is_default() {
            self.subscription.tls = tls;
        }
        self
    }

    /// Set the client name and version sent in the subscription handshake.
    pub fn client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.subscription = self.subscription.client_info(name, version);
        self
    }

    /// Build the GraphQL client.
    pub fn build(self) -> Result<GraphQLClient> {
        let http_url = Url::parse(&self.http_url)?;
        if !matches!(http_url.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "GraphQL URL must use http:// or https://, got '{http_url}'"
            )));
        }
        let subscription_url = match self.subscription_url {
            Some(ref url) => Url::parse(url)?,
            None => http_to_ws_url(&http_url)?,
        };

        let fetcher: Arc<dyn HttpFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(ReqwestFetcher::new(&self.http_config)?),
        };
        let store = match (self.store, self.cache_key_fn) {
            (Some(store), _) => store,
            (None, Some(key_fn)) => Arc::new(CacheStore::with_cache_key_fn(key_fn)),
            (None, None) => Arc::new(CacheStore::new()),
        };

        let mut default_headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            default_headers.insert(
                HeaderName::try_from(name.as_str())?,
                HeaderValue::try_from(value.as_str())?,
            );
        }

        let chain = InterceptorChain::standard(ChainConfig {
            url: http_url.clone(),
            fetcher,
            store: store.clone(),
            retry: self.retry,
            header_source: self.header_source.clone(),
            persisted_queries: self.persisted_queries,
            custom_steps: self.custom_steps,
            cache_policy: self.cache_policy,
            default_headers,
        });

        let mut subscription = self.subscription;
        if subscription.header_source.is_none() {
            subscription.header_source = self.header_source;
        }

        tracing::debug!(
            target: targets::CLIENT,
            http_url = %http_url,
            subscription_url = %subscription_url,
            "GraphQL client created"
        );

        Ok(GraphQLClient {
            inner: Arc::new(ClientInner {
                http: HttpTransport::new(chain),
                store,
                http_url,
                subscription_url,
                subscription_config: subscription,
                subscriptions: Mutex::new(None),
            }),
        })
    }
}

fn http_to_ws_url(url: &Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(Error::config(format!(
                "Cannot derive a subscription URL from scheme '{other}'"
            )));
        }
    };
    let mut ws = url.clone();
    ws.set_scheme(scheme)
        .map_err(|_| Error::config(format!("Cannot derive a subscription URL from '{url}'")))?;
    Ok(ws)
}

struct ClientInner {
    http: HttpTransport,
    store: Arc<CacheStore>,
    http_url: Url,
    subscription_url: Url,
    subscription_config: SubscriptionConfig,
    subscriptions: Mutex<Option<SubscriptionTransport>>,
}

/// Routes operations to the HTTP or subscription transport by kind.
///
/// Cheaply cloneable; clones share both transports and the cache.
///
/// # Example
///
/// ```ignore
/// use horizon_lattice_graphql::{GraphQLClient, Operation};
///
/// let client = GraphQLClient::builder("https://api.example.com/graphql")
///     .header_source(|| auth_headers())
///     .build()?;
///
/// let films = client
///     .execute(Operation::query("query FilmList { allFilms { films { __typename id title } } }"))
///     .await?;
///
/// let mut updates = client.submit(Operation::subscription("subscription { filmAdded { id } }"));
/// while let Some(update) = updates.next().await {
///     println!("{:?}", update?.data);
/// }
/// ```
#[derive(Clone)]
pub struct GraphQLClient {
    inner: Arc<ClientInner>,
}

impl GraphQLClient {
    /// Create a client with default settings.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        GraphQLClientBuilder::new(url).build()
    }

    /// Create a builder for configuring a client.
    pub fn builder(url: impl Into<String>) -> GraphQLClientBuilder {
        GraphQLClientBuilder::new(url)
    }

    /// Submit an operation.
    ///
    /// Queries and mutations yield exactly one item. Subscriptions yield
    /// an item per server message until cancelled or terminated.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, operation: impl Into<Arc<Operation>>) -> ResultStream {
        let operation = operation.into();
        let cancelled = Arc::new(AtomicBool::new(false));

        tracing::debug!(
            target: targets::CLIENT,
            kind = %operation.kind(),
            operation = operation.name().unwrap_or("<anonymous>"),
            "Submitting operation"
        );

        if operation.is_subscription() {
            return match self.subscription_transport() {
                Ok(transport) => {
                    let stream = transport.subscribe(operation);
                    let handle = OperationHandle {
                        cancelled,
                        target: stream.handle().map(HandleTarget::Subscription),
                    };
                    ResultStream {
                        handle,
                        source: Source::Subscription(stream),
                    }
                }
                Err(err) => ResultStream {
                    handle: OperationHandle {
                        cancelled,
                        target: None,
                    },
                    source: Source::Failed(Some(err)),
                },
            };
        }

        let (tx, rx) = oneshot::channel();
        let request = self.inner.http.execute(operation, move |result| {
            let _ = tx.send(result);
        });
        ResultStream {
            handle: OperationHandle {
                cancelled,
                target: Some(HandleTarget::Request(request)),
            },
            source: Source::Single(Some(rx)),
        }
    }

    /// Cancel a submitted operation. No item is delivered afterwards.
    pub fn cancel(&self, handle: &OperationHandle) {
        handle.cancel();
    }

    /// Execute a query or mutation and await its result.
    pub async fn execute(&self, operation: impl Into<Arc<Operation>>) -> Result<GraphQLResult> {
        let operation = operation.into();
        if operation.is_subscription() {
            return Err(Error::config(
                "Subscriptions must be submitted, not executed",
            ));
        }
        self.inner.http.send(operation).await
    }

    /// The shared subscription transport, created on first use.
    pub fn subscription_transport(&self) -> Result<SubscriptionTransport> {
        let mut slot = self.inner.subscriptions.lock();
        if let Some(ref transport) = *slot {
            return Ok(transport.clone());
        }
        let transport = SubscriptionTransport::new(
            self.inner.subscription_url.clone(),
            self.inner.subscription_config.clone(),
        )?;
        *slot = Some(transport.clone());
        Ok(transport)
    }

    /// State of the subscription connection, if one was created.
    pub fn subscription_state(&self) -> Option<ConnectionState> {
        self.inner.subscriptions.lock().as_ref().map(|t| t.state())
    }

    /// Close the subscription connection, if one was created.
    pub fn close(&self) {
        if let Some(ref transport) = *self.inner.subscriptions.lock() {
            transport.close();
        }
    }

    /// The shared normalized cache.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    /// Remove every cached record.
    pub fn clear_cache(&self) {
        self.inner.store.clear();
    }

    /// The HTTP transport.
    pub fn http_transport(&self) -> &HttpTransport {
        &self.inner.http
    }

    /// Endpoint for queries and mutations.
    pub fn http_url(&self) -> &Url {
        &self.inner.http_url
    }

    /// Endpoint for subscriptions.
    pub fn subscription_url(&self) -> &Url {
        &self.inner.subscription_url
    }
}

impl std::fmt::Debug for GraphQLClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphQLClient")
            .field("http_url", &self.inner.http_url.as_str())
            .field("subscription_url", &self.inner.subscription_url.as_str())
            .field("subscription_state", &self.subscription_state())
            .finish()
    }
}

#[derive(Clone, Debug)]
enum HandleTarget {
    Request(RequestHandle),
    Subscription(SubscriptionHandle),
}

/// Cancels a submitted operation.
#[derive(Clone, Debug)]
pub struct OperationHandle {
    cancelled: Arc<AtomicBool>,
    target: Option<HandleTarget>,
}

impl OperationHandle {
    /// Cancel the operation: abort a query or mutation, or unsubscribe a
    /// subscription. The shared subscription connection stays open.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.target {
            Some(HandleTarget::Request(ref request)) => {
                request.cancel();
            }
            Some(HandleTarget::Subscription(ref subscription)) => subscription.unsubscribe(),
            None => {}
        }
    }

    /// Check if the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

enum Source {
    Single(Option<oneshot::Receiver<Result<GraphQLResult>>>),
    Subscription(SubscriptionStream),
    Failed(Option<Error>),
}

/// Results of a submitted operation.
pub struct ResultStream {
    handle: OperationHandle,
    source: Source,
}

impl ResultStream {
    /// The cancellation handle.
    pub fn handle(&self) -> &OperationHandle {
        &self.handle
    }

    /// Cancel the operation.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Receive the next result.
    pub async fn next(&mut self) -> Option<Result<GraphQLResult>> {
        futures_util::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl Stream for ResultStream {
    type Item = Result<GraphQLResult>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.handle.is_cancelled() {
            return Poll::Ready(None);
        }

        match this.source {
            Source::Single(ref mut slot) => {
                let Some(receiver) = slot.as_mut() else {
                    return Poll::Ready(None);
                };
                match Pin::new(receiver).poll(cx) {
                    Poll::Ready(result) => {
                        *slot = None;
                        Poll::Ready(result.ok())
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            Source::Subscription(ref mut stream) => Pin::new(stream).poll_next(cx),
            Source::Failed(ref mut err) => Poll::Ready(err.take().map(Err)),
        }
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match self.source {
            Source::Single(_) => "http",
            Source::Subscription(_) => "subscription",
            Source::Failed(_) => "failed",
        };
        f.debug_struct("ResultStream")
            .field("source", &source)
            .field("cancelled", &self.handle.is_cancelled())
            .finish()
    }
}
