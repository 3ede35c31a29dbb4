//! Persistent WebSocket transport for GraphQL subscriptions.
//!
//! All subscriptions share one connection speaking the
//! `graphql-transport-ws` protocol. The connection is owned by a single
//! task that reacts to caller commands and socket events; callers see
//! each subscription as a [`SubscriptionStream`].
//!
//! ```ignore
//! let transport = SubscriptionTransport::new(
//!     Url::parse("wss://api.example.com/graphql")?,
//!     SubscriptionConfig::default(),
//! )?;
//!
//! let mut ticks = transport.subscribe(Operation::subscription("subscription { tick }"));
//! while let Some(result) = ticks.next().await {
//!     println!("{:?}", result?.data);
//! }
//! ```

mod connection;
mod protocol;
mod state;
mod stream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::error::{Error, Result};
use crate::interceptor::HeaderSource;
use crate::logging::targets;
use crate::operation::Operation;
use crate::tls::TlsConfig;

use connection::{Command, Connection};

pub use protocol::{SubscribePayload, WsMessage, SUBPROTOCOL};
pub use state::{ConnectionEvent, ConnectionState};
pub use stream::{SubscriberId, SubscriptionHandle, SubscriptionStream};

/// Configuration for the subscription transport.
#[derive(Clone)]
pub struct SubscriptionConfig {
    /// Connect as soon as the transport is created instead of on the
    /// first subscription.
    pub connect_on_init: bool,
    /// Re-establish lost connections.
    pub reconnect: bool,
    /// Fixed delay before each reconnection attempt.
    pub reconnect_interval: Duration,
    /// Send a separate server subscription for identical operations.
    /// When false, identical operations share one server subscription.
    pub allow_duplicates: bool,
    /// Timeout for opening the socket.
    pub connect_timeout: Duration,
    /// Time allowed between `connection_init` and `connection_ack`.
    pub ack_timeout: Duration,
    /// Interval of protocol pings; `None` disables them.
    pub keep_alive_interval: Option<Duration>,
    /// Client name sent in the handshake headers.
    pub client_name: Option<String>,
    /// Client version sent in the handshake headers.
    pub client_version: Option<String>,
    /// Source of the `connection_init` payload.
    pub header_source: Option<Arc<dyn HeaderSource>>,
    /// TLS configuration for `wss://` endpoints.
    pub tls: TlsConfig,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            connect_on_init: false,
            reconnect: true,
            reconnect_interval: Duration::from_millis(500),
            allow_duplicates: true,
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            keep_alive_interval: Some(Duration::from_secs(30)),
            client_name: None,
            client_version: None,
            header_source: None,
            tls: TlsConfig::default(),
        }
    }
}

impl std::fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("connect_on_init", &self.connect_on_init)
            .field("reconnect", &self.reconnect)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("allow_duplicates", &self.allow_duplicates)
            .field("connect_timeout", &self.connect_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .field("header_source", &self.header_source.is_some())
            .field("tls", &self.tls)
            .finish()
    }
}

impl SubscriptionConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect when the transport is created.
    pub fn connect_on_init(mut self, enabled: bool) -> Self {
        self.connect_on_init = enabled;
        self
    }

    /// Enable or disable reconnection.
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    /// Set the reconnection delay.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Allow or collapse duplicate subscriptions.
    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    /// Set the `connection_ack` timeout.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set or disable the keep-alive ping interval.
    pub fn keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the client name and version handshake headers.
    pub fn client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self.client_version = Some(version.into());
        self
    }

    /// Set the `connection_init` payload source.
    pub fn header_source(mut self, source: Arc<dyn HeaderSource>) -> Self {
        self.header_source = Some(source);
        self
    }

    /// Set the TLS configuration.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }
}

/// Subscription options that can be read from configuration files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// See [`SubscriptionConfig::connect_on_init`].
    pub connect_on_init: bool,
    /// See [`SubscriptionConfig::reconnect`].
    pub reconnect: bool,
    /// Reconnection delay in milliseconds.
    pub reconnect_interval_ms: u64,
    /// See [`SubscriptionConfig::allow_duplicates`].
    pub allow_duplicates: bool,
    /// `connection_ack` timeout in milliseconds.
    pub ack_timeout_ms: u64,
    /// Ping interval in milliseconds; `0` disables pings.
    pub keep_alive_interval_ms: u64,
    /// Client name handshake header.
    pub client_name: Option<String>,
    /// Client version handshake header.
    pub client_version: Option<String>,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        let defaults = SubscriptionConfig::default();
        Self {
            connect_on_init: defaults.connect_on_init,
            reconnect: defaults.reconnect,
            reconnect_interval_ms: defaults.reconnect_interval.as_millis() as u64,
            allow_duplicates: defaults.allow_duplicates,
            ack_timeout_ms: defaults.ack_timeout.as_millis() as u64,
            keep_alive_interval_ms: defaults
                .keep_alive_interval
                .map_or(0, |d| d.as_millis() as u64),
            client_name: None,
            client_version: None,
        }
    }
}

impl SubscriptionSettings {
    /// Apply these settings on top of a transport configuration.
    pub fn apply(&self, config: &mut SubscriptionConfig) {
        config.connect_on_init = self.connect_on_init;
        config.reconnect = self.reconnect;
        config.reconnect_interval = Duration::from_millis(self.reconnect_interval_ms);
        config.allow_duplicates = self.allow_duplicates;
        config.ack_timeout = Duration::from_millis(self.ack_timeout_ms);
        config.keep_alive_interval =
            (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms));
        config.client_name.clone_from(&self.client_name);
        config.client_version.clone_from(&self.client_version);
    }
}

struct TransportInner {
    url: Url,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    next_subscriber: AtomicU64,
}

/// Multiplexes subscriptions over one shared WebSocket connection.
///
/// Cheaply cloneable; clones share the connection. The connection task
/// stops once the transport and every stream it produced are dropped.
#[derive(Clone)]
pub struct SubscriptionTransport {
    inner: Arc<TransportInner>,
}

impl SubscriptionTransport {
    /// Start the transport for a `ws://` or `wss://` endpoint.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(url: Url, config: SubscriptionConfig) -> Result<Self> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Subscription URL must use ws:// or wss://, got '{url}'"
            )));
        }

        let tls = if url.scheme() == "wss" {
            Some(config.tls.build_rustls_config()?)
        } else {
            None
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let connection = Connection::new(url.clone(), config, tls, commands_rx, state_tx);
        tokio::spawn(connection.run());

        tracing::debug!(target: targets::SUBSCRIPTION, %url, "Subscription transport started");

        Ok(Self {
            inner: Arc::new(TransportInner {
                url,
                commands: commands_tx,
                state: state_rx,
                next_subscriber: AtomicU64::new(1),
            }),
        })
    }

    /// The endpoint URL.
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Start `operation` and stream its results.
    ///
    /// If the transport is closed the stream yields a single error.
    pub fn subscribe(&self, operation: impl Into<Arc<Operation>>) -> SubscriptionStream {
        let id = SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let command = Command::Subscribe {
            subscriber: id,
            operation: operation.into(),
            sender: tx,
        };
        if let Err(mpsc::error::SendError(Command::Subscribe { sender, .. })) =
            self.inner.commands.send(command)
        {
            let _ = sender.send(Err(closed_error()));
        }

        SubscriptionStream::new(id, rx, self.inner.commands.clone())
    }

    /// Stop the subscription identified by `handle`.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.unsubscribe();
    }

    /// Connect now instead of waiting for the first subscription.
    pub fn connect(&self) {
        let _ = self.inner.commands.send(Command::Connect);
    }

    /// Close the connection with a normal close frame. Active streams end
    /// and no further connection is made.
    pub fn close(&self) {
        let _ = self.inner.commands.send(Command::Close);
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Check if both handles drive the same connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SubscriptionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTransport")
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn closed_error() -> Error {
    Error::config("Subscription transport is closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_round_trip_defaults() {
        let mut config = SubscriptionConfig::default();
        SubscriptionSettings::default().apply(&mut config);
        assert!(config.reconnect);
        assert!(config.allow_duplicates);
        assert_eq!(config.reconnect_interval, Duration::from_millis(500));
        assert_eq!(config.keep_alive_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_settings_disable_keep_alive() {
        let mut config = SubscriptionConfig::default();
        SubscriptionSettings {
            keep_alive_interval_ms: 0,
            allow_duplicates: false,
            ..Default::default()
        }
        .apply(&mut config);
        assert_eq!(config.keep_alive_interval, None);
        assert!(!config.allow_duplicates);
    }

    #[tokio::test]
    async fn test_rejects_http_url() {
        let err = SubscriptionTransport::new(
            Url::parse("http://localhost/graphql").unwrap(),
            SubscriptionConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_lazy_transport_stays_disconnected() {
        let transport = SubscriptionTransport::new(
            Url::parse("ws://127.0.0.1:9/graphql").unwrap(),
            SubscriptionConfig::default(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
