//! The task owning the subscription socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use http::HeaderValue;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as HandshakeRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{Error, Result};
use crate::logging::targets;
use crate::operation::Operation;
use crate::response::{GraphQLResult, ResultSource};

use super::protocol::{SubscribePayload, WsMessage, SUBPROTOCOL};
use super::state::{ConnectionEvent, ConnectionState};
use super::stream::SubscriberId;
use super::{closed_error, SubscriptionConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ResultSender = mpsc::UnboundedSender<Result<GraphQLResult>>;

const CLIENT_NAME_HEADER: &str = "apollographql-client-name";
const CLIENT_VERSION_HEADER: &str = "apollographql-client-version";

/// Requests from the transport and its streams.
#[derive(Debug)]
pub(crate) enum Command {
    Subscribe {
        subscriber: SubscriberId,
        operation: Arc<Operation>,
        sender: ResultSender,
    },
    Unsubscribe {
        subscriber: SubscriberId,
    },
    Connect,
    Close,
}

struct Subscriber {
    sender: ResultSender,
    server_id: String,
}

/// One subscription as known to the server. Several subscribers share it
/// when duplicates are collapsed.
struct ServerSubscription {
    payload: SubscribePayload,
    subscribers: Vec<SubscriberId>,
    dedup_key: Option<String>,
}

enum SessionEnd {
    /// Closed by the caller.
    Closed,
    /// Lost; may reconnect.
    Lost(Error, ConnectionEvent),
    /// Refused by the certificate validator; terminal.
    Rejected(Error),
}

pub(crate) struct Connection {
    url: Url,
    config: SubscriptionConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    server_subscriptions: HashMap<String, ServerSubscription>,
    dedup: HashMap<String, String>,
    next_server_id: u64,
    wanted: bool,
}

impl Connection {
    pub(crate) fn new(
        url: Url,
        config: SubscriptionConfig,
        tls: Option<Arc<rustls::ClientConfig>>,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let wanted = config.connect_on_init;
        Self {
            url,
            config,
            tls,
            commands,
            state,
            subscribers: HashMap::new(),
            server_subscriptions: HashMap::new(),
            dedup: HashMap::new(),
            next_server_id: 1,
            wanted,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            if !self.wanted && self.subscribers.is_empty() {
                match self.commands.recv().await {
                    None | Some(Command::Close) => return self.shutdown(ConnectionEvent::CloseRequested),
                    Some(command) => {
                        self.handle_offline(command);
                        continue;
                    }
                }
            }

            self.apply(ConnectionEvent::ConnectRequested);
            let end = match self.open().await {
                None => SessionEnd::Closed,
                Some(Ok(socket)) => {
                    self.apply(ConnectionEvent::Connected);
                    self.session(socket).await
                }
                Some(Err(err @ Error::CertificateRejected(_))) => SessionEnd::Rejected(err),
                Some(Err(err)) => SessionEnd::Lost(err, ConnectionEvent::Disconnected),
            };

            match end {
                SessionEnd::Closed => return self.shutdown(ConnectionEvent::CloseRequested),
                SessionEnd::Rejected(err) => {
                    tracing::warn!(target: targets::SUBSCRIPTION, error = %err, "Connection rejected");
                    self.fail_all(err);
                    return self.shutdown(ConnectionEvent::CertificateRejected);
                }
                SessionEnd::Lost(err, event) => {
                    tracing::warn!(
                        target: targets::SUBSCRIPTION,
                        error = %err,
                        reconnect = self.config.reconnect,
                        "Connection lost"
                    );
                    self.apply(event);
                    if !self.config.reconnect {
                        self.fail_all(err);
                        self.wanted = false;
                        continue;
                    }
                    if !self.wait_before_reconnect().await {
                        return self.shutdown(ConnectionEvent::CloseRequested);
                    }
                }
            }
        }
    }

    /// Open the socket while still serving commands. `None` means the
    /// caller closed the transport meanwhile.
    async fn open(&mut self) -> Option<Result<WsStream>> {
        let request = match self.handshake_request() {
            Ok(request) => request,
            Err(err) => return Some(Err(err)),
        };
        let connector = self.tls.clone().map(Connector::Rustls);
        let timeout = self.config.connect_timeout;

        tracing::debug!(target: targets::SUBSCRIPTION, url = %self.url, "Connecting");
        let connect = tokio::time::timeout(
            timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector),
        );
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return Some(match result {
                        Ok(Ok((socket, _response))) => Ok(socket),
                        Ok(Err(err)) => Err(Error::from(err)),
                        Err(_) => Err(Error::transport(format!(
                            "Connection timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    });
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => return None,
                    Some(command) => self.handle_offline(command),
                }
            }
        }
    }

    fn handshake_request(&self) -> Result<HandshakeRequest> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(SUBPROTOCOL),
        );
        if let Some(ref name) = self.config.client_name {
            headers.insert(CLIENT_NAME_HEADER, HeaderValue::from_str(name)?);
        }
        if let Some(ref version) = self.config.client_version {
            headers.insert(CLIENT_VERSION_HEADER, HeaderValue::from_str(version)?);
        }
        Ok(request)
    }

    fn init_payload(&self) -> Option<Value> {
        let source = self.config.header_source.as_ref()?;
        let payload = source
            .headers()
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect();
        Some(Value::Object(payload))
    }

    async fn session(&mut self, socket: WsStream) -> SessionEnd {
        let (mut write, mut read) = socket.split();

        let init = WsMessage::ConnectionInit {
            payload: self.init_payload(),
        };
        if let Err(err) = send(&mut write, &init).await {
            return SessionEnd::Lost(err, ConnectionEvent::Disconnected);
        }

        let ack_deadline = tokio::time::sleep(self.config.ack_timeout);
        tokio::pin!(ack_deadline);
        let mut acked = false;

        let ping_period = self.config.keep_alive_interval;
        let period = ping_period.unwrap_or(Duration::from_secs(3600));
        let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = &mut ack_deadline, if !acked => {
                    return SessionEnd::Lost(
                        Error::transport("Timed out waiting for connection_ack"),
                        ConnectionEvent::HandshakeTimedOut,
                    );
                }
                _ = keep_alive.tick(), if acked && ping_period.is_some() => {
                    if let Err(err) = send(&mut write, &WsMessage::Ping { payload: None }).await {
                        return SessionEnd::Lost(err, ConnectionEvent::Disconnected);
                    }
                }
                command = self.commands.recv() => {
                    let outgoing = match command {
                        None | Some(Command::Close) => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "".into(),
                            };
                            let _ = write.send(Message::Close(Some(frame))).await;
                            let _ = write.close().await;
                            return SessionEnd::Closed;
                        }
                        Some(Command::Connect) => None,
                        Some(Command::Subscribe { subscriber, operation, sender }) => self
                            .register(subscriber, &operation, sender)
                            .map(|(id, payload)| WsMessage::Subscribe { id, payload }),
                        Some(Command::Unsubscribe { subscriber }) => self
                            .unregister(subscriber)
                            .map(|id| WsMessage::Complete { id }),
                    };
                    if acked
                        && let Some(message) = outgoing
                        && let Err(err) = send(&mut write, &message).await
                    {
                        return SessionEnd::Lost(err, ConnectionEvent::Disconnected);
                    }
                }
                frame = read.next() => {
                    let text = match frame {
                        None => {
                            return SessionEnd::Lost(
                                Error::transport("Connection closed"),
                                ConnectionEvent::Disconnected,
                            );
                        }
                        Some(Err(err)) => {
                            return SessionEnd::Lost(Error::from(err), ConnectionEvent::Disconnected);
                        }
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("{} {}", f.code, f.reason))
                                .unwrap_or_else(|| "no close frame".into());
                            return SessionEnd::Lost(
                                Error::transport(format!("Server closed the connection: {reason}")),
                                ConnectionEvent::Disconnected,
                            );
                        }
                        Some(Ok(_)) => continue,
                    };

                    let message = match WsMessage::from_text(&text) {
                        Ok(message) => message,
                        Err(err) => {
                            tracing::warn!(
                                target: targets::SUBSCRIPTION,
                                error = %err,
                                "Ignoring malformed message"
                            );
                            continue;
                        }
                    };
                    self.apply(ConnectionEvent::Message);

                    let reply = match message {
                        WsMessage::ConnectionAck { .. } if !acked => {
                            acked = true;
                            self.apply(ConnectionEvent::Acknowledged);
                            if let Err(err) = self.subscribe_all(&mut write).await {
                                return SessionEnd::Lost(err, ConnectionEvent::Disconnected);
                            }
                            None
                        }
                        WsMessage::Ping { payload } => Some(WsMessage::Pong { payload }),
                        WsMessage::Next { id, payload } => {
                            self.deliver(&id, Ok(GraphQLResult::from_response(payload, ResultSource::Server)));
                            None
                        }
                        WsMessage::Error { id, payload } => {
                            self.deliver(&id, Err(Error::GraphQL(payload)));
                            self.finish_server_subscription(&id);
                            None
                        }
                        WsMessage::Complete { id } => {
                            self.finish_server_subscription(&id);
                            None
                        }
                        other => {
                            tracing::trace!(target: targets::SUBSCRIPTION, message = ?other, "Ignoring message");
                            None
                        }
                    };
                    if let Some(reply) = reply
                        && let Err(err) = send(&mut write, &reply).await
                    {
                        return SessionEnd::Lost(err, ConnectionEvent::Disconnected);
                    }
                }
            }
        }
    }

    async fn subscribe_all<S>(&self, write: &mut S) -> Result<()>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        for (id, subscription) in &self.server_subscriptions {
            let message = WsMessage::Subscribe {
                id: id.clone(),
                payload: subscription.payload.clone(),
            };
            send(write, &message).await?;
        }
        tracing::debug!(
            target: targets::SUBSCRIPTION,
            count = self.server_subscriptions.len(),
            "Sent pending subscriptions"
        );
        Ok(())
    }

    async fn wait_before_reconnect(&mut self) -> bool {
        let delay = tokio::time::sleep(self.config.reconnect_interval);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return true,
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => return false,
                    Some(command) => self.handle_offline(command),
                }
            }
        }
    }

    fn handle_offline(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                subscriber,
                operation,
                sender,
            } => {
                self.register(subscriber, &operation, sender);
            }
            Command::Unsubscribe { subscriber } => {
                self.unregister(subscriber);
            }
            Command::Connect => self.wanted = true,
            Command::Close => {}
        }
    }

    /// Track a subscriber. Returns the server subscription to start, if a
    /// new one is needed.
    fn register(
        &mut self,
        subscriber: SubscriberId,
        operation: &Operation,
        sender: ResultSender,
    ) -> Option<(String, SubscribePayload)> {
        let dedup_key = (!self.config.allow_duplicates).then(|| operation.cache_key());

        if let Some(ref key) = dedup_key
            && let Some(server_id) = self.dedup.get(key).cloned()
            && let Some(shared) = self.server_subscriptions.get_mut(&server_id)
        {
            shared.subscribers.push(subscriber);
            self.subscribers
                .insert(subscriber, Subscriber { sender, server_id });
            return None;
        }

        let server_id = self.next_server_id.to_string();
        self.next_server_id += 1;
        let payload = SubscribePayload::from(operation);

        if let Some(ref key) = dedup_key {
            self.dedup.insert(key.clone(), server_id.clone());
        }
        self.server_subscriptions.insert(
            server_id.clone(),
            ServerSubscription {
                payload: payload.clone(),
                subscribers: vec![subscriber],
                dedup_key,
            },
        );
        self.subscribers.insert(
            subscriber,
            Subscriber {
                sender,
                server_id: server_id.clone(),
            },
        );

        tracing::debug!(
            target: targets::SUBSCRIPTION,
            id = %server_id,
            operation = operation.name().unwrap_or("<anonymous>"),
            "Subscribing"
        );
        Some((server_id, payload))
    }

    /// Forget a subscriber. Returns the server subscription to complete
    /// when it was the last subscriber.
    fn unregister(&mut self, subscriber: SubscriberId) -> Option<String> {
        let entry = self.subscribers.remove(&subscriber)?;
        let shared = self.server_subscriptions.get_mut(&entry.server_id)?;
        shared.subscribers.retain(|s| *s != subscriber);
        if !shared.subscribers.is_empty() {
            return None;
        }

        let removed = self.server_subscriptions.remove(&entry.server_id)?;
        if let Some(key) = removed.dedup_key {
            self.dedup.remove(&key);
        }
        tracing::debug!(target: targets::SUBSCRIPTION, id = %entry.server_id, "Unsubscribing");
        Some(entry.server_id)
    }

    fn deliver(&self, server_id: &str, result: Result<GraphQLResult>) {
        let Some(shared) = self.server_subscriptions.get(server_id) else {
            tracing::trace!(target: targets::SUBSCRIPTION, id = %server_id, "Message for unknown subscription");
            return;
        };
        for subscriber in &shared.subscribers {
            if let Some(entry) = self.subscribers.get(subscriber) {
                let _ = entry.sender.send(result.clone());
            }
        }
    }

    /// Drop a server subscription and end its subscribers' streams.
    fn finish_server_subscription(&mut self, server_id: &str) {
        let Some(shared) = self.server_subscriptions.remove(server_id) else {
            return;
        };
        for subscriber in shared.subscribers {
            self.subscribers.remove(&subscriber);
        }
        if let Some(key) = shared.dedup_key {
            self.dedup.remove(&key);
        }
    }

    /// Deliver a terminal error to every subscriber and forget them all.
    fn fail_all(&mut self, err: Error) {
        for (_, subscriber) in self.subscribers.drain() {
            let _ = subscriber.sender.send(Err(err.clone()));
        }
        self.server_subscriptions.clear();
        self.dedup.clear();
    }

    fn shutdown(&mut self, event: ConnectionEvent) {
        // Refuse new commands before announcing the closed state.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Subscribe { sender, .. } = command {
                let _ = sender.send(Err(closed_error()));
            }
        }
        self.apply(event);
        self.subscribers.clear();
        self.server_subscriptions.clear();
        self.dedup.clear();
        tracing::debug!(target: targets::SUBSCRIPTION, "Subscription transport closed");
    }

    fn apply(&self, event: ConnectionEvent) {
        let current = *self.state.borrow();
        let next = current.transition(event, self.config.reconnect);
        if next != current {
            tracing::debug!(
                target: targets::SUBSCRIPTION,
                from = %current,
                to = %next,
                ?event,
                "Connection state changed"
            );
            self.state.send_replace(next);
        }
    }
}

async fn send<S>(write: &mut S, message: &WsMessage) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = message.to_text()?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}
