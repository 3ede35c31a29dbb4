//! Connection state machine of the subscription transport.

/// The state of the shared subscription connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection and none requested.
    #[default]
    Disconnected,
    /// Opening the socket or waiting for `connection_ack`.
    Connecting,
    /// Acknowledged by the server; subscriptions are flowing.
    Connected,
    /// Connection lost; waiting to reconnect or re-handshaking.
    Reconnecting,
    /// Closed for good. No further connections are made.
    Closed,
}

impl ConnectionState {
    /// Check if subscriptions can currently be sent.
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// Check if the transport is closed for good.
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// Compute the state after `event`.
    ///
    /// `reconnect` is whether lost connections are re-established.
    pub fn transition(self, event: ConnectionEvent, reconnect: bool) -> Self {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Closed, _) => S::Closed,
            (_, E::CloseRequested | E::CertificateRejected) => S::Closed,
            (S::Disconnected, E::ConnectRequested) => S::Connecting,
            (S::Connecting | S::Reconnecting, E::Acknowledged) => S::Connected,
            (_, E::HandshakeTimedOut | E::Disconnected) if reconnect => S::Reconnecting,
            (_, E::HandshakeTimedOut | E::Disconnected) => S::Disconnected,
            (state, E::ConnectRequested | E::Connected | E::Acknowledged | E::Message) => state,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inputs of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection is needed (first subscribe or connect-on-init).
    ConnectRequested,
    /// The socket opened; the handshake has been sent.
    Connected,
    /// The server sent `connection_ack`.
    Acknowledged,
    /// No `connection_ack` arrived in time.
    HandshakeTimedOut,
    /// A protocol message arrived.
    Message,
    /// The socket closed or failed.
    Disconnected,
    /// The peer certificate was refused.
    CertificateRejected,
    /// The caller closed the transport.
    CloseRequested,
}
