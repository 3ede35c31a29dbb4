//! Error types for the GraphQL transport.

use crate::response::GraphQLError;

/// Result type alias for GraphQL transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`], used by the retry guard and by
/// callers that only care about the category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection, DNS, timeout or TLS failure.
    Transport,
    /// Non-2xx HTTP status.
    Protocol,
    /// Malformed response body.
    Parse,
    /// Server-reported GraphQL errors.
    GraphQL,
    /// The peer certificate was refused by the pinning validator.
    CertificateRejected,
    /// The caller cancelled the operation.
    Cancelled,
    /// Invalid configuration or misuse of the API.
    Config,
}

/// Errors produced by the GraphQL transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Connection, DNS, timeout or TLS failure. Retryable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Protocol {
        /// HTTP status code.
        status: u16,
        /// Response body, decoded lossily as UTF-8.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// The server reported errors for a streamed operation.
    #[error("GraphQL error: {}", join_messages(.0))]
    GraphQL(Vec<GraphQLError>),

    /// The transport-security validator refused the peer certificate.
    #[error("Peer certificate rejected: {0}")]
    CertificateRejected(String),

    /// The operation was cancelled before it completed.
    #[error("Operation was cancelled")]
    Cancelled,

    /// Invalid configuration or API misuse.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn join_messages(errors: &[GraphQLError]) -> String {
    if errors.is_empty() {
        return "unknown error".to_string();
    }
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Parse(_) => ErrorKind::Parse,
            Self::GraphQL(_) => ErrorKind::GraphQL,
            Self::CertificateRejected(_) => ErrorKind::CertificateRejected,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the retry guard may re-drive the chain after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if crate::tls::is_certificate_rejection(&err) {
            return Self::CertificateRejected(err.to_string());
        }
        if err.is_decode() {
            Self::Parse(err.to_string())
        } else if err.is_builder() {
            Self::Config(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        if crate::tls::is_certificate_rejection(&err) {
            return Self::CertificateRejected(err.to_string());
        }
        match err {
            WsError::Url(e) => Self::Config(e.to_string()),
            WsError::HttpFormat(e) => Self::Config(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("Invalid URL: {err}"))
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::Config(format!("Invalid header name: {err}"))
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::Config(format!("Invalid header value: {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_retryable() {
        assert!(Error::transport("connection refused").is_retryable());
        assert!(!Error::Protocol { status: 503, body: String::new() }.is_retryable());
        assert!(!Error::Parse("eof".into()).is_retryable());
        assert!(!Error::CertificateRejected("pin mismatch".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_graphql_error_display_joins_messages() {
        let err = Error::GraphQL(vec![
            GraphQLError::new("first"),
            GraphQLError::new("second"),
        ]);
        assert_eq!(err.to_string(), "GraphQL error: first; second");
        assert_eq!(err.kind(), ErrorKind::GraphQL);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = Error::Protocol {
            status: 404,
            body: "not found".into(),
        };
        assert_eq!(err.to_string(), "HTTP 404: not found");
    }
}
