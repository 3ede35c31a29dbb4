//! `graphql-transport-ws` wire messages.
//!
//! See <https://github.com/enisdenjo/graphql-ws/blob/master/PROTOCOL.md>.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::Operation;
use crate::response::{GraphQLError, GraphQLResponse};

/// WebSocket subprotocol name.
pub const SUBPROTOCOL: &str = "graphql-transport-ws";

/// A protocol message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: initialize the connection.
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Server -> Client: connection accepted.
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Either direction: keep-alive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Either direction: keep-alive answer.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Client -> Server: start an operation.
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    /// Server -> Client: an execution result.
    Next {
        id: String,
        payload: GraphQLResponse,
    },
    /// Server -> Client: the operation failed; no further messages follow.
    Error {
        id: String,
        payload: Vec<GraphQLError>,
    },
    /// Either direction: the operation is finished.
    Complete { id: String },
}

impl WsMessage {
    /// Decode a text frame.
    pub fn from_text(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Encode as a text frame.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Payload of a [`WsMessage::Subscribe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl From<&Operation> for SubscribePayload {
    fn from(operation: &Operation) -> Self {
        Self {
            query: operation.document().to_string(),
            variables: operation.variables_value().cloned(),
            operation_name: operation.name().map(str::to_string),
            extensions: operation.extensions_value().cloned(),
        }
    }
}
