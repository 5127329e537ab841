//! Protocol-independent message definitions.
//!
//! Both sub-protocols decode into [`ClientMessage`] and encode from
//! [`ServerMessage`]; the session state machine only ever sees these.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A GraphQL operation as sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    /// Query document.
    pub query: String,
    /// Variables, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    /// Operation to run when the document holds several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl OperationRequest {
    /// Create a request with no variables.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    /// Set variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Set the operation name.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// A single GraphQL error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphError {
    /// Error message.
    pub message: String,
    /// Response path the error applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    /// Implementation specific details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphError {
    /// Create an error with only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }
}

/// Result of executing an operation: `{ data, errors }`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionPayload {
    /// Result data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Errors raised during execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphError>,
}

impl ExecutionPayload {
    /// Payload carrying data only.
    #[must_use]
    pub const fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Payload carrying errors only.
    #[must_use]
    pub const fn errors(errors: Vec<GraphError>) -> Self {
        Self { data: None, errors }
    }

    /// Check if execution produced any errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Messages received from a subscription client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Protocol init handshake.
    ConnectionInit {
        /// Connection parameters.
        payload: Option<Value>,
    },
    /// Start an operation (subscription or one-shot query/mutation).
    Subscribe {
        /// Client-supplied operation id.
        id: String,
        /// The operation.
        payload: OperationRequest,
    },
    /// Stop a running subscription.
    Unsubscribe {
        /// Client-supplied operation id.
        id: String,
    },
    /// Liveness probe; answered with a pong.
    Ping {
        /// Optional payload, echoed back.
        payload: Option<Value>,
    },
    /// Answer to a server ping.
    Pong,
    /// Client asks to end the connection.
    Terminate,
}

impl ClientMessage {
    /// Check if this is a protocol init message.
    #[must_use]
    pub const fn is_init(&self) -> bool {
        matches!(self, Self::ConnectionInit { .. })
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionInit { .. } => "connection_init",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Ping { .. } => "ping",
            Self::Pong => "pong",
            Self::Terminate => "terminate",
        }
    }
}

/// Messages sent to a subscription client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Init handshake accepted.
    ConnectionAck,
    /// Periodic keep-alive.
    KeepAlive,
    /// Liveness probe.
    Ping,
    /// Answer to a client ping.
    Pong {
        /// Echoed payload.
        payload: Option<Value>,
    },
    /// Result for an operation.
    Data {
        /// Operation id.
        id: String,
        /// Execution result.
        payload: ExecutionPayload,
    },
    /// Error for an operation, or for the connection when `id` is `None`.
    Error {
        /// Operation id, if the error belongs to one.
        id: Option<String>,
        /// Human readable message.
        message: String,
    },
    /// Operation finished; no more data for `id`.
    Complete {
        /// Operation id.
        id: String,
    },
}

impl ServerMessage {
    /// Build an operation error.
    #[must_use]
    pub fn operation_error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id: Some(id.into()),
            message: message.into(),
        }
    }

    /// Build a connection-level error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::Error {
            id: None,
            message: message.into(),
        }
    }
}
