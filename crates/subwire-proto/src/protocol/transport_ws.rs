//! `graphql-transport-ws` sub-protocol (graphql-ws library).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{decode_frame, require_id, to_json, SubProtocol};
use crate::error::ProtoResult;
use crate::messages::{ClientMessage, ExecutionPayload, GraphError, OperationRequest, ServerMessage};

const NAME: &str = "graphql-transport-ws";

const CLIENT_TYPES: &[&str] = &["connection_init", "ping", "pong", "subscribe", "complete"];

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    ConnectionInit {
        #[serde(default)]
        payload: Option<Value>,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        #[allow(dead_code)]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: OperationRequest,
    },
    Complete {
        id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    ConnectionAck,
    Ping,
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a Value>,
    },
    Next {
        id: &'a str,
        payload: &'a ExecutionPayload,
    },
    Error {
        id: Option<&'a str>,
        payload: Vec<GraphError>,
    },
    Complete {
        id: &'a str,
    },
}

/// The `graphql-transport-ws` protocol.
///
/// Keep-alive is a server `ping`; clients may ping and are answered with
/// `pong`. Termination is the transport close itself, and a second
/// `connection_init` closes the connection with 4429.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphqlTransportWs;

impl SubProtocol for GraphqlTransportWs {
    fn name(&self) -> &'static str {
        NAME
    }

    fn decode(&self, text: &str) -> ProtoResult<ClientMessage> {
        let frame: ClientFrame = decode_frame(NAME, CLIENT_TYPES, text)?;
        Ok(match frame {
            ClientFrame::ConnectionInit { payload } => ClientMessage::ConnectionInit { payload },
            ClientFrame::Ping { payload } => ClientMessage::Ping { payload },
            ClientFrame::Pong { .. } => ClientMessage::Pong,
            ClientFrame::Subscribe { id, payload } => ClientMessage::Subscribe {
                id: require_id(id)?,
                payload,
            },
            ClientFrame::Complete { id } => ClientMessage::Unsubscribe { id: require_id(id)? },
        })
    }

    fn encode(&self, message: &ServerMessage) -> ProtoResult<Option<String>> {
        let frame = match message {
            ServerMessage::ConnectionAck => ServerFrame::ConnectionAck,
            ServerMessage::KeepAlive | ServerMessage::Ping => ServerFrame::Ping,
            ServerMessage::Pong { payload } => ServerFrame::Pong {
                payload: payload.as_ref(),
            },
            ServerMessage::Data { id, payload } => ServerFrame::Next { id, payload },
            ServerMessage::Error { id, message } => ServerFrame::Error {
                id: id.as_deref(),
                payload: vec![GraphError::new(message.clone())],
            },
            ServerMessage::Complete { id } => ServerFrame::Complete { id },
        };
        to_json(&frame).map(Some)
    }

    fn keep_alive(&self) -> ServerMessage {
        ServerMessage::Ping
    }

    fn repeated_init_is_fatal(&self) -> bool {
        true
    }
}
