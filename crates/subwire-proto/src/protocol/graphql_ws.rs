//! Legacy `graphql-ws` sub-protocol (subscriptions-transport-ws).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{decode_frame, require_id, to_json, SubProtocol};
use crate::error::ProtoResult;
use crate::messages::{ClientMessage, ExecutionPayload, OperationRequest, ServerMessage};

const NAME: &str = "graphql-ws";

const CLIENT_TYPES: &[&str] = &["connection_init", "start", "stop", "connection_terminate"];

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    ConnectionInit {
        #[serde(default)]
        payload: Option<Value>,
    },
    Start {
        id: String,
        payload: OperationRequest,
    },
    Stop {
        id: String,
    },
    ConnectionTerminate,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    ConnectionAck,
    ConnectionError {
        payload: ErrorBody<'a>,
    },
    #[serde(rename = "ka")]
    KeepAlive,
    Data {
        id: &'a str,
        payload: &'a ExecutionPayload,
    },
    Error {
        id: &'a str,
        payload: ErrorBody<'a>,
    },
    Complete {
        id: &'a str,
    },
}

/// The `graphql-ws` protocol used by subscriptions-transport-ws clients.
///
/// Keep-alive is the `ka` message, sent right after `connection_ack` and
/// on every tick. There is no ping/pong; a `stop` is confirmed with
/// `complete`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphqlWs;

impl SubProtocol for GraphqlWs {
    fn name(&self) -> &'static str {
        NAME
    }

    fn decode(&self, text: &str) -> ProtoResult<ClientMessage> {
        let frame: ClientFrame = decode_frame(NAME, CLIENT_TYPES, text)?;
        Ok(match frame {
            ClientFrame::ConnectionInit { payload } => ClientMessage::ConnectionInit { payload },
            ClientFrame::Start { id, payload } => ClientMessage::Subscribe {
                id: require_id(id)?,
                payload,
            },
            ClientFrame::Stop { id } => ClientMessage::Unsubscribe { id: require_id(id)? },
            ClientFrame::ConnectionTerminate => ClientMessage::Terminate,
        })
    }

    fn encode(&self, message: &ServerMessage) -> ProtoResult<Option<String>> {
        let frame = match message {
            ServerMessage::ConnectionAck => ServerFrame::ConnectionAck,
            ServerMessage::KeepAlive => ServerFrame::KeepAlive,
            ServerMessage::Ping | ServerMessage::Pong { .. } => return Ok(None),
            ServerMessage::Data { id, payload } => ServerFrame::Data { id, payload },
            ServerMessage::Error { id: Some(id), message } => ServerFrame::Error {
                id,
                payload: ErrorBody { message },
            },
            ServerMessage::Error { id: None, message } => ServerFrame::ConnectionError {
                payload: ErrorBody { message },
            },
            ServerMessage::Complete { id } => ServerFrame::Complete { id },
        };
        to_json(&frame).map(Some)
    }

    fn keep_alive_after_ack(&self) -> bool {
        true
    }

    fn completes_on_unsubscribe(&self) -> bool {
        true
    }
}
