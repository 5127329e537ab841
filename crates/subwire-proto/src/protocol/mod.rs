//! Sub-protocol codecs.
//!
//! A [`SubProtocol`] is chosen once per connection during negotiation and
//! stays fixed for the session's lifetime. It translates between wire text
//! and the protocol-independent [`ClientMessage`]/[`ServerMessage`] and
//! carries the few behavioral differences between the sibling protocols.

mod graphql_ws;
mod transport_ws;

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ProtoError, ProtoResult};
use crate::messages::{ClientMessage, ServerMessage};

pub use graphql_ws::GraphqlWs;
pub use transport_ws::GraphqlTransportWs;

/// Codec and policy for one wire sub-protocol.
pub trait SubProtocol: Send + Sync + fmt::Debug {
    /// Registered name, as it appears in `Sec-WebSocket-Protocol`.
    fn name(&self) -> &'static str;

    /// Decode one full text message.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON, lacks a `type`, or
    /// the `type` is not part of this protocol.
    fn decode(&self, text: &str) -> ProtoResult<ClientMessage>;

    /// Encode a message.
    ///
    /// Returns `Ok(None)` when the message has no representation in this
    /// protocol and should not be sent.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn encode(&self, message: &ServerMessage) -> ProtoResult<Option<String>>;

    /// Message sent on every keep-alive tick.
    fn keep_alive(&self) -> ServerMessage {
        ServerMessage::KeepAlive
    }

    /// Whether a keep-alive is sent immediately after the ack.
    fn keep_alive_after_ack(&self) -> bool {
        false
    }

    /// Whether the server confirms an unsubscribe with `complete`.
    fn completes_on_unsubscribe(&self) -> bool {
        false
    }

    /// Whether a second init message ends the connection.
    fn repeated_init_is_fatal(&self) -> bool {
        false
    }
}

/// All sub-protocols shipped with subwire, in default preference order.
#[must_use]
pub fn builtin_protocols() -> Vec<Arc<dyn SubProtocol>> {
    vec![Arc::new(GraphqlTransportWs), Arc::new(GraphqlWs)]
}

/// Parse `text` and check its `type` against the protocol's known types
/// before deserializing into the protocol's frame enum.
pub(crate) fn decode_frame<T: DeserializeOwned>(
    protocol: &'static str,
    known_types: &[&str],
    text: &str,
) -> ProtoResult<T> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtoError::Decoding(e.to_string()))?;

    match value.get("type").and_then(Value::as_str) {
        None => return Err(ProtoError::MissingField("type")),
        Some(message_type) if !known_types.contains(&message_type) => {
            return Err(ProtoError::UnsupportedMessage {
                protocol,
                message_type: message_type.to_string(),
            });
        }
        Some(_) => {}
    }

    serde_json::from_value(value).map_err(|e| ProtoError::Decoding(e.to_string()))
}

/// Reject empty operation ids.
pub(crate) fn require_id(id: String) -> ProtoResult<String> {
    if id.trim().is_empty() {
        Err(ProtoError::MissingField("id"))
    } else {
        Ok(id)
    }
}

pub(crate) fn to_json<T: serde::Serialize>(frame: &T) -> ProtoResult<String> {
    serde_json::to_string(frame).map_err(|e| ProtoError::Encoding(e.to_string()))
}
