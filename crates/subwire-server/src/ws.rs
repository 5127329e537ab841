//! WebSocket transport over `tokio-tungstenite`.

use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use subwire_proto::{ClientIdentity, CloseStatus};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig as TungsteniteConfig};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::debug;

use crate::config::WebSocketConfig;
use crate::negotiator::ProtocolNegotiator;
use crate::transport::{
    ClientConnection, CloseInfo, Inbound, TransportError, TransportResult, TransportState,
};

/// What the HTTP upgrade request told us.
#[derive(Debug, Default)]
struct Handshake {
    path: String,
    requested_protocols: Option<String>,
    identity: Option<ClientIdentity>,
    negotiated: Option<&'static str>,
}

/// Size of a WebSocket message payload in bytes.
#[must_use]
pub fn ws_message_size(message: &WsMessage) -> usize {
    match message {
        WsMessage::Text(text) => text.len(),
        WsMessage::Binary(data) | WsMessage::Ping(data) | WsMessage::Pong(data) => data.len(),
        WsMessage::Close(frame) => frame.as_ref().map_or(0, |f| f.reason.len() + 2),
        WsMessage::Frame(frame) => frame.len(),
    }
}

/// An upgraded WebSocket connection.
///
/// The upgrade happens in [`WsConnection::accept`], so the transport is
/// already open (and the HTTP response already sent) when the gateway
/// sees it.
pub struct WsConnection {
    handshake: Handshake,
    state: TransportState,
    limits: WebSocketConfig,
    sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    stream: SplitStream<WebSocketStream<TcpStream>>,
}

impl WsConnection {
    /// Perform the WebSocket upgrade on `stream`.
    ///
    /// The client's `Sec-WebSocket-Protocol` list is negotiated during the
    /// upgrade so the chosen protocol can be echoed back. A bearer token in
    /// `Authorization` becomes the connection's identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn accept(
        stream: TcpStream,
        negotiator: &ProtocolNegotiator,
        limits: WebSocketConfig,
    ) -> TransportResult<Self> {
        let mut handshake = Handshake::default();

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            handshake.path = request.uri().path().to_string();
            handshake.requested_protocols = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            handshake.identity = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim())
                .filter(|principal| !principal.is_empty())
                .map(ClientIdentity::new);

            if let Ok(protocol) = negotiator.negotiate(handshake.requested_protocols.as_deref()) {
                handshake.negotiated = Some(protocol.name());
                if handshake.requested_protocols.is_some() {
                    response
                        .headers_mut()
                        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol.name()));
                }
            }
            Ok(response)
        };

        let mut ws_config = TungsteniteConfig::default();
        ws_config.max_frame_size = Some(limits.max_frame_size);
        let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
        let (sink, stream) = ws.split();

        debug!(
            path = %handshake.path,
            protocol = ?handshake.negotiated,
            authenticated = handshake.identity.is_some(),
            "WebSocket upgrade complete"
        );

        Ok(Self {
            handshake,
            state: TransportState::Open,
            limits,
            sink,
            stream,
        })
    }

    async fn next_inbound(&mut self) -> TransportResult<Inbound> {
        loop {
            let Some(message) = self.stream.next().await else {
                self.state = TransportState::Closed;
                return Err(TransportError::Closed);
            };
            let message = message.map_err(|e| {
                let err = TransportError::from(e);
                if !matches!(err, TransportError::MessageTooLarge { .. }) {
                    self.state = TransportState::Closed;
                }
                err
            })?;

            let size = ws_message_size(&message);
            if size > self.limits.max_message_size {
                return Err(TransportError::MessageTooLarge {
                    size,
                    limit: self.limits.max_message_size,
                });
            }

            match message {
                WsMessage::Text(text) => return Ok(Inbound::Text(text)),
                WsMessage::Binary(data) => return Ok(Inbound::Binary(data)),
                WsMessage::Close(frame) => {
                    self.state = TransportState::Closing;
                    return Ok(Inbound::Close(frame.map(|f| CloseInfo {
                        code: u16::from(f.code),
                        reason: f.reason.to_string(),
                    })));
                }
                // control frames are answered by tungstenite
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    }
}

impl ClientConnection for WsConnection {
    fn path(&self) -> &str {
        &self.handshake.path
    }

    fn identity(&self) -> Option<&ClientIdentity> {
        self.handshake.identity.as_ref()
    }

    fn requested_protocols(&self) -> Option<&str> {
        self.handshake.requested_protocols.as_deref()
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn response_started(&self) -> bool {
        true
    }

    fn open<'a>(&'a mut self, subprotocol: &'a str) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            if self.state != TransportState::Open {
                return Err(TransportError::InvalidState(self.state));
            }
            match self.handshake.negotiated {
                Some(actual) if actual != subprotocol => Err(TransportError::ProtocolMismatch {
                    expected: subprotocol.to_string(),
                    actual: actual.to_string(),
                }),
                _ => Ok(()),
            }
        })
    }

    fn send(&mut self, text: String) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if self.state != TransportState::Open {
                return Err(TransportError::InvalidState(self.state));
            }
            self.sink.send(WsMessage::Text(text)).await?;
            Ok(())
        })
    }

    fn receive(&mut self) -> BoxFuture<'_, TransportResult<Inbound>> {
        Box::pin(self.next_inbound())
    }

    fn close<'a>(
        &'a mut self,
        status: CloseStatus,
        reason: &'a str,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            if self.state == TransportState::Closed {
                return Ok(());
            }
            let frame = CloseFrame {
                code: CloseCode::from(status.code()),
                reason: reason.to_string().into(),
            };
            let result = self.sink.send(WsMessage::Close(Some(frame))).await;
            self.state = TransportState::Closed;
            match result {
                Ok(()) | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn write_response<'a>(
        &'a mut self,
        _status: u16,
        _message: &'a str,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async { Err(TransportError::ResponseStarted) })
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("path", &self.handshake.path)
            .field("protocol", &self.handshake.negotiated)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
