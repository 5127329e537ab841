//! Abstract client transport.
//!
//! The session and gateway only talk to a [`ClientConnection`]; the
//! WebSocket adapter in [`crate::ws`] is one implementation, tests use an
//! in-memory one.

use futures::future::BoxFuture;
use subwire_proto::{ClientIdentity, CloseStatus};
use thiserror::Error;

/// Lifecycle of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Upgrade not yet performed.
    Connecting,
    /// Messages can flow both ways.
    Open,
    /// A close handshake is in progress.
    Closing,
    /// Transport is gone.
    Closed,
}

/// Close frame details sent by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

/// One full inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
    /// Peer closed the transport.
    Close(Option<CloseInfo>),
}

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transport is closed.
    #[error("transport is closed")]
    Closed,

    /// Operation requires a different transport state.
    #[error("invalid transport state: {0:?}")]
    InvalidState(TransportState),

    /// The transport was upgraded with a different sub-protocol.
    #[error("sub-protocol mismatch: expected {expected}, opened with {actual}")]
    ProtocolMismatch {
        /// Protocol the session asked for.
        expected: String,
        /// Protocol the transport negotiated.
        actual: String,
    },

    /// Inbound message exceeds the configured limit.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Message size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// A raw response was already written.
    #[error("response already started")]
    ResponseStarted,

    /// I/O or framing failure.
    #[error("transport i/o error: {0}")]
    Io(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::error::CapacityError;
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                Self::MessageTooLarge {
                    size,
                    limit: max_size,
                }
            }
            other => Self::Io(other.to_string()),
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional message channel to one client.
pub trait ClientConnection: Send + 'static {
    /// Request path the client connected to.
    fn path(&self) -> &str;

    /// Authenticated identity, if the transport established one.
    fn identity(&self) -> Option<&ClientIdentity>;

    /// Raw requested sub-protocol list, e.g. `"graphql-transport-ws, graphql-ws"`.
    fn requested_protocols(&self) -> Option<&str>;

    /// Current transport state.
    fn state(&self) -> TransportState;

    /// Whether a raw response (status line) has already been written.
    fn response_started(&self) -> bool;

    /// Open the transport with `subprotocol`.
    fn open<'a>(&'a mut self, subprotocol: &'a str) -> BoxFuture<'a, TransportResult<()>>;

    /// Send one full text message.
    fn send(&mut self, text: String) -> BoxFuture<'_, TransportResult<()>>;

    /// Receive one full message.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses
    /// no message.
    fn receive(&mut self) -> BoxFuture<'_, TransportResult<Inbound>>;

    /// Close an open transport.
    fn close<'a>(
        &'a mut self,
        status: CloseStatus,
        reason: &'a str,
    ) -> BoxFuture<'a, TransportResult<()>>;

    /// Write a plain status response when no transport was formed.
    fn write_response<'a>(
        &'a mut self,
        status: u16,
        message: &'a str,
    ) -> BoxFuture<'a, TransportResult<()>>;
}
