//! Error types for the subwire-proto crate.

use thiserror::Error;

/// Errors that can occur while decoding or encoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a message.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Message type is not part of the negotiated sub-protocol.
    #[error("unsupported message type '{message_type}' for {protocol}")]
    UnsupportedMessage {
        /// Sub-protocol that rejected the message.
        protocol: &'static str,
        /// The offending `type` field.
        message_type: String,
    },

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;
