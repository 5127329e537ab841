//! Close statuses shared by the gateway and the session.

use std::fmt;

/// Why a connection was (or is being) closed.
///
/// Each status maps to a WebSocket close code, used when a transport is
/// open, and to an HTTP status, used when the failure happens before the
/// upgrade completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseStatus {
    /// Normal closure.
    Normal,
    /// Server is shutting down.
    GoingAway,
    /// Client broke the sub-protocol rules or none could be negotiated.
    ProtocolError,
    /// Server policy ended the connection (e.g. revoked credentials).
    PolicyViolation,
    /// Unhandled server fault.
    InternalError,
    /// Client registry is full.
    MaxConnections,
    /// Endpoint requires an authenticated client.
    Unauthorized,
    /// Client never sent its init message.
    InitTimeout,
    /// Client sent a second init message.
    TooManyInitRequests,
}

impl CloseStatus {
    /// WebSocket close code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::PolicyViolation => 1008,
            Self::InternalError => 1011,
            Self::MaxConnections => 1013,
            Self::Unauthorized => 4401,
            Self::InitTimeout => 4408,
            Self::TooManyInitRequests => 4429,
        }
    }

    /// HTTP status written when no transport was formed.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Normal => 200,
            Self::ProtocolError | Self::TooManyInitRequests => 400,
            Self::Unauthorized => 401,
            Self::PolicyViolation => 403,
            Self::InitTimeout => 408,
            Self::InternalError => 500,
            Self::GoingAway | Self::MaxConnections => 503,
        }
    }

    /// Check if the status signals a failure.
    #[must_use]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Normal | Self::GoingAway)
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::GoingAway => "going away",
            Self::ProtocolError => "protocol error",
            Self::PolicyViolation => "policy violation",
            Self::InternalError => "internal error",
            Self::MaxConnections => "max connections",
            Self::Unauthorized => "unauthorized",
            Self::InitTimeout => "init timeout",
            Self::TooManyInitRequests => "too many init requests",
        };
        write!(f, "{name} ({})", self.code())
    }
}
