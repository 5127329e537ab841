//! End-to-end handling of one incoming connection.

use std::sync::Arc;

use subwire_proto::{ClientId, CloseStatus};
use subwire_router::{ClientRegistry, EventRouter, RegistryError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::negotiator::{NegotiationError, ProtocolNegotiator};
use crate::session::{ClientHandle, ClientSession, SessionContext, SessionError, MASKED_ERROR_MESSAGE};
use crate::transport::{ClientConnection, TransportState};

/// Reasons a connection is turned away or fails.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The endpoint requires an authenticated client.
    #[error("unauthorized")]
    Unauthorized,

    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// No sub-protocol could be agreed on.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The session could not be built.
    #[error("session construction failed: {0}")]
    Construction(String),

    /// The client registry is full.
    #[error("maximum connections reached ({max})")]
    AtCapacity {
        /// Effective client limit.
        max: usize,
    },

    /// The registry refused the client for another reason.
    #[error(transparent)]
    Registry(RegistryError),

    /// The session failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl GatewayError {
    /// Status reported to the client for this error.
    #[must_use]
    pub const fn close_status(&self) -> CloseStatus {
        match self {
            Self::Unauthorized => CloseStatus::Unauthorized,
            Self::ShuttingDown => CloseStatus::GoingAway,
            Self::Negotiation(_) => CloseStatus::ProtocolError,
            Self::AtCapacity { .. } => CloseStatus::MaxConnections,
            Self::Construction(_) | Self::Registry(_) | Self::Session(_) => {
                CloseStatus::InternalError
            }
        }
    }

    /// Whether the message may be shown to the client as is.
    const fn is_client_facing(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::ShuttingDown | Self::Negotiation(_) | Self::AtCapacity { .. }
        )
    }
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AtCapacity { max } => Self::AtCapacity { max },
            other @ RegistryError::AlreadyRegistered(_) => Self::Registry(other),
        }
    }
}

/// Result of [`ConnectionGateway::handle`].
pub enum GatewayOutcome {
    /// Not addressed to this endpoint; the connection is handed back.
    PassThrough(Box<dyn ClientConnection>),
    /// Turned away or failed; the error was already reported.
    Rejected(GatewayError),
    /// The session ran and closed.
    Completed {
        /// Client id the session ran under.
        client_id: ClientId,
        /// Status the session closed with.
        status: CloseStatus,
    },
}

impl std::fmt::Debug for GatewayOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PassThrough(connection) => f
                .debug_tuple("PassThrough")
                .field(&connection.path())
                .finish(),
            Self::Rejected(err) => f.debug_tuple("Rejected").field(err).finish(),
            Self::Completed { client_id, status } => f
                .debug_struct("Completed")
                .field("client_id", client_id)
                .field("status", status)
                .finish(),
        }
    }
}

/// Removes a client from the registry and router when dropped, so cleanup
/// runs however the session exits.
struct Registration<'a> {
    client_id: ClientId,
    registry: &'a ClientRegistry<ClientHandle>,
    router: &'a EventRouter,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.router.unsubscribe_all(self.client_id);
        self.registry.remove(self.client_id);
    }
}

/// Runs connections through the gates in front of a session.
#[derive(Debug)]
pub struct ConnectionGateway {
    route_path: String,
    require_authenticated: bool,
    registry: Arc<ClientRegistry<ClientHandle>>,
    negotiator: ProtocolNegotiator,
    context: Arc<SessionContext>,
    shutdown: CancellationToken,
}

impl ConnectionGateway {
    /// Create a gateway for the endpoint at `route_path`.
    #[must_use]
    pub fn new(
        route_path: impl Into<String>,
        registry: Arc<ClientRegistry<ClientHandle>>,
        negotiator: ProtocolNegotiator,
        context: Arc<SessionContext>,
    ) -> Self {
        Self {
            route_path: route_path.into(),
            require_authenticated: false,
            registry,
            negotiator,
            context,
            shutdown: CancellationToken::new(),
        }
    }

    /// Require an authenticated identity on every connection.
    #[must_use]
    pub const fn with_require_authenticated(mut self, required: bool) -> Self {
        self.require_authenticated = required;
        self
    }

    /// Cancel every session when `shutdown` is cancelled.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The negotiator used for new sessions.
    #[must_use]
    pub const fn negotiator(&self) -> &ProtocolNegotiator {
        &self.negotiator
    }

    /// The client registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry<ClientHandle>> {
        &self.registry
    }

    /// Check if `path` addresses this endpoint.
    ///
    /// The query string, a trailing slash and case are ignored.
    #[must_use]
    pub fn matches_path(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or_default();
        normalize_path(path).eq_ignore_ascii_case(normalize_path(&self.route_path))
    }

    /// Handle one connection until its session closes.
    pub async fn handle(&self, mut connection: Box<dyn ClientConnection>) -> GatewayOutcome {
        if !self.matches_path(connection.path()) {
            debug!(path = connection.path(), "Connection not addressed to subscription endpoint");
            return GatewayOutcome::PassThrough(connection);
        }

        if self.shutdown.is_cancelled() {
            return self.reject(connection.as_mut(), GatewayError::ShuttingDown).await;
        }

        if self.require_authenticated && connection.identity().is_none() {
            return self.reject(connection.as_mut(), GatewayError::Unauthorized).await;
        }

        let protocol = match self.negotiator.negotiate(connection.requested_protocols()) {
            Ok(protocol) => protocol,
            Err(e) => return self.reject(connection.as_mut(), e.into()).await,
        };

        if let Err(e) = self.context.validate() {
            let err = GatewayError::Construction(e.to_string());
            return self.reject(connection.as_mut(), err).await;
        }

        let client_id = ClientId::new();
        let (mut session, handle) = ClientSession::new(
            client_id,
            protocol,
            connection,
            Arc::clone(&self.context),
            self.shutdown.child_token(),
        );

        if let Err(e) = self.registry.try_add(client_id, handle) {
            return self.reject(session.connection_mut(), e.into()).await;
        }

        let registration = Registration {
            client_id,
            registry: &self.registry,
            router: &self.context.router,
        };

        info!(
            client_id = %client_id,
            protocol = session.protocol().name(),
            clients = self.registry.len(),
            "Client connected"
        );

        let outcome = match session.run().await {
            Ok(status) => GatewayOutcome::Completed { client_id, status },
            Err(e) => {
                let err = GatewayError::from(e);
                if !session.reached_open() {
                    self.report(session.connection_mut(), &err).await;
                }
                GatewayOutcome::Rejected(err)
            }
        };

        drop(registration);
        drop(session);
        info!(client_id = %client_id, clients = self.registry.len(), "Client disconnected");
        outcome
    }

    async fn reject(&self, connection: &mut dyn ClientConnection, err: GatewayError) -> GatewayOutcome {
        warn!(path = connection.path(), error = %err, "Connection rejected");
        self.report(connection, &err).await;
        GatewayOutcome::Rejected(err)
    }

    /// Report `err` on exactly one channel: close an open transport, else
    /// write a raw response if none started, else only log.
    async fn report(&self, connection: &mut dyn ClientConnection, err: &GatewayError) {
        let status = err.close_status();
        let message = if err.is_client_facing() || self.context.expose_exceptions {
            err.to_string()
        } else {
            MASKED_ERROR_MESSAGE.to_string()
        };

        if connection.state() == TransportState::Open {
            if let Err(e) = connection.close(status, &message).await {
                debug!(error = %e, "Failed to close transport");
            }
        } else if !connection.response_started() {
            if let Err(e) = connection.write_response(status.http_status(), &message).await {
                debug!(error = %e, "Failed to write response");
            }
        } else {
            warn!(status = %status, error = %err, "No channel left to report connection error");
        }
    }
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}
