//! Subscription server wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use subwire_proto::{ClientId, CloseStatus, EventName, SubscriptionEvent};
use subwire_router::{
    ChannelDispatchQueue, ClientRegistry, DispatchItem, DrainReport, EventRouter, EventSink,
    RouterError,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, WebSocketConfig};
use crate::engine::QueryEngine;
use crate::error::{ServerError, ServerResult};
use crate::gateway::{ConnectionGateway, GatewayOutcome};
use crate::negotiator::ProtocolNegotiator;
use crate::session::{ClientHandle, SessionContext};
use crate::ws::WsConnection;

/// Delivers dispatched events to the session behind each registry entry.
#[derive(Debug)]
pub struct RegistrySink {
    registry: Arc<ClientRegistry<ClientHandle>>,
}

impl RegistrySink {
    /// Create a sink over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<ClientRegistry<ClientHandle>>) -> Self {
        Self { registry }
    }
}

impl EventSink for RegistrySink {
    fn deliver(&self, item: DispatchItem) {
        match self.registry.try_get(item.client_id) {
            Some(handle) => {
                handle.deliver(item.event);
            }
            None => {
                debug!(client_id = %item.client_id, "Client gone, dropping event");
            }
        }
    }
}

/// Publishes events for one schema.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    router: Arc<EventRouter>,
    schema_name: String,
}

impl EventPublisher {
    /// Create a publisher for `schema_name`.
    #[must_use]
    pub fn new(router: Arc<EventRouter>, schema_name: impl Into<String>) -> Self {
        Self {
            router,
            schema_name: schema_name.into(),
        }
    }

    /// Publish `payload` to subscribers of `route`.
    ///
    /// Returns the number of clients the event was dispatched to.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ShutDown`] once the server is shutting down.
    pub fn publish(&self, route: &str, payload: Value) -> Result<usize, RouterError> {
        let name = EventName::new(&self.schema_name, route);
        self.router.publish(SubscriptionEvent::new(name, payload))
    }

    /// Publish a prebuilt event.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ShutDown`] once the server is shutting down.
    pub fn publish_event(&self, event: SubscriptionEvent) -> Result<usize, RouterError> {
        self.router.publish(event)
    }
}

/// GraphQL subscription server.
///
/// Owns the server-wide registry, router and dispatch queue and accepts
/// WebSocket connections through a [`ConnectionGateway`].
#[derive(Debug)]
pub struct SubscriptionServer {
    config: ServerConfig,
    registry: Arc<ClientRegistry<ClientHandle>>,
    router: Arc<EventRouter>,
    gateway: Arc<ConnectionGateway>,
    accepting: CancellationToken,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SubscriptionServer {
    /// Build a server from `config` around `engine`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(config: ServerConfig, engine: Arc<dyn QueryEngine>) -> Self {
        let registry = Arc::new(ClientRegistry::from_configured(config.max_connected_clients));
        let sink = Arc::new(RegistrySink::new(Arc::clone(&registry)));
        let queue = Arc::new(ChannelDispatchQueue::spawn(sink));
        let router = Arc::new(EventRouter::new(queue));

        let context = Arc::new(SessionContext::from_config(&config, Arc::clone(&router), engine));
        let shutdown = CancellationToken::new();
        let gateway = ConnectionGateway::new(
            config.route_path.clone(),
            Arc::clone(&registry),
            ProtocolNegotiator::from_config(&config),
            context,
        )
        .with_require_authenticated(config.require_authenticated)
        .with_shutdown(shutdown.clone());

        Self {
            config,
            registry,
            router,
            gateway: Arc::new(gateway),
            accepting: CancellationToken::new(),
            shutdown,
            tasks: TaskTracker::new(),
        }
    }

    /// Server configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The connection gateway.
    #[must_use]
    pub fn gateway(&self) -> Arc<ConnectionGateway> {
        Arc::clone(&self.gateway)
    }

    /// The event router.
    #[must_use]
    pub const fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// A publisher for this server's schema.
    #[must_use]
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(Arc::clone(&self.router), self.config.schema_name.clone())
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Handles of all connected clients.
    #[must_use]
    pub fn connected_clients(&self) -> Vec<ClientHandle> {
        self.registry.handles()
    }

    /// Ask one client's session to close with `status`.
    ///
    /// Returns `false` if the client is not connected.
    pub fn disconnect(&self, client_id: ClientId, status: CloseStatus, reason: &str) -> bool {
        match self.registry.try_get(client_id) {
            Some(handle) => {
                info!(client_id = %client_id, status = %status, reason = reason, "Disconnecting client");
                handle.request_close(status, reason);
                true
            }
            None => false,
        }
    }

    /// Bind to the configured address and serve until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn serve(&self) -> ServerResult<()> {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;
        self.serve_listener(listener).await
    }

    /// Serve connections from `listener` until shut down.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ShutDown`] if the server was already shut down.
    pub async fn serve_listener(&self, listener: TcpListener) -> ServerResult<()> {
        if self.accepting.is_cancelled() {
            return Err(ServerError::ShutDown);
        }

        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, path = %self.config.route_path, "Subscription server listening");
        }

        loop {
            tokio::select! {
                () = self.accepting.cancelled() => {
                    info!("Accept loop stopped");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = Arc::clone(&self.gateway);
                        let limits = self.config.websocket;
                        self.tasks.spawn(handle_stream(gateway, stream, peer, limits));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        Ok(())
    }

    /// Shut the server down.
    ///
    /// Stops accepting connections and publishes, drains queued events
    /// within the configured drain policy, then closes every session with
    /// `GoingAway` and waits (bounded by the same ceiling) for them to end.
    pub async fn shutdown(&self) -> DrainReport {
        info!(clients = self.client_count(), "Subscription server shutting down");
        self.accepting.cancel();

        let report = self.router.shutdown(self.config.drain).await;

        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(self.config.drain.ceiling, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tasks.len(),
                "Sessions still running after shutdown ceiling"
            );
        }

        report
    }
}

async fn handle_stream(
    gateway: Arc<ConnectionGateway>,
    stream: TcpStream,
    peer: SocketAddr,
    limits: WebSocketConfig,
) {
    let connection = match WsConnection::accept(stream, gateway.negotiator(), limits).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    match gateway.handle(Box::new(connection)).await {
        GatewayOutcome::PassThrough(mut connection) => {
            debug!(peer = %peer, path = connection.path(), "No endpoint for path");
            if let Err(e) = connection
                .close(CloseStatus::PolicyViolation, "unknown endpoint")
                .await
            {
                debug!(peer = %peer, error = %e, "Failed to close unrouted connection");
            }
        }
        GatewayOutcome::Rejected(err) => {
            debug!(peer = %peer, error = %err, "Connection ended with error");
        }
        GatewayOutcome::Completed { client_id, status } => {
            debug!(peer = %peer, client_id = %client_id, status = %status, "Connection completed");
        }
    }
}
