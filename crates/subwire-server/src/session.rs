//! Per-connection subscription session.
//!
//! A [`ClientSession`] owns one transport and drives it through
//! `Connecting -> Open -> Closing -> Closed`. All message processing for a
//! connection happens sequentially inside [`ClientSession::run`]; events
//! reach it through the bounded channel behind its [`ClientHandle`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use subwire_proto::{
    ClientId, ClientIdentity, ClientMessage, CloseStatus, EventName, OperationRequest, Route,
    ServerMessage, SubProtocol, SubscriptionEvent,
};
use subwire_router::EventRouter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::engine::{EngineError, OperationKind, QueryEngine, ResolveRequest};
use crate::transport::{ClientConnection, Inbound, TransportError, TransportState};

/// Message shown to clients in place of internal error details.
pub const MASKED_ERROR_MESSAGE: &str = "internal server error";

/// State of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the protocol init message.
    Connecting,
    /// Init acknowledged; operations are accepted.
    Open,
    /// Tearing down.
    Closing,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Check if the session still processes messages.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// Errors that can occur in a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is closed and cannot process anything.
    #[error("session is closed")]
    Closed,

    /// Session could not be constructed.
    #[error("session construction failed: {0}")]
    Construction(String),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] subwire_proto::ProtoError),

    /// The query engine failed internally.
    #[error("engine fault: {0}")]
    Engine(String),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// What processing one client message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Init handshake accepted.
    Acknowledged,
    /// A subscription was registered under this id.
    SubscriptionAdded(String),
    /// The subscription with this id was removed.
    SubscriptionRemoved(String),
    /// A one-shot operation ran to completion.
    Executed(String),
    /// A recoverable error was reported inline.
    Rejected,
    /// A ping was answered.
    Answered,
    /// Nothing to do.
    Ignored,
    /// The message ended the session.
    Closing(CloseStatus),
}

/// Settings and collaborators shared by every session of a server.
#[derive(Clone)]
pub struct SessionContext {
    /// Server-wide event router.
    pub router: Arc<EventRouter>,
    /// Query engine.
    pub engine: Arc<dyn QueryEngine>,
    /// Schema name, prefix of every event name.
    pub schema_name: String,
    /// Keep-alive interval; `None` disables keep-alive.
    pub keep_alive_interval: Option<Duration>,
    /// Time allowed for the init handshake.
    pub init_timeout: Duration,
    /// Per-client event buffer size.
    pub client_buffer_size: usize,
    /// Show internal error messages to clients.
    pub expose_exceptions: bool,
}

impl SessionContext {
    /// Build a context from server configuration.
    #[must_use]
    pub fn from_config(
        config: &ServerConfig,
        router: Arc<EventRouter>,
        engine: Arc<dyn QueryEngine>,
    ) -> Self {
        Self {
            router,
            engine,
            schema_name: config.schema_name.clone(),
            keep_alive_interval: config.keep_alive_interval,
            init_timeout: config.init_timeout,
            client_buffer_size: config.client_buffer_size,
            expose_exceptions: config.expose_exceptions,
        }
    }

    /// Check that sessions can be built from this context.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Construction`] describing the first problem.
    pub fn validate(&self) -> SessionResult<()> {
        if self.client_buffer_size == 0 {
            return Err(SessionError::Construction(
                "client buffer size must be positive".to_string(),
            ));
        }
        if self.schema_name.trim().is_empty() {
            return Err(SessionError::Construction("schema name is empty".to_string()));
        }
        if self.keep_alive_interval.is_some_and(|period| period.is_zero()) {
            return Err(SessionError::Construction(
                "keep-alive interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("schema_name", &self.schema_name)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("init_timeout", &self.init_timeout)
            .field("client_buffer_size", &self.client_buffer_size)
            .field("expose_exceptions", &self.expose_exceptions)
            .finish_non_exhaustive()
    }
}

/// Registry entry for a running session.
///
/// Cheap to clone; used to deliver events and to request a close from
/// outside the session task.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    protocol: &'static str,
    identity: Option<ClientIdentity>,
    connected_at: DateTime<Utc>,
    events: mpsc::Sender<Arc<SubscriptionEvent>>,
    close_request: Arc<Mutex<Option<(CloseStatus, String)>>>,
    cancel: CancellationToken,
}

impl ClientHandle {
    /// Client id.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Negotiated sub-protocol.
    #[must_use]
    pub const fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Authenticated identity, if any.
    #[must_use]
    pub const fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    /// When the client connected.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Hand an event to the session without blocking.
    ///
    /// Returns `false` if the event was dropped because the client's
    /// buffer is full or the session is gone.
    pub fn deliver(&self, event: Arc<SubscriptionEvent>) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(client_id = %self.id, event = %event.name, "Client buffer full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client_id = %self.id, "Session closed, dropping event");
                false
            }
        }
    }

    /// Ask the session to close with `status`. The first request wins.
    pub fn request_close(&self, status: CloseStatus, reason: impl Into<String>) {
        {
            let mut request = self.close_request.lock();
            if request.is_none() {
                *request = Some((status, reason.into()));
            }
        }
        self.cancel.cancel();
    }

    /// Check if a close has been requested.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone)]
struct ActiveSubscription {
    route: Route,
    event_name: EventName,
    request: OperationRequest,
}

/// Server side of one subscription client.
pub struct ClientSession {
    id: ClientId,
    protocol: Arc<dyn SubProtocol>,
    state: SessionState,
    connection: Box<dyn ClientConnection>,
    subscriptions: HashMap<String, ActiveSubscription>,
    context: Arc<SessionContext>,
    events: mpsc::Receiver<Arc<SubscriptionEvent>>,
    close_request: Arc<Mutex<Option<(CloseStatus, String)>>>,
    cancel: CancellationToken,
    keep_alive: Option<Interval>,
    close_status: Option<CloseStatus>,
    reached_open: bool,
}

impl ClientSession {
    /// Create a session in `Connecting` state and the handle to register.
    ///
    /// `cancel` closes the session with `GoingAway` unless a close was
    /// requested through the handle first.
    #[must_use]
    pub fn new(
        id: ClientId,
        protocol: Arc<dyn SubProtocol>,
        connection: Box<dyn ClientConnection>,
        context: Arc<SessionContext>,
        cancel: CancellationToken,
    ) -> (Self, ClientHandle) {
        let (events_tx, events_rx) = mpsc::channel(context.client_buffer_size.max(1));
        let close_request = Arc::new(Mutex::new(None));

        let handle = ClientHandle {
            id,
            protocol: protocol.name(),
            identity: connection.identity().cloned(),
            connected_at: Utc::now(),
            events: events_tx,
            close_request: Arc::clone(&close_request),
            cancel: cancel.clone(),
        };

        let session = Self {
            id,
            protocol,
            state: SessionState::Connecting,
            connection,
            subscriptions: HashMap::new(),
            context,
            events: events_rx,
            close_request,
            cancel,
            keep_alive: None,
            close_status: None,
            reached_open: false,
        };

        (session, handle)
    }

    /// Client id.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Negotiated sub-protocol.
    #[must_use]
    pub fn protocol(&self) -> &dyn SubProtocol {
        self.protocol.as_ref()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the init handshake ever completed.
    #[must_use]
    pub const fn reached_open(&self) -> bool {
        self.reached_open
    }

    /// Status the session closed with, once closing.
    #[must_use]
    pub const fn close_status(&self) -> Option<CloseStatus> {
        self.close_status
    }

    /// Ids of active subscriptions.
    #[must_use]
    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// The underlying transport.
    pub fn connection_mut(&mut self) -> &mut dyn ClientConnection {
        self.connection.as_mut()
    }

    /// Open the transport and process messages until the session closes.
    ///
    /// Returns the status the session closed with.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport could not be opened; the session
    /// is `Closed` afterwards either way.
    pub async fn run(&mut self) -> SessionResult<CloseStatus> {
        if let Err(e) = self.connection.open(self.protocol.name()).await {
            warn!(client_id = %self.id, error = %e, "Failed to open transport");
            self.state = SessionState::Closed;
            self.close_status = Some(CloseStatus::InternalError);
            return Err(e.into());
        }

        info!(client_id = %self.id, protocol = self.protocol.name(), "Session started");
        let init_deadline = Instant::now() + self.context.init_timeout;

        while self.state != SessionState::Closed {
            let connecting = self.state == SessionState::Connecting;
            let open = self.state == SessionState::Open;

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    let (status, reason) = self
                        .close_request
                        .lock()
                        .take()
                        .unwrap_or_else(|| (CloseStatus::GoingAway, "server shutting down".to_string()));
                    self.close(status, &reason).await;
                }
                () = tokio::time::sleep_until(init_deadline), if connecting => {
                    warn!(client_id = %self.id, "Client did not initialise in time");
                    self.close(CloseStatus::InitTimeout, "connection initialisation timeout").await;
                }
                inbound = self.connection.receive() => {
                    self.handle_inbound(inbound).await;
                }
                Some(event) = self.events.recv(), if open => {
                    if let Err(e) = self.receive_event(&event).await {
                        self.fail(&e).await;
                    }
                }
                () = next_tick(&mut self.keep_alive), if open => {
                    let keep_alive = self.protocol.keep_alive();
                    if let Err(e) = self.send(&keep_alive).await {
                        self.fail(&e).await;
                    }
                }
            }
        }

        let status = self.close_status.unwrap_or(CloseStatus::Normal);
        info!(client_id = %self.id, status = %status, "Session ended");
        Ok(status)
    }

    async fn handle_inbound(&mut self, inbound: Result<Inbound, TransportError>) {
        let text = match inbound {
            Ok(Inbound::Text(text)) => text,
            Ok(Inbound::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    self.reject_frame("binary message is not valid UTF-8").await;
                    return;
                }
            },
            Ok(Inbound::Close(info)) => {
                debug!(client_id = %self.id, close = ?info, "Client closed transport");
                self.close(CloseStatus::Normal, "client closed").await;
                return;
            }
            Err(TransportError::Closed) => {
                self.close(CloseStatus::Normal, "transport closed").await;
                return;
            }
            Err(e @ TransportError::MessageTooLarge { .. }) => {
                warn!(client_id = %self.id, error = %e, "Inbound message too large");
                self.close(CloseStatus::PolicyViolation, "message too large").await;
                return;
            }
            Err(e) => {
                warn!(client_id = %self.id, error = %e, "Transport read failed");
                self.close(CloseStatus::InternalError, MASKED_ERROR_MESSAGE).await;
                return;
            }
        };

        let message = match self.protocol.decode(&text) {
            Ok(message) => message,
            Err(e) => {
                debug!(client_id = %self.id, error = %e, "Malformed client message");
                self.reject_frame(&e.to_string()).await;
                return;
            }
        };

        match self.process_message(message).await {
            Ok(outcome) => debug!(client_id = %self.id, outcome = ?outcome, "Message processed"),
            Err(e) => self.fail(&e).await,
        }
    }

    /// Report an undecodable frame: a protocol violation before init,
    /// recoverable afterwards.
    async fn reject_frame(&mut self, message: &str) {
        let sent = self.send(&ServerMessage::connection_error(message)).await;
        if self.state == SessionState::Connecting {
            if let Err(e) = sent {
                debug!(client_id = %self.id, error = %e, "Could not report invalid frame");
            }
            self.close(CloseStatus::ProtocolError, "invalid message before initialisation")
                .await;
        } else if let Err(e) = sent {
            self.fail(&e).await;
        }
    }

    /// Process one decoded client message.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] once the session is closing or
    /// closed, and transport/encoding/engine faults, which are fatal.
    pub async fn process_message(&mut self, message: ClientMessage) -> SessionResult<MessageOutcome> {
        if !self.state.is_active() {
            return Err(SessionError::Closed);
        }

        debug!(client_id = %self.id, kind = message.kind(), "Processing client message");

        if self.state == SessionState::Connecting && !message.is_init() {
            let error = ServerMessage::connection_error(format!(
                "expected connection_init, got {}",
                message.kind()
            ));
            if let Err(e) = self.send(&error).await {
                debug!(client_id = %self.id, error = %e, "Could not report pre-init violation");
            }
            self.close(CloseStatus::ProtocolError, "connection not initialised").await;
            return Ok(MessageOutcome::Closing(CloseStatus::ProtocolError));
        }

        match message {
            ClientMessage::ConnectionInit { .. } => self.handle_init().await,
            ClientMessage::Subscribe { id, payload } => self.handle_subscribe(id, payload).await,
            ClientMessage::Unsubscribe { id } => self.handle_unsubscribe(id).await,
            ClientMessage::Ping { payload } => {
                self.send(&ServerMessage::Pong { payload }).await?;
                Ok(MessageOutcome::Answered)
            }
            ClientMessage::Pong => Ok(MessageOutcome::Ignored),
            ClientMessage::Terminate => {
                self.close(CloseStatus::Normal, "client terminated").await;
                Ok(MessageOutcome::Closing(CloseStatus::Normal))
            }
        }
    }

    async fn handle_init(&mut self) -> SessionResult<MessageOutcome> {
        if self.state == SessionState::Open {
            if self.protocol.repeated_init_is_fatal() {
                self.close(CloseStatus::TooManyInitRequests, "too many initialisation requests")
                    .await;
                return Ok(MessageOutcome::Closing(CloseStatus::TooManyInitRequests));
            }
            self.send(&ServerMessage::connection_error("connection already initialised"))
                .await?;
            return Ok(MessageOutcome::Rejected);
        }

        self.send(&ServerMessage::ConnectionAck).await?;
        self.state = SessionState::Open;
        self.reached_open = true;

        // A zero period never reaches tokio's interval.
        let keep_alive_interval = self
            .context
            .keep_alive_interval
            .filter(|period| !period.is_zero());
        if let Some(period) = keep_alive_interval {
            if self.protocol.keep_alive_after_ack() {
                let keep_alive = self.protocol.keep_alive();
                self.send(&keep_alive).await?;
            }
            self.keep_alive = Some(tokio::time::interval_at(Instant::now() + period, period));
        }

        info!(client_id = %self.id, "Session initialised");
        Ok(MessageOutcome::Acknowledged)
    }

    async fn handle_subscribe(
        &mut self,
        id: String,
        request: OperationRequest,
    ) -> SessionResult<MessageOutcome> {
        if self.subscriptions.contains_key(&id) {
            self.send(&ServerMessage::operation_error(
                &id,
                format!("subscriber for {id} already exists"),
            ))
            .await?;
            return Ok(MessageOutcome::Rejected);
        }

        let engine = Arc::clone(&self.context.engine);
        let resolution = match engine.resolve(ResolveRequest::new(&request)).await {
            Ok(resolution) => resolution,
            Err(e) => return self.engine_failure(&id, e).await,
        };

        if resolution.kind != OperationKind::Subscription {
            self.send(&ServerMessage::Data {
                id: id.clone(),
                payload: resolution.payload,
            })
            .await?;
            self.send(&ServerMessage::Complete { id: id.clone() }).await?;
            return Ok(MessageOutcome::Executed(id));
        }

        let route = match resolution.route {
            Some(route) if !resolution.payload.has_errors() => route,
            _ => {
                let message = resolution
                    .payload
                    .errors
                    .first()
                    .map_or_else(|| "subscription has no route".to_string(), |e| e.message.clone());
                self.send(&ServerMessage::operation_error(&id, message)).await?;
                return Ok(MessageOutcome::Rejected);
            }
        };

        let event_name = EventName::for_route(&self.context.schema_name, &route);
        self.context.router.subscribe(self.id, event_name.clone());
        debug!(client_id = %self.id, subscription_id = %id, event = %event_name, "Subscription added");
        self.subscriptions.insert(
            id.clone(),
            ActiveSubscription {
                route,
                event_name,
                request,
            },
        );

        Ok(MessageOutcome::SubscriptionAdded(id))
    }

    async fn handle_unsubscribe(&mut self, id: String) -> SessionResult<MessageOutcome> {
        let Some(removed) = self.subscriptions.remove(&id) else {
            self.send(&ServerMessage::operation_error(
                &id,
                format!("no active subscription with id {id}"),
            ))
            .await?;
            return Ok(MessageOutcome::Rejected);
        };

        let still_listening = self
            .subscriptions
            .values()
            .any(|sub| sub.event_name == removed.event_name);
        if !still_listening {
            self.context.router.unsubscribe(self.id, &removed.event_name);
        }
        debug!(client_id = %self.id, subscription_id = %id, event = %removed.event_name, "Subscription removed");

        if self.protocol.completes_on_unsubscribe() {
            self.send(&ServerMessage::Complete { id: id.clone() }).await?;
        }

        Ok(MessageOutcome::SubscriptionRemoved(id))
    }

    /// Push an event to every local subscription listening to it.
    ///
    /// Returns the number of data messages sent; zero matches is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] once closed, and fatal transport or
    /// engine faults.
    pub async fn receive_event(&mut self, event: &SubscriptionEvent) -> SessionResult<usize> {
        if !self.state.is_active() {
            return Err(SessionError::Closed);
        }

        let matching: Vec<(String, ActiveSubscription)> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.event_name == event.name)
            .map(|(id, sub)| (id.clone(), sub.clone()))
            .collect();

        let engine = Arc::clone(&self.context.engine);
        let mut sent = 0;
        for (id, sub) in matching {
            let request = ResolveRequest::for_event(&sub.route, &sub.request, &event.payload);
            match engine.resolve(request).await {
                Ok(resolution) => {
                    self.send(&ServerMessage::Data {
                        id,
                        payload: resolution.payload,
                    })
                    .await?;
                    sent += 1;
                }
                Err(e) => {
                    self.engine_failure(&id, e).await?;
                }
            }
        }

        debug!(client_id = %self.id, event = %event.name, sent = sent, "Event delivered");
        Ok(sent)
    }

    /// Report an engine error for `id`. Rejections are recoverable, faults
    /// are not.
    async fn engine_failure(&mut self, id: &str, err: EngineError) -> SessionResult<MessageOutcome> {
        match err {
            EngineError::Rejected(message) => {
                self.send(&ServerMessage::operation_error(id, message)).await?;
                Ok(MessageOutcome::Rejected)
            }
            EngineError::Fault(detail) => {
                let message = self.client_visible(&detail);
                self.send(&ServerMessage::operation_error(id, message)).await?;
                Err(SessionError::Engine(detail))
            }
        }
    }

    fn client_visible(&self, detail: &str) -> String {
        if self.context.expose_exceptions {
            detail.to_string()
        } else {
            MASKED_ERROR_MESSAGE.to_string()
        }
    }

    async fn send(&mut self, message: &ServerMessage) -> SessionResult<()> {
        match self.protocol.encode(message)? {
            Some(text) => self.connection.send(text).await?,
            None => debug!(client_id = %self.id, message = ?message, "Message has no encoding in protocol"),
        }
        Ok(())
    }

    async fn fail(&mut self, err: &SessionError) {
        error!(client_id = %self.id, error = %err, "Session fault");
        let reason = self.client_visible(&err.to_string());
        self.close(CloseStatus::InternalError, &reason).await;
    }

    /// Close the session. Idempotent; every step is best-effort.
    ///
    /// Stops event intake, removes the client from the router, then closes
    /// the transport if it is open.
    pub async fn close(&mut self, status: CloseStatus, reason: &str) {
        if !self.state.is_active() {
            return;
        }

        self.state = SessionState::Closing;
        self.close_status = Some(status);
        self.events.close();
        self.keep_alive = None;

        let removed = self.context.router.unsubscribe_all(self.id);
        self.subscriptions.clear();

        if self.connection.state() == TransportState::Open {
            if let Err(e) = self.connection.close(status, reason).await {
                debug!(client_id = %self.id, error = %e, "Transport close failed");
            }
        }

        self.state = SessionState::Closed;
        info!(
            client_id = %self.id,
            status = %status,
            buckets = removed,
            "Session closed"
        );
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("protocol", &self.protocol.name())
            .field("state", &self.state)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
