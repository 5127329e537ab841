//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use subwire_router::DrainPolicy;

/// Default maximum WebSocket message size: 1MB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default maximum WebSocket frame size: 64KB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default endpoint path.
pub const DEFAULT_ROUTE_PATH: &str = "/graphql";

/// Default schema name, used as the event name prefix.
pub const DEFAULT_SCHEMA_NAME: &str = "graphql";

/// Default sub-protocol when the client states no preference.
pub const DEFAULT_PROTOCOL: &str = "graphql-transport-ws";

/// Default time a client has to send its init message.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of events buffered per client before drops.
pub const DEFAULT_CLIENT_BUFFER_SIZE: usize = 64;

/// Configuration for WebSocket frame limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Maximum allowed message size in bytes.
    pub max_message_size: usize,
    /// Maximum allowed frame size in bytes.
    pub max_frame_size: usize,
}

impl WebSocketConfig {
    /// Create a WebSocket configuration with default limits.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the subscription server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the listener to.
    pub bind_addr: SocketAddr,
    /// Path the subscription endpoint answers on.
    pub route_path: String,
    /// Schema name; prefixes every event name.
    pub schema_name: String,
    /// Maximum connected clients. `None` is unbounded, negative means zero.
    pub max_connected_clients: Option<i64>,
    /// Protocol used when the client states no preference.
    pub default_protocol: String,
    /// If set, only these protocols may be negotiated.
    pub allowed_protocols: Option<Vec<String>>,
    /// Reject connections that carry no authenticated identity.
    pub require_authenticated: bool,
    /// Interval between keep-alive messages. `None` disables keep-alive.
    pub keep_alive_interval: Option<Duration>,
    /// Time a client has to complete the init handshake.
    pub init_timeout: Duration,
    /// Per-client event buffer; events beyond it are dropped.
    pub client_buffer_size: usize,
    /// Send internal error messages to clients verbatim.
    pub expose_exceptions: bool,
    /// How long shutdown waits for queued events.
    pub drain: DrainPolicy,
    /// WebSocket frame limits.
    pub websocket: WebSocketConfig,
}

impl ServerConfig {
    /// Create a configuration with defaults, bound to `bind_addr`.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            route_path: DEFAULT_ROUTE_PATH.to_string(),
            schema_name: DEFAULT_SCHEMA_NAME.to_string(),
            max_connected_clients: None,
            default_protocol: DEFAULT_PROTOCOL.to_string(),
            allowed_protocols: None,
            require_authenticated: false,
            keep_alive_interval: None,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            client_buffer_size: DEFAULT_CLIENT_BUFFER_SIZE,
            expose_exceptions: false,
            drain: DrainPolicy::default(),
            websocket: WebSocketConfig::new(),
        }
    }

    /// Set the listen address.
    #[must_use]
    pub const fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the endpoint path.
    #[must_use]
    pub fn with_route_path(mut self, path: impl Into<String>) -> Self {
        self.route_path = path.into();
        self
    }

    /// Set the schema name.
    #[must_use]
    pub fn with_schema_name(mut self, name: impl Into<String>) -> Self {
        self.schema_name = name.into();
        self
    }

    /// Set the maximum number of connected clients.
    #[must_use]
    pub const fn with_max_connected_clients(mut self, max: i64) -> Self {
        self.max_connected_clients = Some(max);
        self
    }

    /// Set the default protocol.
    #[must_use]
    pub fn with_default_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.default_protocol = protocol.into();
        self
    }

    /// Restrict negotiation to `protocols`.
    #[must_use]
    pub fn with_allowed_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_protocols = Some(protocols.into_iter().map(Into::into).collect());
        self
    }

    /// Require an authenticated identity on every connection.
    #[must_use]
    pub const fn with_require_authenticated(mut self, required: bool) -> Self {
        self.require_authenticated = required;
        self
    }

    /// Enable keep-alive at `interval`.
    #[must_use]
    pub const fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Set the init handshake timeout.
    #[must_use]
    pub const fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Set the per-client event buffer size.
    #[must_use]
    pub const fn with_client_buffer_size(mut self, size: usize) -> Self {
        self.client_buffer_size = size;
        self
    }

    /// Send internal error messages to clients verbatim.
    #[must_use]
    pub const fn with_expose_exceptions(mut self, expose: bool) -> Self {
        self.expose_exceptions = expose;
        self
    }

    /// Set the shutdown drain policy.
    #[must_use]
    pub const fn with_drain_policy(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    /// Set the WebSocket configuration.
    #[must_use]
    pub const fn with_websocket_config(mut self, config: WebSocketConfig) -> Self {
        self.websocket = config;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(([0, 0, 0, 0], 8080).into())
    }
}
