//! # subwire-server
//!
//! GraphQL subscription server: accepts WebSocket clients, negotiates a
//! sub-protocol, runs one session per connection and fans published
//! events out to subscribed clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  WebSocket   ┌───────────────────┐      ┌───────────────┐
//! │  client  │◄────────────►│ ConnectionGateway │─────►│ ClientSession │
//! └──────────┘              └─────────┬─────────┘      └───────┬───────┘
//!                                     │ try_add                │ subscribe
//!                           ┌─────────▼─────────┐      ┌───────▼───────┐
//!                           │  ClientRegistry   │◄─────│  EventRouter  │◄── publish
//!                           └───────────────────┘ sink └───────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use subwire_server::{PassthroughEngine, ServerConfig, SubscriptionServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default().with_max_connected_clients(1000);
//!     let server = SubscriptionServer::new(config, Arc::new(PassthroughEngine));
//!
//!     let publisher = server.publisher();
//!     publisher.publish("onWidgetChanged", serde_json::json!({ "id": 1 })).ok();
//!
//!     server.serve().await.ok();
//! }
//! ```
//!
//! ## Sub-protocols
//!
//! - `graphql-transport-ws`: `connection_init`, `subscribe`, `complete`,
//!   `ping`/`pong` in; `connection_ack`, `next`, `error`, `complete` out.
//! - `graphql-ws`: `connection_init`, `start`, `stop`,
//!   `connection_terminate` in; `connection_ack`, `ka`, `data`, `error`,
//!   `complete` out.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod negotiator;
pub mod server;
pub mod session;
pub mod transport;
pub mod ws;

pub use config::{
    ServerConfig, WebSocketConfig, DEFAULT_CLIENT_BUFFER_SIZE, DEFAULT_INIT_TIMEOUT,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PROTOCOL, DEFAULT_ROUTE_PATH,
    DEFAULT_SCHEMA_NAME,
};
pub use engine::{
    EngineError, EngineResult, OperationKind, PassthroughEngine, QueryEngine, Resolution,
    ResolveRequest,
};
pub use error::{ServerError, ServerResult};
pub use gateway::{ConnectionGateway, GatewayError, GatewayOutcome};
pub use negotiator::{NegotiationError, ProtocolNegotiator};
pub use server::{EventPublisher, RegistrySink, SubscriptionServer};
pub use session::{
    ClientHandle, ClientSession, MessageOutcome, SessionContext, SessionError, SessionResult,
    SessionState, MASKED_ERROR_MESSAGE,
};
pub use transport::{
    ClientConnection, CloseInfo, Inbound, TransportError, TransportResult, TransportState,
};
pub use ws::{ws_message_size, WsConnection};
