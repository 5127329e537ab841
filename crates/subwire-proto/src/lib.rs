//! # subwire-proto
//!
//! Wire model for the subwire GraphQL subscription server.
//!
//! - [`types`] - client ids, routes, event names and published events
//! - [`messages`] - protocol-independent client/server messages
//! - [`protocol`] - the `graphql-ws` and `graphql-transport-ws` codecs
//! - [`status`] - close statuses and their HTTP equivalents

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod messages;
pub mod protocol;
pub mod status;
pub mod types;

pub use error::{ProtoError, ProtoResult};
pub use messages::{ClientMessage, ExecutionPayload, GraphError, OperationRequest, ServerMessage};
pub use protocol::{builtin_protocols, GraphqlTransportWs, GraphqlWs, SubProtocol};
pub use status::CloseStatus;
pub use types::{ClientId, ClientIdentity, EventName, Route, SubscriptionEvent};
