//! # subwire-router
//!
//! Shared, server-wide structures of the subscription server:
//!
//! - [`ClientRegistry`] - bounded map of connected clients
//! - [`EventRouter`] - event name to subscriber index and publish fan-out
//! - [`DispatchQueue`] - asynchronous delivery of published events
//!
//! One instance of each exists per server process. They are explicitly
//! owned and handed to the gateway, never global.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatch;
pub mod registry;
pub mod router;

pub use dispatch::{
    drain_and_dispose, ChannelDispatchQueue, DispatchError, DispatchItem, DispatchQueue,
    DrainPolicy, DrainReport, EventSink, DEFAULT_DRAIN_CEILING, DEFAULT_DRAIN_POLL_INTERVAL,
};
pub use registry::{effective_max_clients, ClientRegistry, RegistryError};
pub use router::{EventRouter, RouterError};
