//! Core types for the subwire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ProtoError;

/// Unique identifier for a connected subscription client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Create a new random `ClientId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a `ClientId` from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProtoError::Validation(format!("invalid client ID: {e}")))
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ClientId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Path of a subscribable schema field, e.g. `onWidgetChanged` or
/// `widgets/onCreated`.
///
/// Surrounding whitespace and slashes are stripped; case is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Route(String);

impl Route {
    /// Create a route from a field path.
    #[must_use]
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(path.as_ref().trim().trim_matches('/').to_string())
    }

    /// Get the route path.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the route is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized name of a publishable event: `<schema>:<route>`, lowercased.
///
/// This is the key of the router index. Two routes that differ only in
/// case map to the same event name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventName(String);

impl EventName {
    /// Build an event name from schema coordinates.
    #[must_use]
    pub fn new(schema: &str, route: &str) -> Self {
        let route = route.trim().trim_matches('/');
        Self(format!("{}:{}", schema.trim(), route).to_lowercase())
    }

    /// Build the event name a subscription on `route` listens to.
    #[must_use]
    pub fn for_route(schema: &str, route: &Route) -> Self {
        Self::new(schema, route.as_str())
    }

    /// Get the normalized name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event published once and fanned out to every interested client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    /// Event name (router key).
    pub name: EventName,
    /// Source data handed to the query engine for each matching subscription.
    pub payload: serde_json::Value,
}

impl SubscriptionEvent {
    /// Create a new event.
    #[must_use]
    pub const fn new(name: EventName, payload: serde_json::Value) -> Self {
        Self { name, payload }
    }
}

/// Authenticated principal attached to a connection by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Create an identity from an opaque principal string.
    #[must_use]
    pub fn new(principal: impl Into<String>) -> Self {
        Self(principal.into())
    }

    /// Get the principal.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
