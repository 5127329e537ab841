//! Query engine seam.
//!
//! Parsing and executing GraphQL is not part of this crate. The session
//! hands each operation to a [`QueryEngine`], once to resolve what it is
//! and again for every event a subscription receives.

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use subwire_proto::{ExecutionPayload, GraphError, OperationRequest, Route};
use thiserror::Error;

/// Kind of a resolved operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Read-only one-shot operation.
    Query,
    /// Mutating one-shot operation.
    Mutation,
    /// Long-lived operation fed by published events.
    Subscription,
}

/// Input to [`QueryEngine::resolve`].
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    /// Route of an established subscription, `None` on first resolution.
    pub route: Option<&'a Route>,
    /// The operation.
    pub operation: &'a OperationRequest,
    /// Published event payload, when resolving for an event.
    pub source: Option<&'a Value>,
}

impl<'a> ResolveRequest<'a> {
    /// First resolution of a freshly received operation.
    #[must_use]
    pub const fn new(operation: &'a OperationRequest) -> Self {
        Self {
            route: None,
            operation,
            source: None,
        }
    }

    /// Resolution of an established subscription for one event.
    #[must_use]
    pub const fn for_event(route: &'a Route, operation: &'a OperationRequest, source: &'a Value) -> Self {
        Self {
            route: Some(route),
            operation,
            source: Some(source),
        }
    }
}

/// Output of [`QueryEngine::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// What the operation turned out to be.
    pub kind: OperationKind,
    /// Subscribed route, for subscriptions.
    pub route: Option<Route>,
    /// Data and errors to send to the client.
    pub payload: ExecutionPayload,
}

impl Resolution {
    /// A resolved subscription on `route` with nothing to send yet.
    #[must_use]
    pub fn subscription(route: Route) -> Self {
        Self {
            kind: OperationKind::Subscription,
            route: Some(route),
            payload: ExecutionPayload::default(),
        }
    }

    /// A completed one-shot operation.
    #[must_use]
    pub const fn executed(kind: OperationKind, payload: ExecutionPayload) -> Self {
        Self {
            kind,
            route: None,
            payload,
        }
    }
}

/// Errors raised by a query engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The operation is invalid; the message is safe to show the client.
    #[error("{0}")]
    Rejected(String),

    /// The engine failed internally.
    #[error("engine fault: {0}")]
    Fault(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Resolves and executes GraphQL operations.
pub trait QueryEngine: Send + Sync {
    /// Resolve `request`.
    fn resolve<'a>(&'a self, request: ResolveRequest<'a>) -> BoxFuture<'a, EngineResult<Resolution>>;
}

/// Development engine with a single-keyword operation format.
///
/// `subscription <route>` subscribes to `<route>` and yields
/// `{ "<route>": <event payload> }` per event. `query` and `mutation`
/// documents echo their variables as `{ "echo": <variables> }`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEngine;

impl PassthroughEngine {
    fn resolve_now(request: ResolveRequest<'_>) -> EngineResult<Resolution> {
        let query = request.operation.query.trim();
        let mut words = query.split(|c: char| c.is_whitespace() || c == '{' || c == '(');
        let keyword = words.next().unwrap_or_default();

        let kind = match keyword {
            "subscription" => OperationKind::Subscription,
            "mutation" => OperationKind::Mutation,
            "query" => OperationKind::Query,
            "" if query.starts_with('{') => OperationKind::Query,
            "" => return Err(EngineError::Rejected("empty query document".to_string())),
            other => {
                return Err(EngineError::Rejected(format!(
                    "unknown operation type '{other}'"
                )));
            }
        };

        if kind != OperationKind::Subscription {
            let echo = request.operation.variables.clone().unwrap_or(Value::Null);
            return Ok(Resolution::executed(kind, ExecutionPayload::data(json!({ "echo": echo }))));
        }

        let route = match request.route {
            Some(route) => route.clone(),
            None => {
                let route = Route::new(words.find(|w| !w.is_empty()).unwrap_or_default());
                if route.is_empty() {
                    return Ok(Resolution::executed(
                        kind,
                        ExecutionPayload::errors(vec![GraphError::new(
                            "subscription must name a route",
                        )]),
                    ));
                }
                route
            }
        };

        match request.source {
            None => Ok(Resolution::subscription(route)),
            Some(source) => {
                let mut data = Map::new();
                data.insert(route.as_str().to_string(), source.clone());
                Ok(Resolution {
                    kind,
                    route: Some(route),
                    payload: ExecutionPayload::data(Value::Object(data)),
                })
            }
        }
    }
}

impl QueryEngine for PassthroughEngine {
    fn resolve<'a>(&'a self, request: ResolveRequest<'a>) -> BoxFuture<'a, EngineResult<Resolution>> {
        Box::pin(async move { Self::resolve_now(request) })
    }
}
