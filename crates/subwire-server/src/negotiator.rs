//! Sub-protocol negotiation.

use std::sync::Arc;

use subwire_proto::{builtin_protocols, SubProtocol};
use thiserror::Error;
use tracing::debug;

use crate::config::ServerConfig;

/// No requested protocol is both registered and allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no supported sub-protocol among [{}]", rejected.join(", "))]
pub struct NegotiationError {
    /// Every token that was considered and turned down.
    pub rejected: Vec<String>,
}

/// Picks the wire sub-protocol for a connection.
#[derive(Debug, Clone)]
pub struct ProtocolNegotiator {
    handlers: Vec<Arc<dyn SubProtocol>>,
    allowed: Option<Vec<String>>,
    default_protocol: Option<String>,
}

impl ProtocolNegotiator {
    /// Create a negotiator over `handlers`.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn SubProtocol>>) -> Self {
        Self {
            handlers,
            allowed: None,
            default_protocol: None,
        }
    }

    /// Negotiator over the built-in protocols, configured from `config`.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        let negotiator =
            Self::new(builtin_protocols()).with_default_protocol(config.default_protocol.clone());
        match &config.allowed_protocols {
            Some(allowed) => negotiator.with_allowed(allowed.clone()),
            None => negotiator,
        }
    }

    /// Restrict negotiation to `allowed` protocol names.
    #[must_use]
    pub fn with_allowed(mut self, allowed: Vec<String>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    /// Protocol used when the client states no preference.
    #[must_use]
    pub fn with_default_protocol(mut self, name: impl Into<String>) -> Self {
        self.default_protocol = Some(name.into());
        self
    }

    /// Names of every registered handler.
    #[must_use]
    pub fn registered(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Choose a protocol for a client's comma-separated preference list.
    ///
    /// Candidates are tried in the client's order; the first one that has
    /// a handler and passes the allow-list wins. Without a preference the
    /// configured default is subject to the same checks.
    ///
    /// # Errors
    ///
    /// Returns a [`NegotiationError`] carrying every rejected token.
    pub fn negotiate(
        &self,
        requested: Option<&str>,
    ) -> Result<Arc<dyn SubProtocol>, NegotiationError> {
        let mut candidates: Vec<&str> = requested
            .into_iter()
            .flat_map(|list| list.split(','))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .collect();

        if candidates.is_empty() {
            candidates.extend(self.default_protocol.as_deref());
        }

        let mut rejected = Vec::new();
        for candidate in candidates {
            match self.accept(candidate) {
                Some(handler) => {
                    debug!(protocol = handler.name(), "Sub-protocol negotiated");
                    return Ok(handler);
                }
                None => rejected.push(candidate.to_string()),
            }
        }

        Err(NegotiationError { rejected })
    }

    fn accept(&self, candidate: &str) -> Option<Arc<dyn SubProtocol>> {
        if let Some(allowed) = &self.allowed {
            if !allowed.iter().any(|name| name.eq_ignore_ascii_case(candidate)) {
                return None;
            }
        }
        self.handlers
            .iter()
            .find(|handler| handler.name().eq_ignore_ascii_case(candidate))
            .cloned()
    }
}

impl Default for ProtocolNegotiator {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}
