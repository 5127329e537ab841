//! Registry of connected subscription clients.

use std::collections::HashMap;

use parking_lot::Mutex;
use subwire_proto::ClientId;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry already holds the maximum number of clients.
    #[error("client registry is full ({max} clients)")]
    AtCapacity {
        /// Effective maximum number of clients.
        max: usize,
    },

    /// Client is already registered.
    #[error("client {0} is already registered")]
    AlreadyRegistered(ClientId),
}

/// Resolve a configured client limit into an effective capacity.
///
/// `None` means unbounded. A negative value is clamped to zero so a bad
/// setting degrades to accepting no clients instead of failing startup.
#[must_use]
pub fn effective_max_clients(configured: Option<i64>) -> usize {
    match configured {
        None => usize::MAX,
        Some(max) if max <= 0 => 0,
        Some(max) => usize::try_from(max).unwrap_or(usize::MAX),
    }
}

/// Bounded map of client id to session handle.
///
/// All operations take a single lock for the whole map, so capacity
/// checks and inserts are atomic with respect to each other.
#[derive(Debug)]
pub struct ClientRegistry<H> {
    clients: Mutex<HashMap<ClientId, H>>,
    max_clients: usize,
}

impl<H> ClientRegistry<H> {
    /// Create a registry holding at most `max_clients` clients.
    #[must_use]
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            max_clients,
        }
    }

    /// Create a registry with no practical limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Create a registry from a configured limit (see [`effective_max_clients`]).
    #[must_use]
    pub fn from_configured(configured: Option<i64>) -> Self {
        Self::new(effective_max_clients(configured))
    }

    /// Maximum number of clients.
    #[must_use]
    pub const fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Add a client if there is room.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AtCapacity`] if the registry is full and
    /// [`RegistryError::AlreadyRegistered`] if the id is taken.
    pub fn try_add(&self, client_id: ClientId, handle: H) -> Result<(), RegistryError> {
        let mut clients = self.clients.lock();

        if clients.len() >= self.max_clients {
            return Err(RegistryError::AtCapacity {
                max: self.max_clients,
            });
        }
        if clients.contains_key(&client_id) {
            return Err(RegistryError::AlreadyRegistered(client_id));
        }

        clients.insert(client_id, handle);
        debug!(client_id = %client_id, count = clients.len(), "Client registered");
        Ok(())
    }

    /// Remove a client. Removing an absent client is a no-op.
    pub fn remove(&self, client_id: ClientId) -> Option<H> {
        let removed = self.clients.lock().remove(&client_id);
        if removed.is_some() {
            debug!(client_id = %client_id, "Client unregistered");
        }
        removed
    }

    /// Check if a client is registered.
    #[must_use]
    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.lock().contains_key(&client_id)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Ids of all registered clients.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.lock().keys().copied().collect()
    }
}

impl<H: Clone> ClientRegistry<H> {
    /// Get a copy of a client's handle.
    #[must_use]
    pub fn try_get(&self, client_id: ClientId) -> Option<H> {
        self.clients.lock().get(&client_id).cloned()
    }

    /// Copies of every registered handle.
    #[must_use]
    pub fn handles(&self) -> Vec<H> {
        self.clients.lock().values().cloned().collect()
    }
}

impl<H> Default for ClientRegistry<H> {
    fn default() -> Self {
        Self::unbounded()
    }
}
