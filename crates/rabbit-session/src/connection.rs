//! Connection management.
//!
//! [`ConnectionManager`] owns the process-wide registry of broker connections,
//! keyed by address. It guarantees:
//!
//! - at most one connection attempt is in flight at a time, so concurrent callers
//!   share a single connection
//! - failed attempts rotate through the endpoint list with exponential backoff and
//!   are retried until one succeeds or the session shuts down
//! - a connection that closes is dropped from the registry, so the next
//!   [`ConnectionManager::acquire`] reconnects

use crate::backoff::{BackoffPolicy, BackoffState};
use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent};
use crate::endpoint::EndpointList;
use crate::error::SessionError;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

#[derive(Clone)]
enum RegistryEntry {
    Connecting,
    Connected(Connection),
}

type Registry = Arc<Mutex<HashMap<String, RegistryEntry>>>;

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to an established broker connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

struct ConnectionShared {
    id: u64,
    address: String,
    transport: Arc<dyn BrokerConnection>,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    fn new(id: u64, address: String, transport: Arc<dyn BrokerConnection>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self {
            shared: Arc::new(ConnectionShared {
                id,
                address,
                transport,
                state,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Endpoint this connection was established to.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected && self.shared.transport.is_open()
    }

    /// Resolves once the connection has been observed closed.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Close the connection. Anything built on it is rebuilt on next use.
    pub async fn close(&self) -> Result<(), BrokerError> {
        info!(address = %self.address(), "closing broker connection");
        self.shared.transport.close().await
    }

    pub(crate) async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        debug!(address = %self.address(), "connection.createChannel()");
        self.shared.transport.create_channel().await
    }

    pub(crate) fn mark_closed(&self) {
        self.shared.state.send_replace(ConnectionState::Closed);
    }

    fn transport_open(&self) -> bool {
        self.shared.transport.is_open()
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.transport.events()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("address", &self.address())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// ConnectionManager
// ============================================================================

/// Establishes and tracks broker connections for one endpoint list.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    endpoints: EndpointList,
    backoff: BackoffPolicy,
    registry: Registry,
    connect_gate: tokio::sync::Mutex<()>,
    shutdown: watch::Receiver<bool>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager. Connecting stops once `shutdown` becomes true.
    pub fn new(
        broker: Arc<dyn Broker>,
        endpoints: EndpointList,
        backoff: BackoffPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            endpoints,
            backoff,
            registry: Arc::new(Mutex::new(HashMap::new())),
            connect_gate: tokio::sync::Mutex::new(()),
            shutdown,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoints(&self) -> &EndpointList {
        &self.endpoints
    }

    /// Registry state for an address, if it has an entry.
    pub fn state(&self, address: &str) -> Option<ConnectionState> {
        lock_registry(&self.registry)
            .get(address)
            .map(|entry| match entry {
                RegistryEntry::Connecting => ConnectionState::Connecting,
                RegistryEntry::Connected(connection) => connection.state(),
            })
    }

    /// The open connection, if there is one.
    pub fn current(&self) -> Option<Connection> {
        lock_registry(&self.registry)
            .values()
            .find_map(|entry| match entry {
                RegistryEntry::Connected(connection) if connection.is_open() => {
                    Some(connection.clone())
                }
                _ => None,
            })
    }

    /// Return the open connection, establishing one if needed.
    ///
    /// Never fails for connection reasons; it keeps trying until a connection is
    /// up. Returns [`SessionError::Closed`] if the session shuts down meanwhile.
    pub async fn acquire(&self) -> Result<Connection, SessionError> {
        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        let _gate = self.connect_gate.lock().await;
        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        self.connect_with_backoff().await
    }

    async fn connect_with_backoff(&self) -> Result<Connection, SessionError> {
        let mut backoff = BackoffState::new();
        let mut shutdown = self.shutdown.clone();
        let mut attempt: usize = 0;

        loop {
            if *shutdown.borrow() {
                return Err(SessionError::Closed);
            }

            let address = self.endpoints.select(attempt).to_string();
            lock_registry(&self.registry).insert(address.clone(), RegistryEntry::Connecting);
            debug!(address = %address, attempt, "connecting to broker");

            match self.broker.connect(&address).await {
                Ok(transport) => {
                    let connection = self.register(address, transport);
                    info!(
                        address = %connection.address(),
                        failures = backoff.failures(),
                        "connected to broker"
                    );
                    return Ok(connection);
                }
                Err(err) => {
                    lock_registry(&self.registry).remove(&address);
                    let delay = backoff.next_delay(&self.backoff);
                    warn!(
                        address = %address,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "connection attempt failed, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = flag_raised(&mut shutdown) => {
                            return Err(SessionError::Closed);
                        }
                    }
                }
            }

            attempt = attempt.wrapping_add(1);
        }
    }

    fn register(&self, address: String, transport: Arc<dyn BrokerConnection>) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, address.clone(), transport);

        // Subscribe before spawning so a close racing with registration is seen.
        let events = connection.events();
        lock_registry(&self.registry).insert(address, RegistryEntry::Connected(connection.clone()));
        tokio::spawn(observe_connection(
            connection.clone(),
            events,
            Arc::clone(&self.registry),
        ));

        connection
    }

    /// Drop a connection that turned out to be unusable.
    pub(crate) fn discard(&self, connection: &Connection) {
        connection.mark_closed();
        remove_if_current(&self.registry, connection);
    }

    /// Close every registered connection.
    pub async fn close_all(&self) {
        let connections: Vec<Connection> = lock_registry(&self.registry)
            .drain()
            .filter_map(|(_, entry)| match entry {
                RegistryEntry::Connected(connection) => Some(connection),
                RegistryEntry::Connecting => None,
            })
            .collect();

        for connection in connections {
            if let Err(err) = connection.close().await {
                debug!(address = %connection.address(), error = %err, "error while closing connection");
            }
            connection.mark_closed();
        }
    }
}

/// Resolves once the flag is set or its sender is gone.
pub(crate) async fn flag_raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

fn remove_if_current(registry: &Registry, connection: &Connection) {
    let mut registry = lock_registry(registry);
    let current = matches!(
        registry.get(connection.address()),
        Some(RegistryEntry::Connected(existing)) if existing.id() == connection.id()
    );
    if current {
        registry.remove(connection.address());
    }
}

async fn observe_connection(
    connection: Connection,
    mut events: broadcast::Receiver<ConnectionEvent>,
    registry: Registry,
) {
    while connection.transport_open() {
        match events.recv().await {
            Ok(ConnectionEvent::Error(message)) => {
                warn!(address = %connection.address(), error = %message, "broker connection error");
            }
            Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => {
                debug!(address = %connection.address(), skipped, "connection events lagged");
            }
        }
    }

    connection.mark_closed();
    remove_if_current(&registry, &connection);
    info!(address = %connection.address(), "broker connection closed");
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
