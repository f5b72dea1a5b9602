//! Context cache.
//!
//! A [`Context`] is an open channel plus the topology declared on it. Contexts
//! are cached by the canonical key of their [`TopologyDescriptor`]:
//!
//! - concurrent resolvers of one key share a single build
//! - a failed build leaves no entry behind, so the next resolve retries
//! - contexts are evicted as soon as their connection closes

use crate::broker::{BrokerChannel, BrokerError};
use crate::connection::{flag_raised, Connection, ConnectionManager};
use crate::error::{OperationError, SessionError, TopologyError};
use crate::topology::TopologyDescriptor;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info};

/// Open channel with its declared exchange and queue.
pub struct Context {
    key: String,
    connection: Connection,
    channel: Arc<dyn BrokerChannel>,
    exchange_name: Option<String>,
    queue_name: Option<String>,
}

impl Context {
    /// Cache key this context was built for.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn exchange_name(&self) -> Option<&str> {
        self.exchange_name.as_deref()
    }

    /// Actual queue name; broker-generated for anonymous queues.
    pub fn queue_name(&self) -> Option<&str> {
        self.queue_name.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("connection", &self.connection)
            .field("exchange_name", &self.exchange_name)
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

/// One cache entry. `evicted` is raised once the entry leaves the table.
struct Entry {
    cell: OnceCell<Arc<Context>>,
    evicted: watch::Sender<bool>,
}

impl Entry {
    fn new() -> Self {
        let (evicted, _) = watch::channel(false);
        Self {
            cell: OnceCell::new(),
            evicted,
        }
    }

    fn get(&self) -> Option<&Arc<Context>> {
        self.cell.get()
    }

    fn evict(&self) {
        self.evicted.send_replace(true);
    }
}

type Slot = Arc<Entry>;
type Entries = Arc<Mutex<HashMap<String, Slot>>>;

fn lock_entries(entries: &Entries) -> MutexGuard<'_, HashMap<String, Slot>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_if_same(entries: &Entries, key: &str, slot: &Slot) {
    let mut entries = lock_entries(entries);
    if entries
        .get(key)
        .is_some_and(|current| Arc::ptr_eq(current, slot))
    {
        entries.remove(key);
        slot.evict();
    }
}

/// Cache of contexts keyed by topology.
pub struct ContextCache {
    connections: Arc<ConnectionManager>,
    entries: Entries,
}

impl ContextCache {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Return the cached context for a descriptor, building it if needed.
    pub async fn resolve(
        &self,
        descriptor: &TopologyDescriptor,
    ) -> Result<Arc<Context>, SessionError> {
        let key = descriptor.canonical_key()?;

        loop {
            let slot = self.slot(&key);
            match slot
                .cell
                .get_or_try_init(|| self.build(&key, descriptor, &slot))
                .await
            {
                Ok(context) if context.is_open() => return Ok(Arc::clone(context)),
                Ok(_) => {
                    debug!(key = %key, "cached context is closed, rebuilding");
                    remove_if_same(&self.entries, &key, &slot);
                }
                Err(err) => {
                    remove_if_same(&self.entries, &key, &slot);
                    return Err(err);
                }
            }
        }
    }

    /// Cached context for a descriptor, without building one.
    pub fn peek(&self, descriptor: &TopologyDescriptor) -> Option<Arc<Context>> {
        let key = descriptor.canonical_key().ok()?;
        let slot = lock_entries(&self.entries).get(&key).cloned()?;
        slot.get().filter(|context| context.is_open()).cloned()
    }

    /// Drop a context from the cache if it is still the cached one.
    pub fn invalidate(&self, context: &Arc<Context>) {
        let mut entries = lock_entries(&self.entries);
        let cached = entries
            .get(context.key())
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, context));
        if cached {
            debug!(key = %context.key(), "invalidating context");
            if let Some(slot) = entries.remove(context.key()) {
                slot.evict();
            }
        }
    }

    pub fn clear(&self) {
        for (_, slot) in lock_entries(&self.entries).drain() {
            slot.evict();
        }
    }

    /// Number of cached (or in-progress) contexts.
    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &str) -> Slot {
        let mut entries = lock_entries(&self.entries);
        Arc::clone(
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Entry::new())),
        )
    }

    async fn build(
        &self,
        key: &str,
        descriptor: &TopologyDescriptor,
        slot: &Slot,
    ) -> Result<Arc<Context>, SessionError> {
        descriptor.validate()?;

        loop {
            let connection = self.connections.acquire().await?;

            match self.declare(key, descriptor, &connection).await {
                Ok(context) => {
                    let context = Arc::new(context);
                    self.evict_on_close(key, slot, &connection);
                    info!(
                        address = %connection.address(),
                        exchange = ?context.exchange_name(),
                        queue = ?context.queue_name(),
                        "context established"
                    );
                    return Ok(context);
                }
                Err(BuildError::ConnectionLost) => {
                    debug!(key = %key, "connection lost while building context, retrying");
                    self.connections.discard(&connection);
                }
                Err(BuildError::Failed(err)) => return Err(err),
            }
        }
    }

    async fn declare(
        &self,
        key: &str,
        descriptor: &TopologyDescriptor,
        connection: &Connection,
    ) -> Result<Context, BuildError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BuildError::classify(err, connection, OperationError::ChannelOpen))?;

        let exchange_name = match &descriptor.exchange {
            Some(exchange) => {
                debug!(exchange = %exchange.name, kind = %exchange.kind, "channel.assertExchange");
                channel
                    .declare_exchange(&exchange.name, &exchange.kind, &exchange.options)
                    .await
                    .map_err(|err| {
                        BuildError::classify(err, connection, |source| {
                            TopologyError::ExchangeDeclare {
                                name: exchange.name.clone(),
                                source,
                            }
                        })
                    })?;
                Some(exchange.name.clone())
            }
            None => None,
        };

        let queue_name = match &descriptor.queue {
            Some(queue) => {
                debug!(queue = %queue.name, "channel.assertQueue");
                let name = channel
                    .declare_queue(&queue.name, &queue.options)
                    .await
                    .map_err(|err| {
                        BuildError::classify(err, connection, |source| TopologyError::QueueDeclare {
                            name: queue.name.clone(),
                            source,
                        })
                    })?;
                Some(name)
            }
            None => None,
        };

        Ok(Context {
            key: key.to_string(),
            connection: connection.clone(),
            channel,
            exchange_name,
            queue_name,
        })
    }

    /// Evict the entry when its connection closes. The task ends as soon as the
    /// entry leaves the table for any reason.
    fn evict_on_close(&self, key: &str, slot: &Slot, connection: &Connection) {
        let entries = Arc::clone(&self.entries);
        let key = key.to_string();
        let slot = Arc::clone(slot);
        let connection = connection.clone();
        let mut evicted = slot.evicted.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = connection.closed() => {
                    debug!(key = %key, "evicting context after connection close");
                    remove_if_same(&entries, &key, &slot);
                }
                _ = flag_raised(&mut evicted) => {}
            }
        });
    }
}

enum BuildError {
    /// The connection went away mid-build; acquire a new one and start over.
    ConnectionLost,
    Failed(SessionError),
}

impl BuildError {
    fn classify<E>(err: BrokerError, connection: &Connection, wrap: impl FnOnce(BrokerError) -> E) -> Self
    where
        E: Into<SessionError>,
    {
        if err.is_closed() && !connection.is_open() {
            Self::ConnectionLost
        } else {
            Self::Failed(wrap(err).into())
        }
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
