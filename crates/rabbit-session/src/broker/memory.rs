//! In-memory broker implementation for testing and development.
//!
//! This module models the parts of AMQP 0-9-1 the session layer depends on:
//! - Direct, fanout, topic and headers exchanges plus the default exchange
//! - Exclusive, auto-delete and server-named queues
//! - Round-robin dispatch with per-consumer prefetch limits
//! - Acknowledgement, rejection and requeueing with the redelivered flag
//! - Channel-level errors that close the channel, as a real broker does
//!
//! It also lets tests make addresses unreachable and force connections closed,
//! which is how failover and reconnection are exercised without a live broker.

use super::routing::binding_matches;
use super::{
    reply_code, Broker, BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, Consumer,
    ConsumerMessage, Delivery,
};
use crate::options::{
    ConsumeOptions, ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const EVENT_CAPACITY: usize = 16;

// ============================================================================
// Public inspection types
// ============================================================================

/// A recorded connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub address: String,
    pub at: Instant,
    pub succeeded: bool,
}

/// Operation counters, useful for asserting that work was (not) repeated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: u64,
    pub channels_opened: u64,
    pub exchange_declarations: u64,
    pub queue_declarations: u64,
    pub bindings: u64,
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    unreachable: HashSet<String>,
    connect_attempts: Vec<ConnectAttempt>,
    stats: BrokerStats,
    next_id: u64,
}

struct ExchangeState {
    kind: ExchangeKind,
    options: ExchangeOptions,
    bindings: Vec<Binding>,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    pattern: String,
}

struct QueueState {
    options: QueueOptions,
    /// Connection that owns an exclusive queue.
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    /// Next consumer to try when dispatching.
    cursor: usize,
    has_had_consumers: bool,
}

impl QueueState {
    fn remove_consumer(&mut self, index: usize) -> ConsumerSlot {
        let slot = self.consumers.remove(index);
        if self.cursor > index {
            self.cursor -= 1;
        }
        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }
        slot
    }
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    exclusive: bool,
    /// Channel prefetch captured when the consumer was registered.
    prefetch: Option<u16>,
    sender: mpsc::UnboundedSender<ConsumerMessage>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    content: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConnectionEntry {
    address: String,
    events: broadcast::Sender<ConnectionEvent>,
}

struct ChannelEntry {
    connection_id: u64,
    prefetch: Option<u16>,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, channel_id: u64, connection_id: u64) -> Result<(), BrokerError> {
        if !self.connections.contains_key(&connection_id) {
            return Err(BrokerError::ConnectionClosed);
        }
        if !self.channels.contains_key(&channel_id) {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }

    /// Channel-level exception: the channel is closed and the error returned.
    fn reject(&mut self, channel_id: u64, code: u16, text: String) -> BrokerError {
        debug!(channel_id, code, text = %text, "closing channel after rejected operation");
        self.close_channel(channel_id, ConsumerMessage::ChannelClosed);
        BrokerError::rejected(code, text)
    }

    fn check_queue_access(
        &mut self,
        channel_id: u64,
        connection_id: u64,
        queue: &str,
    ) -> Result<(), BrokerError> {
        match self.queues.get(queue).map(|state| state.owner) {
            None => Err(self.reject(
                channel_id,
                reply_code::NOT_FOUND,
                format!("NOT_FOUND - no queue '{}'", queue),
            )),
            Some(Some(owner)) if owner != connection_id => Err(self.reject(
                channel_id,
                reply_code::RESOURCE_LOCKED,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    queue
                ),
            )),
            Some(_) => Ok(()),
        }
    }

    fn declare_exchange(
        &mut self,
        channel_id: u64,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError> {
        if name.is_empty() || name.starts_with("amq.") {
            return Err(self.reject(
                channel_id,
                reply_code::ACCESS_REFUSED,
                format!("ACCESS_REFUSED - exchange name '{}' is reserved", name),
            ));
        }
        if let ExchangeKind::Custom(kind) = kind {
            return Err(self.reject(
                channel_id,
                reply_code::COMMAND_INVALID,
                format!("COMMAND_INVALID - unknown exchange type '{}'", kind),
            ));
        }

        self.stats.exchange_declarations += 1;

        let equivalent = self.exchanges.get(name).map(|existing| {
            existing.kind == *kind
                && existing.options.durable == options.durable
                && existing.options.auto_delete == options.auto_delete
                && existing.options.internal == options.internal
        });

        match equivalent {
            Some(true) => Ok(()),
            Some(false) => Err(self.reject(
                channel_id,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - inequivalent arg for exchange '{}'", name),
            )),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind: kind.clone(),
                        options: options.clone(),
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        channel_id: u64,
        connection_id: u64,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, BrokerError> {
        if name.starts_with("amq.") {
            return Err(self.reject(
                channel_id,
                reply_code::ACCESS_REFUSED,
                format!("ACCESS_REFUSED - queue name '{}' is reserved", name),
            ));
        }

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        self.stats.queue_declarations += 1;

        let existing = self.queues.get(&name).map(|existing| {
            let equivalent = existing.options.durable == options.durable
                && existing.options.exclusive == options.exclusive
                && existing.options.auto_delete == options.auto_delete;
            (existing.owner, equivalent)
        });

        match existing {
            Some((Some(owner), _)) if owner != connection_id => Err(self.reject(
                channel_id,
                reply_code::RESOURCE_LOCKED,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    name
                ),
            )),
            Some((_, false)) => Err(self.reject(
                channel_id,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - inequivalent arg for queue '{}'", name),
            )),
            Some(_) => Ok(name),
            None => {
                self.queues.insert(
                    name.clone(),
                    QueueState {
                        options: options.clone(),
                        owner: options.exclusive.then_some(connection_id),
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                        has_had_consumers: false,
                    },
                );
                Ok(name)
            }
        }
    }

    fn bind_queue(
        &mut self,
        channel_id: u64,
        connection_id: u64,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.check_queue_access(channel_id, connection_id, queue)?;

        if exchange.is_empty() {
            return Err(self.reject(
                channel_id,
                reply_code::ACCESS_REFUSED,
                "ACCESS_REFUSED - operation not permitted on the default exchange".to_string(),
            ));
        }

        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        match self.exchanges.get_mut(exchange) {
            None => Err(self.reject(
                channel_id,
                reply_code::NOT_FOUND,
                format!("NOT_FOUND - no exchange '{}'", exchange),
            )),
            Some(state) => {
                if !state.bindings.contains(&binding) {
                    state.bindings.push(binding);
                }
                self.stats.bindings += 1;
                Ok(())
            }
        }
    }

    fn publish(
        &mut self,
        channel_id: u64,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            match self.exchanges.get(exchange) {
                None => {
                    return Err(self.reject(
                        channel_id,
                        reply_code::NOT_FOUND,
                        format!("NOT_FOUND - no exchange '{}'", exchange),
                    ))
                }
                Some(state) => {
                    let mut targets: Vec<String> = Vec::new();
                    for binding in &state.bindings {
                        if binding_matches(&state.kind, &binding.pattern, routing_key)
                            && !targets.contains(&binding.queue)
                        {
                            targets.push(binding.queue.clone());
                        }
                    }
                    targets
                }
            }
        };

        self.stats.published += 1;

        if targets.is_empty() {
            debug!(exchange, routing_key, "message is unroutable and was dropped");
            return Ok(());
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content,
            properties: properties.clone(),
            redelivered: false,
        };
        for queue in targets {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.messages.push_back(message.clone());
            }
            self.dispatch(&queue);
        }
        Ok(())
    }

    fn consume(
        &mut self,
        channel_id: u64,
        connection_id: u64,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Consumer, BrokerError> {
        self.check_queue_access(channel_id, connection_id, queue)?;

        let locked = self.queues.get(queue).is_some_and(|state| {
            state.consumers.iter().any(|slot| slot.exclusive)
                || (options.exclusive && !state.consumers.is_empty())
        });
        if locked {
            return Err(self.reject(
                channel_id,
                reply_code::ACCESS_REFUSED,
                format!("ACCESS_REFUSED - queue '{}' in exclusive use", queue),
            ));
        }

        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("amq.ctag-{}", Uuid::new_v4().simple()));
        let reused = self.queues.values().any(|state| {
            state
                .consumers
                .iter()
                .any(|slot| slot.channel_id == channel_id && slot.tag == tag)
        });
        if reused {
            return Err(self.reject(
                channel_id,
                reply_code::NOT_ALLOWED,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", tag),
            ));
        }

        let prefetch = self
            .channels
            .get(&channel_id)
            .and_then(|channel| channel.prefetch);
        let (sender, receiver) = mpsc::unbounded_channel();

        if let Some(state) = self.queues.get_mut(queue) {
            state.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                channel_id,
                no_ack: options.no_ack,
                exclusive: options.exclusive,
                prefetch,
                sender,
            });
            state.has_had_consumers = true;
        }
        self.dispatch(queue);

        Ok(Consumer::new(tag, receiver))
    }

    fn cancel(&mut self, channel_id: u64, consumer_tag: &str) {
        let mut affected = None;
        for (name, state) in self.queues.iter_mut() {
            let position = state
                .consumers
                .iter()
                .position(|slot| slot.channel_id == channel_id && slot.tag == consumer_tag);
            if let Some(index) = position {
                let slot = state.remove_consumer(index);
                let _ = slot.sender.send(ConsumerMessage::Cancelled);
                affected = Some(name.clone());
                break;
            }
        }

        if let Some(name) = affected {
            self.auto_delete_if_unused(&name);
        }
    }

    fn take_unacked(
        &mut self,
        channel_id: u64,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<Vec<Unacked>, BrokerError> {
        let tags: Vec<u64> = match self.channels.get(&channel_id) {
            None => return Err(BrokerError::ChannelClosed),
            Some(channel) if multiple && delivery_tag == 0 => {
                channel.unacked.keys().copied().collect()
            }
            Some(channel) if multiple => channel
                .unacked
                .range(..=delivery_tag)
                .map(|(tag, _)| *tag)
                .collect(),
            Some(channel) if channel.unacked.contains_key(&delivery_tag) => vec![delivery_tag],
            Some(_) => Vec::new(),
        };

        if tags.is_empty() {
            return Err(self.reject(
                channel_id,
                reply_code::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
            ));
        }

        let mut settled = Vec::with_capacity(tags.len());
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            for tag in tags {
                if let Some(entry) = channel.unacked.remove(&tag) {
                    settled.push(entry);
                }
            }
        }
        Ok(settled)
    }

    fn ack(&mut self, channel_id: u64, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        let settled = self.take_unacked(channel_id, delivery_tag, multiple)?;
        self.stats.acked += settled.len() as u64;

        let mut queues: Vec<String> = settled.into_iter().map(|entry| entry.queue).collect();
        queues.dedup();
        for queue in queues {
            self.dispatch(&queue);
        }
        Ok(())
    }

    fn nack(
        &mut self,
        channel_id: u64,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let settled = self.take_unacked(channel_id, delivery_tag, multiple)?;
        self.stats.nacked += settled.len() as u64;

        if requeue {
            self.requeue(settled);
        } else {
            let mut queues: Vec<String> = settled.into_iter().map(|entry| entry.queue).collect();
            queues.dedup();
            for queue in queues {
                self.dispatch(&queue);
            }
        }
        Ok(())
    }

    /// Put settled-but-not-acknowledged messages back at the head of their queues,
    /// preserving their original order.
    fn requeue(&mut self, entries: Vec<Unacked>) {
        let mut affected: Vec<String> = Vec::new();
        for entry in entries.into_iter().rev() {
            if let Some(state) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                state.messages.push_front(message);
                if !affected.contains(&entry.queue) {
                    affected.push(entry.queue);
                }
            }
        }
        for queue in affected {
            self.dispatch(&queue);
        }
    }

    fn delete_queue(
        &mut self,
        channel_id: u64,
        connection_id: u64,
        name: &str,
    ) -> Result<u32, BrokerError> {
        let owner = self.queues.get(name).and_then(|state| state.owner);
        if matches!(owner, Some(owner) if owner != connection_id) {
            return Err(self.reject(
                channel_id,
                reply_code::RESOURCE_LOCKED,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    name
                ),
            ));
        }

        Ok(self.remove_queue(name).unwrap_or(0))
    }

    fn delete_exchange(&mut self, channel_id: u64, name: &str) -> Result<(), BrokerError> {
        if name.is_empty() || name.starts_with("amq.") {
            return Err(self.reject(
                channel_id,
                reply_code::ACCESS_REFUSED,
                format!("ACCESS_REFUSED - exchange name '{}' is reserved", name),
            ));
        }
        self.exchanges.remove(name);
        Ok(())
    }

    /// Remove a queue, cancelling its consumers and dropping its bindings.
    /// Returns the number of ready messages it held.
    fn remove_queue(&mut self, name: &str) -> Option<u32> {
        let state = self.queues.remove(name)?;
        for slot in state.consumers {
            let _ = slot.sender.send(ConsumerMessage::Cancelled);
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|binding| binding.queue != name);
        }
        debug!(queue = name, "queue deleted");
        Some(state.messages.len() as u32)
    }

    fn auto_delete_if_unused(&mut self, name: &str) {
        let unused = self.queues.get(name).is_some_and(|state| {
            state.options.auto_delete && state.has_had_consumers && state.consumers.is_empty()
        });
        if unused {
            self.remove_queue(name);
        }
    }

    fn close_channel(&mut self, channel_id: u64, notice: ConsumerMessage) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };

        let mut affected: Vec<String> = Vec::new();
        for (name, state) in self.queues.iter_mut() {
            let mut index = 0;
            while index < state.consumers.len() {
                if state.consumers[index].channel_id == channel_id {
                    let slot = state.remove_consumer(index);
                    let _ = slot.sender.send(notice.clone());
                    if !affected.contains(name) {
                        affected.push(name.clone());
                    }
                } else {
                    index += 1;
                }
            }
        }

        self.requeue(channel.unacked.into_values().collect());

        for name in affected {
            self.auto_delete_if_unused(&name);
        }
    }

    fn close_connection(&mut self, connection_id: u64, forced: bool) {
        let Some(entry) = self.connections.remove(&connection_id) else {
            return;
        };

        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channel_ids {
            self.close_channel(channel_id, ConsumerMessage::ConnectionClosed);
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, state)| state.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.remove_queue(&name);
        }

        debug!(address = %entry.address, forced, "connection closed");
        if forced {
            let _ = entry.events.send(ConnectionEvent::Error(
                "CONNECTION_FORCED - broker forced connection closure".to_string(),
            ));
        }
        let _ = entry.events.send(ConnectionEvent::Closed);
    }

    /// Hand ready messages to eligible consumers, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues,
            channels,
            connections,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        loop {
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let cursor = queue.cursor;
            let consumers = &queue.consumers;
            let chosen = (0..count)
                .map(|offset| (cursor + offset) % count)
                .find(|&index| {
                    let slot = &consumers[index];
                    let Some(channel) = channels.get(&slot.channel_id) else {
                        return false;
                    };
                    if !connections.contains_key(&channel.connection_id) {
                        return false;
                    }
                    if slot.no_ack {
                        return true;
                    }
                    match slot.prefetch {
                        None => true,
                        Some(limit) => {
                            let outstanding = channel
                                .unacked
                                .values()
                                .filter(|entry| entry.consumer_tag == slot.tag)
                                .count();
                            outstanding < usize::from(limit)
                        }
                    }
                });

            let Some(index) = chosen else {
                return;
            };
            queue.cursor = (index + 1) % count;

            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            let slot = &queue.consumers[index];
            let Some(channel) = channels.get_mut(&slot.channel_id) else {
                queue.messages.push_front(message);
                return;
            };

            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;
            let delivery = Delivery::new(
                delivery_tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.content.clone(),
                message.properties.clone(),
            )
            .with_redelivered(message.redelivered);

            if slot.sender.send(ConsumerMessage::Delivery(delivery)).is_err() {
                // Receiver dropped without cancelling; forget the consumer.
                queue.messages.push_front(message);
                queue.remove_consumer(index);
                continue;
            }

            if !slot.no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer_tag: slot.tag.clone(),
                        message,
                    },
                );
            }
        }
    }
}

// ============================================================================
// Broker
// ============================================================================

/// In-process broker.
///
/// Cloning yields another handle to the same broker, so a test can keep one
/// handle for inspection while the session owns another.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    /// Refuse (or stop refusing) connections to an address.
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(address.to_string());
        } else {
            state.unreachable.remove(address);
        }
    }

    /// Force every open connection closed, as a broker restart would.
    /// Returns the number of connections closed.
    pub fn drop_connections(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in &ids {
            state.close_connection(*id, true);
        }
        ids.len()
    }

    /// Force connections to one address closed.
    pub fn drop_connections_to(&self, address: &str) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, entry)| entry.address == address)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.close_connection(*id, true);
        }
        ids.len()
    }

    pub fn connect_attempts(&self) -> Vec<ConnectAttempt> {
        self.lock().connect_attempts.clone()
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ready (not yet delivered) messages in a queue.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|state| state.messages.len())
    }

    /// Delivered but unsettled messages originating from a queue.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|entry| entry.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.lock()
            .queues
            .get(queue)
            .map(|state| state.consumers.len())
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|state| state.kind.clone())
    }

    /// `(queue, pattern)` pairs bound to an exchange.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|state| {
                state
                    .bindings
                    .iter()
                    .map(|binding| (binding.queue.clone(), binding.pattern.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        let reachable = !state.unreachable.contains(address);
        state.connect_attempts.push(ConnectAttempt {
            address: address.to_string(),
            at: Instant::now(),
            succeeded: reachable,
        });

        if !reachable {
            return Err(BrokerError::ConnectionRefused {
                address: address.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let id = state.allocate_id();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        state.connections.insert(
            id,
            ConnectionEntry {
                address: address.to_string(),
                events: events.clone(),
            },
        );
        state.stats.connections_opened += 1;

        Ok(Arc::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            events,
        }))
    }
}

// ============================================================================
// Connection and channel handles
// ============================================================================

struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    events: broadcast::Sender<ConnectionEvent>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = lock_state(&self.state);
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }

        let id = state.allocate_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection_id: self.id,
                prefetch: None,
                next_delivery_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        state.stats.channels_opened += 1;

        Ok(Arc::new(MemoryChannel {
            id,
            connection_id: self.id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock_state(&self.state).close_connection(self.id, false);
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock_state(&self.state).connections.contains_key(&self.id)
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

struct MemoryChannel {
    id: u64,
    connection_id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = lock_state(&self.state);
        state.check_channel(self.id, self.connection_id)?;
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.open_state()?
            .declare_exchange(self.id, name, kind, options)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, BrokerError> {
        self.open_state()?
            .declare_queue(self.id, self.connection_id, name, options)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        self.open_state()?
            .bind_queue(self.id, self.connection_id, queue, exchange, pattern)
    }

    async fn qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = (prefetch > 0).then_some(prefetch);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.open_state()?
            .publish(self.id, exchange, routing_key, content, properties)
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<Consumer, BrokerError> {
        self.open_state()?
            .consume(self.id, self.connection_id, queue, options)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.open_state()?.cancel(self.id, consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.open_state()?.ack(self.id, delivery_tag, multiple)
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.open_state()?
            .nack(self.id, delivery_tag, multiple, requeue)
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, BrokerError> {
        self.open_state()?
            .delete_queue(self.id, self.connection_id, name)
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.open_state()?.delete_exchange(self.id, name)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock_state(&self.state).close_channel(self.id, ConsumerMessage::ChannelClosed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open_state().is_ok()
    }
}
