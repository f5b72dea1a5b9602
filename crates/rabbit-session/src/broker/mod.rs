//! Broker client boundary.
//!
//! The session layer does not speak the wire protocol. Everything it needs from a
//! broker client is expressed by the traits in this module:
//!
//! - [`Broker`] opens connections to an address
//! - [`BrokerConnection`] opens channels and reports asynchronous close/error events
//! - [`BrokerChannel`] declares topology, publishes, consumes and settles deliveries
//!
//! Two implementations ship with the crate: [`memory::InMemoryBroker`], a faithful
//! in-process model of the AMQP semantics the session relies on, and (with the
//! `amqp` feature) `amqp::AmqpBroker`, which drives a real broker through `lapin`.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod routing;

use crate::options::{
    ConsumeOptions, ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// AMQP reply codes used when the broker rejects an operation.
pub mod reply_code {
    pub const ACCESS_REFUSED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RESOURCE_LOCKED: u16 = 405;
    pub const PRECONDITION_FAILED: u16 = 406;
    pub const NOT_ALLOWED: u16 = 530;
    pub const COMMAND_INVALID: u16 = 503;
}

/// Failure reported by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Connection to '{address}' failed: {message}")]
    ConnectionRefused { address: String, message: String },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Broker rejected the operation ({code}): {text}")]
    Rejected { code: u16, text: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether the failure means the connection or channel is gone, as opposed to
    /// the broker refusing the operation itself.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. } | Self::ConnectionClosed | Self::ChannelClosed
        )
    }

    pub(crate) fn rejected(code: u16, text: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            text: text.into(),
        }
    }
}

/// Asynchronous notification emitted by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection reported an error. It may or may not be followed by `Closed`.
    Error(String),
    /// The connection is closed; no further events follow.
    Closed,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    content: Bytes,
    properties: MessageProperties,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        content: Bytes,
        properties: MessageProperties,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered: false,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            content,
            properties,
        }
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Channel-scoped tag used to settle this delivery.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before without it being acknowledged.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Exchange the message was originally published to. Empty for the default exchange.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }
}

/// Events received by a [`Consumer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerMessage {
    Delivery(Delivery),
    /// The broker cancelled the consumer, e.g. because its queue was deleted.
    Cancelled,
    /// The channel the consumer was registered on closed.
    ChannelClosed,
    /// The connection carrying the consumer's channel closed.
    ConnectionClosed,
}

/// A registered consumer and the stream of its deliveries.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    receiver: mpsc::UnboundedReceiver<ConsumerMessage>,
}

impl Consumer {
    pub fn new(tag: impl Into<String>, receiver: mpsc::UnboundedReceiver<ConsumerMessage>) -> Self {
        Self {
            tag: tag.into(),
            receiver,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Next event, or `None` once the broker side has dropped the consumer.
    pub async fn recv(&mut self) -> Option<ConsumerMessage> {
        self.receiver.recv().await
    }
}

/// Entry point of a broker client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection to the given address.
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// An open connection to a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Close the connection. Emits [`ConnectionEvent::Closed`] to subscribers.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    /// Subscribe to close and error events. Events emitted before the call are not replayed.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// A channel on a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError>;

    /// Declare a queue and return its actual name, which the broker generates
    /// when `name` is empty.
    async fn declare_queue(&self, name: &str, options: &QueueOptions)
        -> Result<String, BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries for consumers registered afterwards.
    async fn qos(&self, prefetch: u16) -> Result<(), BrokerError>;

    /// Publish and wait until the broker has accepted the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, options: &ConsumeOptions)
        -> Result<Consumer, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), BrokerError>;

    /// Delete a queue, returning the number of messages it held.
    async fn delete_queue(&self, name: &str) -> Result<u32, BrokerError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}
