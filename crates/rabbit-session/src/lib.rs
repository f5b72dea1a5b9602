//! # Rabbit Session
//!
//! A resilient session layer over an AMQP 0-9-1 broker.
//!
//! This library provides:
//! - One shared connection per endpoint list, re-established with capped
//!   exponential backoff and failover across endpoints
//! - A cache of declared channels ("contexts") keyed by the topology they declare
//! - Subscriptions that survive connection loss without the caller noticing
//! - A fluent exchange/queue API and a byte-stream adapter
//!
//! ## Module Organization
//!
//! - [`session`] - [`Session`], [`ExchangeHandle`] and [`QueueHandle`]
//! - [`connection`] - connection acquisition and failover
//! - [`context`] - the context cache
//! - [`subscription`] and [`message`] - consuming and settling messages
//! - [`broker`] - the broker client traits and their implementations
//! - [`config`] - file and environment configuration
//!
//! ## Example
//!
//! ```rust
//! use rabbit_session::broker::memory::InMemoryBroker;
//! use rabbit_session::{ConsumeOptions, EndpointList, Session, TopicFilters};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), rabbit_session::SessionError> {
//! let session = Session::open(
//!     Arc::new(InMemoryBroker::new()),
//!     EndpointList::new(["memory://localhost"])?,
//! );
//!
//! let hello = session.queue("hello");
//! let subscription = hello.subscribe(ConsumeOptions::default(), TopicFilters::none());
//! hello.publish("Hello World!").await?;
//!
//! let message = subscription.next().await.expect("stream ended")?;
//! assert_eq!(message.text()?, "Hello World!");
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod broker;
pub mod config;
pub mod connection;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod options;
pub mod pipe;
pub mod publisher;
pub mod session;
pub mod subscription;
pub mod topology;

pub use backoff::BackoffPolicy;
pub use broker::{Broker, BrokerChannel, BrokerConnection, BrokerError};
pub use config::{ReconnectConfig, SessionConfig};
pub use connection::{Connection, ConnectionManager, ConnectionState};
pub use context::{Context, ContextCache};
pub use endpoint::EndpointList;
pub use error::{
    ConfigurationError, OperationError, SerializationError, SessionError, TopologyError,
};
pub use message::Message;
pub use options::{
    ConsumeOptions, ExchangeKind, ExchangeOptions, MessageProperties, PublishOptions,
    QueueOptions, TopicFilters,
};
pub use pipe::QueuePipe;
pub use publisher::Payload;
pub use session::{ExchangeHandle, QueueHandle, Session};
pub use subscription::{Subscription, SubscriptionState};
pub use topology::TopologyDescriptor;

#[cfg(feature = "amqp")]
pub use broker::amqp::AmqpBroker;
