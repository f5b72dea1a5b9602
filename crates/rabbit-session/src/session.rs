//! Session facade and fluent exchange/queue handles.
//!
//! ```rust,no_run
//! use rabbit_session::{EndpointList, ExchangeKind, ExchangeOptions, Session, TopicFilters};
//! use rabbit_session::broker::memory::InMemoryBroker;
//! use rabbit_session::options::ConsumeOptions;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), rabbit_session::SessionError> {
//! let session = Session::open(
//!     Arc::new(InMemoryBroker::new()),
//!     EndpointList::new(["memory://localhost"])?,
//! );
//!
//! let logs = session.exchange("logs", ExchangeKind::Fanout, ExchangeOptions::default());
//! let subscription = logs.queue("").subscribe(ConsumeOptions::default(), TopicFilters::none());
//! logs.publish("hello").await?;
//!
//! if let Some(Ok(message)) = subscription.next().await {
//!     println!("{}", message.text()?);
//! }
//! # Ok(())
//! # }
//! ```

use crate::backoff::BackoffPolicy;
use crate::broker::Broker;
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionManager};
use crate::context::{Context, ContextCache};
use crate::endpoint::EndpointList;
use crate::error::{OperationError, SessionError, TopologyError};
use crate::options::{
    ConsumeOptions, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions, TopicFilters,
};
use crate::pipe::QueuePipe;
use crate::publisher::{self, Payload};
use crate::subscription::{Subscription, SubscriptionState};
use crate::topology::TopologyDescriptor;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

/// Buffered messages per subscription when no prefetch is set.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 64;

/// Entry point to a broker cluster.
///
/// Cheap to clone; clones share connections and contexts. Dropping every handle
/// (including the exchange and queue handles derived from it) shuts it down.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    endpoints: EndpointList,
    connections: Arc<ConnectionManager>,
    contexts: Arc<ContextCache>,
    shutdown: watch::Sender<bool>,
    subscription_buffer: usize,
}

impl Session {
    /// Open a session with default reconnect behaviour.
    ///
    /// Nothing connects until the first operation needs a channel.
    pub fn open(broker: Arc<dyn Broker>, endpoints: EndpointList) -> Self {
        Self::with_settings(
            broker,
            endpoints,
            BackoffPolicy::default(),
            DEFAULT_SUBSCRIPTION_BUFFER,
        )
    }

    /// Open a session from loaded configuration.
    pub fn from_config(broker: Arc<dyn Broker>, config: &SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self::with_settings(
            broker,
            config.endpoint_list()?,
            config.reconnect.to_policy(),
            config.subscription_buffer,
        ))
    }

    pub fn with_settings(
        broker: Arc<dyn Broker>,
        endpoints: EndpointList,
        backoff: BackoffPolicy,
        subscription_buffer: usize,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connections = Arc::new(ConnectionManager::new(
            broker,
            endpoints.clone(),
            backoff,
            shutdown_rx,
        ));
        let contexts = Arc::new(ContextCache::new(Arc::clone(&connections)));

        Self {
            inner: Arc::new(SessionInner {
                endpoints,
                connections,
                contexts,
                shutdown,
                subscription_buffer: subscription_buffer.max(1),
            }),
        }
    }

    pub fn endpoints(&self) -> &EndpointList {
        &self.inner.endpoints
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn contexts(&self) -> &ContextCache {
        &self.inner.contexts
    }

    /// Establish (or return) the shared connection.
    pub async fn connect(&self) -> Result<Connection, SessionError> {
        self.ensure_open()?;
        self.inner.connections.acquire().await
    }

    /// Handle for an exchange. Declared lazily on first use.
    pub fn exchange(
        &self,
        name: impl Into<String>,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> ExchangeHandle {
        let descriptor = self.base_descriptor().with_exchange(name, kind, options);
        ExchangeHandle {
            session: self.clone(),
            descriptor: Arc::new(descriptor),
        }
    }

    /// Handle for a queue on the default exchange, with defaults for its name.
    pub fn queue(&self, name: impl Into<String>) -> QueueHandle {
        let name = name.into();
        let options = QueueOptions::for_name(&name);
        self.queue_with(name, options)
    }

    pub fn queue_with(&self, name: impl Into<String>, options: QueueOptions) -> QueueHandle {
        QueueHandle::new(self.clone(), self.base_descriptor().with_queue(name, options))
    }

    /// Resolve the context for an arbitrary descriptor.
    pub async fn resolve(&self, descriptor: &TopologyDescriptor) -> Result<Arc<Context>, SessionError> {
        self.ensure_open()?;
        self.inner.contexts.resolve(descriptor).await
    }

    /// Stop all subscriptions and close every connection.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.inner.shutdown.send_replace(true) {
            return Ok(());
        }
        info!(endpoints = %self.inner.endpoints, "closing session");
        self.inner.contexts.clear();
        self.inner.connections.close_all().await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn base_descriptor(&self) -> TopologyDescriptor {
        TopologyDescriptor::new(self.inner.endpoints.clone())
    }

    async fn publish(
        &self,
        descriptor: &TopologyDescriptor,
        payload: Payload,
        options: &PublishOptions,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        publisher::publish(&self.inner.contexts, descriptor, payload, options).await
    }
}

// ============================================================================
// ExchangeHandle
// ============================================================================

/// Handle for a declared exchange.
#[derive(Clone)]
pub struct ExchangeHandle {
    session: Session,
    descriptor: Arc<TopologyDescriptor>,
}

impl ExchangeHandle {
    pub fn name(&self) -> &str {
        self.descriptor
            .exchange
            .as_ref()
            .map(|exchange| exchange.name.as_str())
            .unwrap_or_default()
    }

    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }

    /// Queue bound to this exchange, with defaults for its name.
    ///
    /// An empty name gives a broker-named exclusive queue. Anonymous queues with
    /// equal options share one context, and therefore one queue.
    pub fn queue(&self, name: impl Into<String>) -> QueueHandle {
        let name = name.into();
        let options = QueueOptions::for_name(&name);
        self.queue_with(name, options)
    }

    pub fn queue_with(&self, name: impl Into<String>, options: QueueOptions) -> QueueHandle {
        let descriptor = self.descriptor.as_ref().clone().with_queue(name, options);
        QueueHandle::new(self.session.clone(), descriptor)
    }

    /// Publish with an empty routing key.
    pub async fn publish(&self, message: impl Into<Payload>) -> Result<(), SessionError> {
        self.publish_with(message, PublishOptions::default()).await
    }

    /// Publish with a routing key or full options; a `&str` is taken as the topic.
    pub async fn publish_with(
        &self,
        message: impl Into<Payload>,
        options: impl Into<PublishOptions>,
    ) -> Result<(), SessionError> {
        self.session
            .publish(&self.descriptor, message.into(), &options.into())
            .await
    }

    /// Context for this exchange, declaring it if needed.
    pub async fn context(&self) -> Result<Arc<Context>, SessionError> {
        self.session.resolve(&self.descriptor).await
    }

    /// Delete the exchange on the broker.
    ///
    /// Does nothing if this exchange was never declared.
    pub async fn delete(&self) -> Result<(), SessionError> {
        self.session.ensure_open()?;
        let Some(context) = self.session.contexts().peek(&self.descriptor) else {
            return Ok(());
        };
        let name = self.name().to_string();

        debug!(exchange = %name, "channel.deleteExchange");
        context
            .channel()
            .delete_exchange(&name)
            .await
            .map_err(|source| OperationError::Delete { name, source })?;

        self.session.contexts().invalidate(&context);
        Ok(())
    }
}

// ============================================================================
// QueueHandle
// ============================================================================

/// Handle for a declared queue, optionally bound to an exchange.
#[derive(Clone)]
pub struct QueueHandle {
    session: Session,
    descriptor: Arc<TopologyDescriptor>,
    subscription: Arc<Mutex<Option<Subscription>>>,
}

impl QueueHandle {
    fn new(session: Session, descriptor: TopologyDescriptor) -> Self {
        Self {
            session,
            descriptor: Arc::new(descriptor),
            subscription: Arc::new(Mutex::new(None)),
        }
    }

    /// Declared name; empty for a broker-named queue.
    pub fn name(&self) -> &str {
        self.descriptor
            .queue
            .as_ref()
            .map(|queue| queue.name.as_str())
            .unwrap_or_default()
    }

    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }

    /// Publish to this queue's exchange with an empty routing key, or straight to
    /// the queue when it has no exchange.
    pub async fn publish(&self, message: impl Into<Payload>) -> Result<(), SessionError> {
        self.publish_with(message, PublishOptions::default()).await
    }

    pub async fn publish_with(
        &self,
        message: impl Into<Payload>,
        options: impl Into<PublishOptions>,
    ) -> Result<(), SessionError> {
        self.session
            .publish(&self.descriptor, message.into(), &options.into())
            .await
    }

    /// Start consuming from this queue.
    ///
    /// Returns the existing subscription if this handle already has a live one;
    /// options and filters of later calls are then ignored.
    pub fn subscribe(
        &self,
        options: ConsumeOptions,
        filters: impl Into<TopicFilters>,
    ) -> Subscription {
        let mut current = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(subscription) = current.as_ref().filter(|s| !s.is_terminated()) {
            return subscription.clone();
        }

        let capacity = options
            .prefetch
            .map(usize::from)
            .filter(|prefetch| *prefetch > 0)
            .unwrap_or(self.session.inner.subscription_buffer);
        let subscription = Subscription::spawn(
            Arc::clone(&self.session.inner.contexts),
            Arc::clone(&self.descriptor),
            options,
            filters.into(),
            capacity,
            self.session.inner.shutdown.subscribe(),
        );
        *current = Some(subscription.clone());
        subscription
    }

    /// The subscription started by [`QueueHandle::subscribe`], if any.
    pub fn subscription(&self) -> Option<Subscription> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription()
            .map(|subscription| subscription.state())
            .unwrap_or(SubscriptionState::Unbound)
    }

    /// Byte-level duplex adapter over this queue.
    pub fn pipe(&self) -> QueuePipe {
        QueuePipe::new(self.clone())
    }

    /// Context for this queue, declaring it if needed.
    pub async fn context(&self) -> Result<Arc<Context>, SessionError> {
        self.session.resolve(&self.descriptor).await
    }

    /// Delete the queue on the broker and stop this handle's subscription.
    ///
    /// Does nothing on the broker if this queue was never declared.
    pub async fn delete(&self) -> Result<(), SessionError> {
        if let Some(subscription) = self.subscription() {
            subscription.unsubscribe();
        }

        self.session.ensure_open()?;
        let Some(context) = self.session.contexts().peek(&self.descriptor) else {
            return Ok(());
        };
        let name = context
            .queue_name()
            .ok_or_else(|| TopologyError::Invalid {
                message: "descriptor has no queue to delete".to_string(),
            })?
            .to_string();

        debug!(queue = %name, "channel.deleteQueue");
        let purged = context
            .channel()
            .delete_queue(&name)
            .await
            .map_err(|source| OperationError::Delete {
                name: name.clone(),
                source,
            })?;
        info!(queue = %name, purged, "queue deleted");

        self.session.contexts().invalidate(&context);
        Ok(())
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
