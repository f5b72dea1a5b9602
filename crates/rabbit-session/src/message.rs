//! Received messages.

use crate::broker::Delivery;
use crate::context::Context;
use crate::error::{OperationError, SerializationError, SessionError};
use crate::options::MessageProperties;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// The context a subscription is currently consuming on.
///
/// Shared between a subscription and every message it yields so that a message
/// can tell whether the channel it arrived on is still the live one.
#[derive(Clone, Default)]
pub(crate) struct ActiveContext(Arc<Mutex<Option<Arc<Context>>>>);

impl ActiveContext {
    pub(crate) fn set(&self, context: Arc<Context>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(context);
    }

    pub(crate) fn clear(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn is(&self, context: &Arc<Context>) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, context))
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack { multiple: bool },
    Nack { multiple: bool, requeue: bool },
}

/// A delivery received through a subscription.
///
/// Settling (`ack`/`nack`) only works while the channel the message arrived on is
/// still the subscription's active channel. After a reconnect the delivery tag
/// means nothing to the broker, so settling fails with
/// [`OperationError::StaleDelivery`]; the broker will already have requeued the
/// message.
pub struct Message {
    delivery: Delivery,
    context: Arc<Context>,
    active: ActiveContext,
    no_ack: bool,
}

impl Message {
    pub(crate) fn new(
        delivery: Delivery,
        context: Arc<Context>,
        active: ActiveContext,
        no_ack: bool,
    ) -> Self {
        Self {
            delivery,
            context,
            active,
            no_ack,
        }
    }

    /// Raw body.
    pub fn content(&self) -> &[u8] {
        self.delivery.content()
    }

    pub fn bytes(&self) -> Bytes {
        self.delivery.content().clone()
    }

    /// Body decoded as UTF-8.
    pub fn text(&self) -> Result<String, SerializationError> {
        std::str::from_utf8(self.content())
            .map(str::to_string)
            .map_err(|_| SerializationError::InvalidUtf8)
    }

    /// Body decoded as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        Ok(serde_json::from_slice(self.content())?)
    }

    /// Body parsed as a decimal number.
    pub fn number(&self) -> Result<f64, SerializationError> {
        let text = self.text()?;
        text.trim()
            .parse::<f64>()
            .map_err(|_| SerializationError::InvalidNumber { body: text })
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag()
    }

    pub fn routing_key(&self) -> &str {
        self.delivery.routing_key()
    }

    pub fn exchange(&self) -> &str {
        self.delivery.exchange()
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered()
    }

    pub fn properties(&self) -> &MessageProperties {
        self.delivery.properties()
    }

    /// Queue the message was consumed from.
    pub fn queue(&self) -> Option<&str> {
        self.context.queue_name()
    }

    /// Whether the channel this message arrived on has been replaced.
    pub fn is_stale(&self) -> bool {
        !(self.active.is(&self.context) && self.context.is_open())
    }

    /// Acknowledge this message.
    pub async fn ack(&self) -> Result<(), SessionError> {
        self.settle(Settlement::Ack { multiple: false }).await
    }

    /// Acknowledge this message and every earlier unacknowledged one on the channel.
    pub async fn ack_up_to(&self) -> Result<(), SessionError> {
        self.settle(Settlement::Ack { multiple: true }).await
    }

    /// Reject this message and ask the broker to requeue it.
    pub async fn nack(&self) -> Result<(), SessionError> {
        self.nack_with(false, true).await
    }

    /// Reject with explicit `multiple` and `requeue` flags.
    pub async fn nack_with(&self, multiple: bool, requeue: bool) -> Result<(), SessionError> {
        self.settle(Settlement::Nack { multiple, requeue }).await
    }

    async fn settle(&self, settlement: Settlement) -> Result<(), SessionError> {
        let delivery_tag = self.delivery_tag();

        if self.no_ack {
            return Err(OperationError::AutoAcknowledged { delivery_tag }.into());
        }

        if self.is_stale() {
            warn!(
                delivery_tag,
                ?settlement,
                "cannot settle delivery from a closed channel"
            );
            return Err(OperationError::StaleDelivery { delivery_tag }.into());
        }

        let channel = self.context.channel();
        let result = match settlement {
            Settlement::Ack { multiple } => {
                debug!(delivery_tag, multiple, "channel.ack");
                channel.ack(delivery_tag, multiple).await
            }
            Settlement::Nack { multiple, requeue } => {
                debug!(delivery_tag, multiple, requeue, "channel.nack");
                channel.nack(delivery_tag, multiple, requeue).await
            }
        };

        result.map_err(|source| {
            OperationError::Settle {
                delivery_tag,
                source,
            }
            .into()
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("delivery", &self.delivery)
            .field("no_ack", &self.no_ack)
            .finish()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
