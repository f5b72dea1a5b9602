//! Publishing.

use crate::context::ContextCache;
use crate::error::{OperationError, SerializationError, SessionError};
use crate::options::PublishOptions;
use crate::topology::TopologyDescriptor;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// A message body before encoding.
///
/// Bytes and text are sent as is; anything else is encoded as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Json(Value),
}

impl Payload {
    /// Encode any serializable value as a JSON payload.
    ///
    /// Fails for values JSON cannot represent, such as maps with non-string keys.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, SerializationError> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    pub fn into_bytes(self) -> Result<Bytes, SerializationError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Text(text) => Ok(Bytes::from(text)),
            Self::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Publish through the context for `descriptor`.
///
/// Messages go to the descriptor's exchange with `options.topic` as routing key,
/// or straight to its queue through the default exchange when there is no
/// exchange. A publish that fails because the channel went away is retried on a
/// fresh context; any other failure is returned.
pub(crate) async fn publish(
    cache: &ContextCache,
    descriptor: &TopologyDescriptor,
    payload: Payload,
    options: &PublishOptions,
) -> Result<(), SessionError> {
    let content = payload.into_bytes()?;

    loop {
        let context = cache.resolve(descriptor).await?;

        let (exchange, routing_key) = match (context.exchange_name(), context.queue_name()) {
            (Some(exchange), _) => (exchange, options.topic.as_str()),
            (None, Some(queue)) => ("", queue),
            (None, None) => ("", options.topic.as_str()),
        };

        debug!(
            exchange,
            routing_key,
            bytes = content.len(),
            "channel.publish"
        );
        match context
            .channel()
            .publish(exchange, routing_key, content.clone(), &options.properties)
            .await
        {
            Ok(()) => return Ok(()),
            Err(err) if err.is_closed() && !context.is_open() => {
                debug!(error = %err, "channel closed during publish, retrying on a new context");
                cache.invalidate(&context);
            }
            Err(err) => return Err(OperationError::Publish(err).into()),
        }
    }
}

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;
