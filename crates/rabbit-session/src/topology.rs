//! Topology descriptors and binding.
//!
//! A [`TopologyDescriptor`] names everything a context needs declared: the
//! endpoints, an optional exchange and an optional queue. Its canonical JSON form
//! is the context cache key, so two descriptors that serialize the same share one
//! channel.

use crate::context::Context;
use crate::endpoint::EndpointList;
use crate::error::{SerializationError, SessionError, TopologyError};
use crate::options::{ExchangeKind, ExchangeOptions, QueueOptions, TopicFilters};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub options: ExchangeOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSpec {
    /// Empty for a broker-named queue.
    pub name: String,
    pub options: QueueOptions,
}

/// What a context declares when it is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyDescriptor {
    pub endpoints: EndpointList,
    pub exchange: Option<ExchangeSpec>,
    pub queue: Option<QueueSpec>,
}

impl TopologyDescriptor {
    pub fn new(endpoints: EndpointList) -> Self {
        Self {
            endpoints,
            exchange: None,
            queue: None,
        }
    }

    pub fn with_exchange(
        mut self,
        name: impl Into<String>,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Self {
        self.exchange = Some(ExchangeSpec {
            name: name.into(),
            kind,
            options,
        });
        self
    }

    pub fn with_queue(mut self, name: impl Into<String>, options: QueueOptions) -> Self {
        self.queue = Some(QueueSpec {
            name: name.into(),
            options,
        });
        self
    }

    /// Cache key: the descriptor serialized as JSON.
    pub fn canonical_key(&self) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reject descriptors no broker would accept.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if let Some(exchange) = &self.exchange {
            if exchange.name.is_empty() {
                return Err(TopologyError::Invalid {
                    message: "the default exchange cannot be declared; use a queue handle to \
                              publish to a queue directly"
                        .to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Bind the context's queue to its exchange once per topic filter.
///
/// Does nothing unless the context has both an exchange and a queue.
pub async fn bind_topics(context: &Context, filters: &TopicFilters) -> Result<(), SessionError> {
    let (Some(exchange), Some(queue)) = (context.exchange_name(), context.queue_name()) else {
        return Ok(());
    };

    for pattern in filters.binding_patterns() {
        debug!(queue, exchange, pattern, "channel.bindQueue");
        context
            .channel()
            .bind_queue(queue, exchange, pattern)
            .await
            .map_err(|source| TopologyError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
                source,
            })?;
    }

    Ok(())
}

#[cfg(test)]
#[path = "topology_tests.rs"]
mod tests;
