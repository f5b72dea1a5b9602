//! Error types for session operations.
//!
//! Connection failures never appear here. The connection manager retries them
//! forever with backoff and only logs them; callers just observe a delay.

use crate::broker::BrokerError;
use thiserror::Error;

/// Error returned by every fallible session, handle, subscription and message operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session has been closed")]
    Closed,

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Operation failed: {0}")]
    Operation(#[from] OperationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl SessionError {
    /// Check whether the failure was caused by a connection or channel going away.
    ///
    /// Transient failures are retried internally by the publisher and by
    /// subscriptions. Everything else is surfaced to the caller as is.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Closed => false,
            Self::Topology(err) => err.is_transient(),
            Self::Serialization(_) => false,
            Self::Operation(err) => err.is_transient(),
            Self::Configuration(_) => false,
        }
    }
}

/// The broker refused to declare or bind part of a topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Declaration of exchange '{name}' failed: {source}")]
    ExchangeDeclare { name: String, source: BrokerError },

    #[error("Declaration of queue '{name}' failed: {source}")]
    QueueDeclare { name: String, source: BrokerError },

    #[error("Binding queue '{queue}' to exchange '{exchange}' with pattern '{pattern}' failed: {source}")]
    Bind {
        queue: String,
        exchange: String,
        pattern: String,
        source: BrokerError,
    },

    #[error("Invalid topology: {message}")]
    Invalid { message: String },
}

impl TopologyError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ExchangeDeclare { source, .. } => source.is_closed(),
            Self::QueueDeclare { source, .. } => source.is_closed(),
            Self::Bind { source, .. } => source.is_closed(),
            Self::Invalid { .. } => false,
        }
    }
}

/// Encoding or decoding of a message body failed.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Message body '{body}' is not a number")]
    InvalidNumber { body: String },
}

/// A broker operation on an established channel failed.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Opening a channel failed: {0}")]
    ChannelOpen(#[source] BrokerError),

    #[error("Publish failed: {0}")]
    Publish(#[source] BrokerError),

    #[error("Registering consumer failed: {0}")]
    Consume(#[source] BrokerError),

    #[error("Settling delivery {delivery_tag} failed: {source}")]
    Settle { delivery_tag: u64, source: BrokerError },

    #[error("Delivery {delivery_tag} belongs to a channel that no longer exists")]
    StaleDelivery { delivery_tag: u64 },

    #[error("Delivery {delivery_tag} was consumed without acknowledgements")]
    AutoAcknowledged { delivery_tag: u64 },

    #[error("Deleting '{name}' failed: {source}")]
    Delete { name: String, source: BrokerError },
}

impl OperationError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ChannelOpen(source) => source.is_closed(),
            Self::Publish(source) => source.is_closed(),
            Self::Consume(source) => source.is_closed(),
            Self::Settle { .. } => false,
            Self::StaleDelivery { .. } => false,
            Self::AutoAcknowledged { .. } => false,
            Self::Delete { .. } => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
