//! Declaration, consume and publish options.
//!
//! These types mirror the option sets of AMQP 0-9-1 methods. They are plain data:
//! serializable, comparable and hashable through their canonical JSON form so that
//! they can take part in context cache keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Argument and header table. Ordered so that serialization is deterministic.
pub type FieldTable = BTreeMap<String, Value>;

// ============================================================================
// Exchanges
// ============================================================================

/// Exchange type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    /// A plugin-provided exchange type, e.g. `x-consistent-hash`.
    Custom(String),
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
            Self::Custom(kind) => kind,
        }
    }
}

impl AsRef<str> for ExchangeKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "direct" => Self::Direct,
            "fanout" => Self::Fanout,
            "topic" => Self::Topic,
            "headers" => Self::Headers,
            other => Self::Custom(other.to_string()),
        })
    }
}

/// Options for `exchange.declare`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl ExchangeOptions {
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Queues
// ============================================================================

/// Options for `queue.declare`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

impl QueueOptions {
    /// Defaults for a queue with the given name.
    ///
    /// An empty name asks the broker to generate one; such queues are exclusive to
    /// the declaring connection.
    pub fn for_name(name: &str) -> Self {
        Self {
            exclusive: name.is_empty(),
            ..Self::default()
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Consuming
// ============================================================================

/// Options for `basic.consume`, plus the prefetch applied before it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    /// Deliveries are considered settled as soon as they are sent.
    pub no_ack: bool,
    /// Maximum unacknowledged deliveries outstanding for this consumer.
    pub prefetch: Option<u16>,
    pub exclusive: bool,
    /// Broker-generated when absent.
    pub consumer_tag: Option<String>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            no_ack: true,
            prefetch: None,
            exclusive: false,
            consumer_tag: None,
        }
    }
}

impl ConsumeOptions {
    /// Deliveries must be acknowledged explicitly.
    pub fn manual_ack() -> Self {
        Self {
            no_ack: false,
            ..Self::default()
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

// ============================================================================
// Publishing
// ============================================================================

/// Basic properties carried with a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub headers: FieldTable,
    pub persistent: bool,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, as the decimal string the protocol expects.
    pub expiration: Option<String>,
    pub message_id: Option<String>,
}

/// Routing and properties for a single publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Routing key. Ignored by fanout exchanges; the queue name is used when
    /// publishing straight to a queue.
    pub topic: String,
    pub properties: MessageProperties,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.properties.persistent = true;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.properties.expiration = Some(ttl.as_millis().to_string());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }
}

impl From<&str> for PublishOptions {
    fn from(topic: &str) -> Self {
        Self::new().with_topic(topic)
    }
}

impl From<String> for PublishOptions {
    fn from(topic: String) -> Self {
        Self::new().with_topic(topic)
    }
}

// ============================================================================
// Topic filters
// ============================================================================

/// Binding patterns used when a queue is bound to an exchange.
///
/// Accepts a single pattern or a list. An empty filter set binds with the empty
/// pattern, which on a fanout exchange receives everything and on a direct or
/// topic exchange only receives messages published with an empty routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TopicFilters(Vec<String>);

impl TopicFilters {
    pub fn none() -> Self {
        Self::default()
    }

    /// Patterns to bind with; never empty.
    pub fn binding_patterns(&self) -> Vec<&str> {
        if self.0.is_empty() {
            vec![""]
        } else {
            self.0.iter().map(String::as_str).collect()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for TopicFilters {
    fn from(pattern: &str) -> Self {
        Self(vec![pattern.to_string()])
    }
}

impl From<String> for TopicFilters {
    fn from(pattern: String) -> Self {
        Self(vec![pattern])
    }
}

impl From<Vec<String>> for TopicFilters {
    fn from(patterns: Vec<String>) -> Self {
        Self(patterns)
    }
}

impl From<Vec<&str>> for TopicFilters {
    fn from(patterns: Vec<&str>) -> Self {
        Self(patterns.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for TopicFilters {
    fn from(patterns: &[&str]) -> Self {
        Self(patterns.iter().map(|pattern| pattern.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for TopicFilters {
    fn from(patterns: [&str; N]) -> Self {
        Self(patterns.iter().map(|pattern| pattern.to_string()).collect())
    }
}

impl From<Option<&str>> for TopicFilters {
    fn from(pattern: Option<&str>) -> Self {
        pattern.map(Self::from).unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;
