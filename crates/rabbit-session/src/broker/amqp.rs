//! Broker client over AMQP 0-9-1, backed by `lapin`.
//!
//! Deliveries from a `lapin` consumer are forwarded by a spawned task into the
//! channel-based [`Consumer`] the session layer reads from. Connection errors
//! reported by `lapin` become [`ConnectionEvent`]s.

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, Consumer,
    ConsumerMessage, Delivery,
};
use crate::options::{
    ConsumeOptions, ExchangeKind, ExchangeOptions, FieldTable, MessageProperties, QueueOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use serde_json::{Number, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const REPLY_SUCCESS: u16 = 200;
const EVENT_CAPACITY: usize = 16;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Opens `lapin` connections.
#[derive(Clone, Default)]
pub struct AmqpBroker {
    properties: ConnectionProperties,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = lapin::Connection::connect(address, self.properties.clone())
            .await
            .map_err(|err| BrokerError::ConnectionRefused {
                address: address.to_string(),
                message: err.to_string(),
            })?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sender = events.clone();
        connection.on_error(move |err| {
            let _ = sender.send(ConnectionEvent::Error(err.to_string()));
            let _ = sender.send(ConnectionEvent::Closed);
        });

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            events,
        }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
    events: broadcast::Sender<ConnectionEvent>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.inner.create_channel().await.map_err(map_error)?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let result = self.inner.close(REPLY_SUCCESS, "OK").await.map_err(map_error);
        let _ = self.events.send(ConnectionEvent::Closed);
        result
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let declare = ExchangeDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(
                name,
                exchange_kind(kind),
                declare,
                field_table(&options.arguments),
            )
            .await
            .map_err(map_error)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, BrokerError> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .inner
            .queue_declare(name, declare, field_table(&options.arguments))
            .await
            .map_err(map_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &content,
                basic_properties(properties),
            )
            .await
            .map_err(map_error)?
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<Consumer, BrokerError> {
        let consume = BasicConsumeOptions {
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            ..BasicConsumeOptions::default()
        };
        let tag = options.consumer_tag.clone().unwrap_or_default();
        let mut stream = self
            .inner
            .basic_consume(queue, &tag, consume, lapin::types::FieldTable::default())
            .await
            .map_err(map_error)?;

        let tag = stream.tag().as_str().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = self.inner.clone();
        let consumer_tag = tag.clone();

        tokio::spawn(async move {
            let mut failed = false;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(delivery) => {
                        if sender
                            .send(ConsumerMessage::Delivery(convert_delivery(delivery)))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(consumer_tag = %consumer_tag, error = %err, "consumer stream failed");
                        failed = true;
                        break;
                    }
                }
            }

            let notice = end_of_stream_notice(failed, channel.status().connected());
            debug!(consumer_tag = %consumer_tag, ?notice, "consumer stream ended");
            let _ = sender.send(notice);
        });

        Ok(Consumer::new(tag, receiver))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(map_error)
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(map_error)
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, BrokerError> {
        self.inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(map_error)
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(map_error)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "OK").await.map_err(map_error)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// What a consumer learns when its delivery stream ends.
///
/// A stream that ended on an error lost its transport, whatever the channel
/// status says at that moment. Only a clean end on a connected channel is a
/// broker-side cancel.
fn end_of_stream_notice(failed: bool, channel_connected: bool) -> ConsumerMessage {
    if !failed && channel_connected {
        ConsumerMessage::Cancelled
    } else {
        ConsumerMessage::ChannelClosed
    }
}

/// Dead transports map to the closed variants; everything else, including
/// channel-closing refusals, is reported as a protocol error.
fn map_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            BrokerError::ConnectionClosed
        }
        other => BrokerError::Protocol(other.to_string()),
    }
}

fn exchange_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name.clone()),
    }
}

fn field_table(table: &FieldTable) -> lapin::types::FieldTable {
    let mut converted = lapin::types::FieldTable::default();
    for (key, value) in table {
        converted.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    converted
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(integer), _) => AMQPValue::LongLongInt(integer),
            (None, Some(float)) => AMQPValue::Double(float),
            (None, None) => AMQPValue::LongString(LongString::from(number.to_string())),
        },
        Value::String(text) => AMQPValue::LongString(LongString::from(text.clone())),
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Void => Value::Null,
        AMQPValue::Boolean(flag) => Value::Bool(*flag),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::Float(n) => float_value(f64::from(*n)),
        AMQPValue::Double(n) => float_value(*n),
        AMQPValue::ShortString(text) => Value::String(text.as_str().to_string()),
        AMQPValue::LongString(text) => {
            Value::String(String::from_utf8_lossy(text.as_bytes()).into_owned())
        }
        other => Value::String(format!("{:?}", other)),
    }
}

fn float_value(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(field_table(&properties.headers));
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    basic
}

fn message_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    MessageProperties {
        content_type: text(basic.content_type()),
        headers: basic
            .headers()
            .as_ref()
            .map(|headers| {
                headers
                    .inner()
                    .iter()
                    .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
                    .collect()
            })
            .unwrap_or_default(),
        persistent: *basic.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        expiration: text(basic.expiration()),
        message_id: text(basic.message_id()),
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        Bytes::from(delivery.data),
        message_properties(&delivery.properties),
    )
    .with_redelivered(delivery.redelivered)
}

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;
