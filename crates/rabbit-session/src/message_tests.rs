//! Tests for received messages.

use super::*;
use crate::backoff::BackoffPolicy;
use crate::broker::memory::InMemoryBroker;
use crate::broker::ConsumerMessage;
use crate::connection::ConnectionManager;
use crate::context::ContextCache;
use crate::endpoint::EndpointList;
use crate::options::{ConsumeOptions, QueueOptions};
use crate::topology::TopologyDescriptor;
use tokio::sync::watch;

struct Fixture {
    broker: InMemoryBroker,
    context: Arc<Context>,
    active: ActiveContext,
    _shutdown: watch::Sender<bool>,
}

async fn fixture() -> Fixture {
    let broker = InMemoryBroker::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let endpoints = EndpointList::new(["memory://a"]).unwrap();
    let manager = ConnectionManager::new(
        Arc::new(broker.clone()),
        endpoints.clone(),
        BackoffPolicy::default(),
        shutdown_rx,
    );
    let cache = ContextCache::new(Arc::new(manager));
    let descriptor = TopologyDescriptor::new(endpoints).with_queue("inbox", QueueOptions::default());
    let context = cache.resolve(&descriptor).await.unwrap();

    let active = ActiveContext::default();
    active.set(Arc::clone(&context));

    Fixture {
        broker,
        context,
        active,
        _shutdown: shutdown,
    }
}

async fn receive(fixture: &Fixture, body: &'static [u8], no_ack: bool) -> Message {
    let channel = fixture.context.channel();
    let options = ConsumeOptions {
        no_ack,
        ..ConsumeOptions::default()
    };
    let mut consumer = channel.consume("inbox", &options).await.unwrap();
    channel
        .publish("", "inbox", Bytes::from_static(body), &MessageProperties::default())
        .await
        .unwrap();

    match consumer.recv().await {
        Some(ConsumerMessage::Delivery(delivery)) => Message::new(
            delivery,
            Arc::clone(&fixture.context),
            fixture.active.clone(),
            no_ack,
        ),
        other => panic!("expected a delivery, got {:?}", other),
    }
}

mod decoding {
    use super::*;

    #[tokio::test]
    async fn test_text_json_and_number() {
        let fixture = fixture().await;

        let message = receive(&fixture, br#"{"id": 3}"#, true).await;
        assert_eq!(message.text().unwrap(), r#"{"id": 3}"#);
        let value: serde_json::Value = message.json().unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(message.queue(), Some("inbox"));
        assert_eq!(message.routing_key(), "inbox");
        assert_eq!(message.exchange(), "");

        let message = receive(&fixture, b" 42.5 ", true).await;
        assert_eq!(message.number().unwrap(), 42.5);
    }

    #[tokio::test]
    async fn test_decoding_failures() {
        let fixture = fixture().await;

        let message = receive(&fixture, &[0xff, 0xfe], true).await;
        assert!(matches!(message.text(), Err(SerializationError::InvalidUtf8)));

        let message = receive(&fixture, b"not a number", true).await;
        assert!(matches!(
            message.number(),
            Err(SerializationError::InvalidNumber { .. })
        ));
        assert!(matches!(
            message.json::<serde_json::Value>(),
            Err(SerializationError::Json(_))
        ));
    }
}

mod settlement {
    use super::*;

    #[tokio::test]
    async fn test_ack_settles_on_the_active_channel() {
        let fixture = fixture().await;
        let message = receive(&fixture, b"job", false).await;
        assert_eq!(fixture.broker.unacked_count("inbox"), 1);

        message.ack().await.unwrap();
        assert_eq!(fixture.broker.unacked_count("inbox"), 0);
        assert_eq!(fixture.broker.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_nack_requeues_by_default() {
        let fixture = fixture().await;
        let message = receive(&fixture, b"job", false).await;

        message.nack().await.unwrap();
        assert_eq!(fixture.broker.stats().nacked, 1);
    }

    #[tokio::test]
    async fn test_no_ack_messages_cannot_be_settled() {
        let fixture = fixture().await;
        let message = receive(&fixture, b"job", true).await;

        let result = message.ack().await;
        assert!(matches!(
            result,
            Err(SessionError::Operation(OperationError::AutoAcknowledged { .. }))
        ));
    }

    #[tokio::test]
    async fn test_settling_after_channel_replacement_fails() {
        let fixture = fixture().await;
        let message = receive(&fixture, b"job", false).await;
        assert!(!message.is_stale());

        fixture.active.clear();

        assert!(message.is_stale());
        let result = message.ack().await;
        assert!(matches!(
            result,
            Err(SessionError::Operation(OperationError::StaleDelivery { .. }))
        ));
        assert_eq!(fixture.broker.unacked_count("inbox"), 1);
    }

    #[tokio::test]
    async fn test_settling_after_connection_loss_fails() {
        let fixture = fixture().await;
        let message = receive(&fixture, b"job", false).await;

        fixture.broker.drop_connections();

        let result = message.nack_with(false, false).await;
        assert!(matches!(
            result,
            Err(SessionError::Operation(OperationError::StaleDelivery { .. }))
        ));
        // The broker requeued it when the connection went away.
        assert_eq!(fixture.broker.queue_depth("inbox"), Some(1));
    }
}
