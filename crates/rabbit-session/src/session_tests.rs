//! Tests for the session facade.

use super::*;
use crate::broker::memory::InMemoryBroker;
use crate::message::Message;
use std::time::Duration;

fn open(broker: &InMemoryBroker) -> Session {
    Session::open(
        Arc::new(broker.clone()),
        EndpointList::new(["memory://a"]).unwrap(),
    )
}

async fn next(subscription: &Subscription) -> Message {
    tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("no message within timeout")
        .expect("subscription ended")
        .expect("subscription failed")
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    /// Nothing connects until an operation needs a channel.
    #[tokio::test]
    async fn test_open_is_lazy() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let _queue = session.queue("hello");

        assert_eq!(broker.stats().connections_opened, 0);

        let connection = session.connect().await.unwrap();
        assert!(connection.is_open());
        assert_eq!(connection.address(), "memory://a");
        assert_eq!(broker.stats().connections_opened, 1);
    }

    /// Closing ends subscriptions and rejects later operations.
    #[tokio::test]
    async fn test_close_ends_everything() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let queue = session.queue("hello");
        let subscription = queue.subscribe(ConsumeOptions::default(), TopicFilters::none());
        subscription.wait_until_bound().await;

        session.close().await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .unwrap();
        assert!(ended.is_none());
        assert!(session.is_closed());
        assert_eq!(broker.open_connections(), 0);
        assert!(matches!(queue.publish("late").await, Err(SessionError::Closed)));
        assert!(matches!(session.connect().await, Err(SessionError::Closed)));

        // A second close is a no-op.
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_from_config() {
        let broker = InMemoryBroker::new();
        let config = SessionConfig {
            endpoints: vec!["memory://x".to_string(), "memory://y".to_string()],
            ..SessionConfig::default()
        };

        let session = Session::from_config(Arc::new(broker.clone()), &config).unwrap();
        assert_eq!(session.endpoints().len(), 2);
        assert_eq!(session.connect().await.unwrap().address(), "memory://x");

        let invalid = SessionConfig {
            subscription_buffer: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            Session::from_config(Arc::new(broker), &invalid),
            Err(SessionError::Configuration(_))
        ));
    }
}

// ============================================================================
// Exchanges
// ============================================================================

mod exchanges {
    use super::*;

    /// A fanout exchange reaches every bound anonymous queue.
    #[tokio::test]
    async fn test_fanout_publish() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let logs = session.exchange("logs", ExchangeKind::Fanout, ExchangeOptions::default());

        let first = logs
            .queue_with("", QueueOptions::for_name("").with_durable(false))
            .subscribe(ConsumeOptions::default(), TopicFilters::none());
        let second = logs
            .queue_with("second", QueueOptions::default())
            .subscribe(ConsumeOptions::default(), TopicFilters::none());
        first.wait_until_bound().await;
        second.wait_until_bound().await;

        logs.publish("info: hello").await.unwrap();

        assert_eq!(next(&first).await.text().unwrap(), "info: hello");
        assert_eq!(next(&second).await.text().unwrap(), "info: hello");
        assert_eq!(broker.exchange_kind("logs"), Some(ExchangeKind::Fanout));
    }

    /// The routing key comes from the publish options.
    #[tokio::test]
    async fn test_direct_publish_uses_topic() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let direct = session.exchange("direct_logs", ExchangeKind::Direct, ExchangeOptions::default());
        let errors = direct
            .queue("")
            .subscribe(ConsumeOptions::default(), "error");
        errors.wait_until_bound().await;

        direct.publish_with("disk full", "error").await.unwrap();
        direct.publish_with("all good", "info").await.unwrap();

        let message = next(&errors).await;
        assert_eq!(message.text().unwrap(), "disk full");
        assert_eq!(message.routing_key(), "error");
        assert_eq!(message.exchange(), "direct_logs");
    }

    /// Declaring the default exchange by name is refused before any I/O.
    #[tokio::test]
    async fn test_unnamed_exchange_is_invalid() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let exchange = session.exchange("", ExchangeKind::Direct, ExchangeOptions::default());

        let result = exchange.publish("x").await;
        assert!(matches!(
            result,
            Err(SessionError::Topology(TopologyError::Invalid { .. }))
        ));
        assert_eq!(broker.stats().connections_opened, 0);
    }

    #[tokio::test]
    async fn test_delete_exchange() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let exchange = session.exchange("temp", ExchangeKind::Topic, ExchangeOptions::default());

        // Never declared: nothing to do.
        exchange.delete().await.unwrap();
        assert_eq!(broker.stats().connections_opened, 0);

        exchange.context().await.unwrap();
        assert!(broker.exchange_kind("temp").is_some());

        exchange.delete().await.unwrap();
        assert!(broker.exchange_kind("temp").is_none());
        assert!(session.contexts().is_empty());
    }
}

// ============================================================================
// Queues
// ============================================================================

mod queues {
    use super::*;

    /// Publishing on a plain queue handle goes through the default exchange.
    #[tokio::test]
    async fn test_send_to_queue() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let hello = session.queue("hello");

        hello.publish("Hello World!").await.unwrap();
        assert_eq!(broker.queue_depth("hello"), Some(1));

        let subscription = hello.subscribe(ConsumeOptions::default(), TopicFilters::none());
        let message = next(&subscription).await;
        assert_eq!(message.text().unwrap(), "Hello World!");
        assert_eq!(message.routing_key(), "hello");
        assert_eq!(message.queue(), Some("hello"));
    }

    /// Subscribing twice on one handle returns the same stream.
    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let queue = session.queue("jobs");

        let first = queue.subscribe(ConsumeOptions::default(), TopicFilters::none());
        let second = queue.subscribe(ConsumeOptions::manual_ack(), TopicFilters::none());
        first.wait_until_bound().await;

        assert_eq!(broker.consumer_count("jobs"), Some(1));
        assert_eq!(queue.subscription_state(), SubscriptionState::Bound);

        queue.publish("one").await.unwrap();
        assert_eq!(next(&second).await.text().unwrap(), "one");
    }

    /// A terminated subscription is replaced on the next subscribe.
    #[tokio::test]
    async fn test_resubscribe_after_unsubscribe() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let queue = session.queue("jobs");

        let first = queue.subscribe(ConsumeOptions::default(), TopicFilters::none());
        first.wait_until_bound().await;
        first.unsubscribe();
        assert!(first.next().await.is_none());

        let second = queue.subscribe(ConsumeOptions::default(), TopicFilters::none());
        assert_eq!(second.wait_until_bound().await, SubscriptionState::Bound);
        queue.publish("again").await.unwrap();
        assert_eq!(next(&second).await.text().unwrap(), "again");
    }

    #[tokio::test]
    async fn test_delete_queue_ends_subscription() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let queue = session.queue("doomed");
        let subscription = queue.subscribe(ConsumeOptions::default(), TopicFilters::none());
        subscription.wait_until_bound().await;

        queue.delete().await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .unwrap();
        assert!(ended.is_none());
        assert_eq!(broker.queue_depth("doomed"), None);
    }

    /// Publish options reach the consumer as message properties.
    #[tokio::test]
    async fn test_publish_options_reach_consumer() {
        let broker = InMemoryBroker::new();
        let session = open(&broker);
        let queue = session.queue("typed");
        let subscription = queue.subscribe(ConsumeOptions::default(), TopicFilters::none());

        let options = PublishOptions::new()
            .with_content_type("application/json")
            .with_header("x-attempt", 2)
            .persistent();
        queue
            .publish_with(serde_json::json!({"id": 1}), options)
            .await
            .unwrap();

        let message = next(&subscription).await;
        let properties = message.properties();
        assert_eq!(properties.content_type.as_deref(), Some("application/json"));
        assert_eq!(properties.headers.get("x-attempt"), Some(&serde_json::json!(2)));
        assert!(properties.persistent);
        assert_eq!(message.json::<serde_json::Value>().unwrap()["id"], 1);
    }
}
