//! Integration tests for rejecting and requeueing deliveries

mod common;

use common::{assert_idle, eventually, open_session, receive};
use rabbit_session::broker::memory::InMemoryBroker;
use rabbit_session::{ConsumeOptions, OperationError, SessionError, TopicFilters};
use tokio_test::assert_err;

/// Verify a nacked message comes back marked as redelivered
#[tokio::test]
async fn test_nack_requeues_and_marks_redelivered() {
    // Arrange
    let broker = InMemoryBroker::new();
    let session = open_session(&broker);
    let queue = session.queue("retries");
    let subscription = queue.subscribe(ConsumeOptions::manual_ack(), TopicFilters::none());
    subscription.wait_until_bound().await;
    queue.publish("flaky job").await.unwrap();

    // Act
    let first = receive(&subscription).await;
    first.nack().await.unwrap();
    let second = receive(&subscription).await;

    // Assert
    assert!(!first.redelivered());
    assert!(second.redelivered());
    assert_eq!(second.text().unwrap(), "flaky job");

    second.ack().await.unwrap();
    assert_eq!(broker.unacked_count("retries"), 0);
    assert_eq!(broker.stats().nacked, 1);
}

/// Verify rejecting without requeue discards the message
#[tokio::test]
async fn test_nack_without_requeue_discards() {
    // Arrange
    let broker = InMemoryBroker::new();
    let session = open_session(&broker);
    let queue = session.queue("poison");
    let subscription = queue.subscribe(ConsumeOptions::manual_ack(), TopicFilters::none());
    subscription.wait_until_bound().await;
    queue.publish("bad input").await.unwrap();

    // Act
    let message = receive(&subscription).await;
    message.nack_with(false, false).await.unwrap();

    // Assert
    assert_idle(&subscription).await;
    assert_eq!(broker.queue_depth("poison"), Some(0));
    assert_eq!(broker.unacked_count("poison"), 0);
}

/// Verify a multiple nack requeues every earlier delivery in order
#[tokio::test]
async fn test_multiple_nack_requeues_in_order() {
    // Arrange
    let broker = InMemoryBroker::new();
    let session = open_session(&broker);
    let queue = session.queue("batch");
    let subscription = queue.subscribe(
        ConsumeOptions::manual_ack().with_prefetch(3),
        TopicFilters::none(),
    );
    subscription.wait_until_bound().await;
    for body in ["one", "two", "three"] {
        queue.publish(body).await.unwrap();
    }
    let _one = receive(&subscription).await;
    let _two = receive(&subscription).await;
    let three = receive(&subscription).await;

    // Act
    three.nack_with(true, true).await.unwrap();

    // Assert
    let mut redelivered = Vec::new();
    for _ in 0..3 {
        let message = receive(&subscription).await;
        assert!(message.redelivered());
        redelivered.push(message.text().unwrap());
    }
    assert_eq!(redelivered, vec!["one", "two", "three"]);
}

/// Verify settling an automatically acknowledged message is refused
#[tokio::test]
async fn test_settling_auto_acknowledged_message_fails() {
    // Arrange
    let broker = InMemoryBroker::new();
    let session = open_session(&broker);
    let queue = session.queue("fire-and-forget");
    let subscription = queue.subscribe(ConsumeOptions::default(), TopicFilters::none());
    queue.publish("done").await.unwrap();

    // Act
    let message = receive(&subscription).await;
    let result = message.ack().await;

    // Assert
    let err = assert_err!(result);
    assert!(matches!(
        err,
        SessionError::Operation(OperationError::AutoAcknowledged { .. })
    ));
    eventually(|| broker.unacked_count("fire-and-forget") == 0).await;
}
