//! Integration tests for selective delivery through a direct exchange

mod common;

use common::{assert_idle, open_session, receive, receive_texts};
use rabbit_session::broker::memory::InMemoryBroker;
use rabbit_session::{ConsumeOptions, ExchangeKind, ExchangeOptions, TopicFilters};

/// Verify that each queue receives only the severities it bound
#[tokio::test]
async fn test_direct_routing_by_severity() {
    // Arrange
    let broker = InMemoryBroker::new();
    let session = open_session(&broker);
    let direct = session.exchange("direct_logs", ExchangeKind::Direct, ExchangeOptions::default());

    let queue1 = direct
        .queue("")
        .subscribe(ConsumeOptions::default(), ["info", "warning"]);
    let queue2 = direct
        .queue_with("errors", Default::default())
        .subscribe(ConsumeOptions::default(), ["warning", "error"]);
    queue1.wait_until_bound().await;
    queue2.wait_until_bound().await;

    // Act
    direct.publish_with("hello", "info").await.unwrap();
    direct.publish_with("look out", "warning").await.unwrap();
    direct.publish_with("b0rk", "error").await.unwrap();

    // Assert
    assert_eq!(receive_texts(&queue1, 2).await, vec!["hello", "look out"]);
    assert_eq!(receive_texts(&queue2, 2).await, vec!["look out", "b0rk"]);
    assert_idle(&queue1).await;
    assert_idle(&queue2).await;
}

/// Verify that a subscriber without filters binds the empty key only
#[tokio::test]
async fn test_unfiltered_direct_subscriber_only_gets_empty_key() {
    // Arrange
    let broker = InMemoryBroker::new();
    let session = open_session(&broker);
    let direct = session.exchange("direct_logs", ExchangeKind::Direct, ExchangeOptions::default());
    let subscription = direct
        .queue("")
        .subscribe(ConsumeOptions::default(), TopicFilters::none());
    subscription.wait_until_bound().await;

    // Act
    direct.publish_with("tagged", "info").await.unwrap();
    direct.publish("untagged").await.unwrap();

    // Assert
    let message = receive(&subscription).await;
    assert_eq!(message.text().unwrap(), "untagged");
    assert_eq!(message.routing_key(), "");
    assert_idle(&subscription).await;
}
