//! Common test utilities for rabbit-session integration tests
//!
//! This module provides:
//! - Sessions wired to a shared in-memory broker
//! - Helpers for reading from subscriptions with timeouts

#![allow(dead_code)]

use rabbit_session::broker::memory::InMemoryBroker;
use rabbit_session::{EndpointList, Message, Session, Subscription};
use std::sync::Arc;
use std::time::Duration;

/// How long a test waits for a message that should arrive.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a test waits before concluding no message is coming.
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Open a session on a single in-memory endpoint.
pub fn open_session(broker: &InMemoryBroker) -> Session {
    open_cluster(broker, &["memory://localhost"])
}

/// Open a session over a failover list of in-memory endpoints.
pub fn open_cluster(broker: &InMemoryBroker, endpoints: &[&str]) -> Session {
    Session::open(
        Arc::new(broker.clone()),
        EndpointList::new(endpoints.iter().copied()).expect("valid endpoints"),
    )
}

/// Next message, failing the test if none arrives in time.
pub async fn receive(subscription: &Subscription) -> Message {
    tokio::time::timeout(RECEIVE_TIMEOUT, subscription.next())
        .await
        .expect("no message arrived in time")
        .expect("subscription ended unexpectedly")
        .expect("subscription reported an error")
}

pub async fn receive_text(subscription: &Subscription) -> String {
    receive(subscription).await.text().expect("UTF-8 body")
}

/// Assert nothing arrives within the quiet period.
pub async fn assert_idle(subscription: &Subscription) {
    let result = tokio::time::timeout(QUIET_PERIOD, subscription.next()).await;
    assert!(result.is_err(), "expected no message, got {:?}", result);
}

/// Collect `count` message bodies in arrival order.
pub async fn receive_texts(subscription: &Subscription, count: usize) -> Vec<String> {
    let mut texts = Vec::with_capacity(count);
    for _ in 0..count {
        texts.push(receive_text(subscription).await);
    }
    texts
}

/// Wait until `condition` holds, failing after the receive timeout.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(RECEIVE_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
