//! Tests for connection management.

use super::*;
use crate::broker::memory::InMemoryBroker;
use crate::broker::MockBroker;
use std::time::Duration;

fn manager_for(
    broker: Arc<dyn Broker>,
    endpoints: &[&str],
) -> (Arc<ConnectionManager>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = ConnectionManager::new(
        broker,
        EndpointList::new(endpoints.iter().copied()).unwrap(),
        BackoffPolicy::default(),
        shutdown_rx,
    );
    (Arc::new(manager), shutdown_tx)
}

/// Concurrent callers share a single connection attempt.
#[tokio::test]
async fn test_concurrent_acquires_share_one_connection() {
    let broker = InMemoryBroker::new();
    let (manager, _shutdown) = manager_for(Arc::new(broker.clone()), &["memory://a"]);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire().await.unwrap().id() })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(broker.stats().connections_opened, 1);
    assert_eq!(manager.state("memory://a"), Some(ConnectionState::Connected));
}

/// Failed attempts move to the next endpoint after 500ms, then 1000ms.
#[tokio::test(start_paused = true)]
async fn test_failover_rotates_with_backoff() {
    let broker = InMemoryBroker::new();
    broker.set_unreachable("memory://a", true);
    broker.set_unreachable("memory://b", true);
    let (manager, _shutdown) = manager_for(
        Arc::new(broker.clone()),
        &["memory://a", "memory://b", "memory://c"],
    );

    let connection = manager.acquire().await.unwrap();
    assert_eq!(connection.address(), "memory://c");

    let attempts = broker.connect_attempts();
    let addresses: Vec<&str> = attempts.iter().map(|a| a.address.as_str()).collect();
    assert_eq!(addresses, vec!["memory://a", "memory://b", "memory://c"]);
    assert_eq!(attempts[1].at - attempts[0].at, Duration::from_millis(500));
    assert_eq!(attempts[2].at - attempts[1].at, Duration::from_millis(1000));

    assert_eq!(manager.state("memory://a"), None);
    assert_eq!(manager.state("memory://b"), None);
}

/// Rotation wraps around the list until an endpoint comes back.
#[tokio::test(start_paused = true)]
async fn test_rotation_wraps_around() {
    let broker = InMemoryBroker::new();
    broker.set_unreachable("memory://a", true);
    broker.set_unreachable("memory://b", true);
    let (manager, _shutdown) =
        manager_for(Arc::new(broker.clone()), &["memory://a", "memory://b"]);

    let pending = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire().await })
    };

    // Attempts happen at 0, 0.5s, 1.5s, 3.5s and 7.5s.
    tokio::time::sleep(Duration::from_secs(2)).await;
    broker.set_unreachable("memory://a", false);

    let connection = pending.await.unwrap().unwrap();
    assert_eq!(connection.address(), "memory://a");

    let addresses: Vec<String> = broker
        .connect_attempts()
        .into_iter()
        .map(|attempt| attempt.address)
        .collect();
    assert_eq!(
        addresses,
        vec!["memory://a", "memory://b", "memory://a", "memory://b", "memory://a"]
    );
}

/// A closed connection is dropped from the registry and replaced on demand.
#[tokio::test]
async fn test_reconnects_after_close() {
    let broker = InMemoryBroker::new();
    let (manager, _shutdown) = manager_for(Arc::new(broker.clone()), &["memory://a"]);

    let first = manager.acquire().await.unwrap();
    broker.drop_connections();
    tokio::time::timeout(Duration::from_secs(1), first.closed())
        .await
        .unwrap();

    assert_eq!(first.state(), ConnectionState::Closed);
    assert!(!first.is_open());
    assert!(manager.current().is_none());

    let second = manager.acquire().await.unwrap();
    assert_ne!(first.id(), second.id());
    assert!(second.is_open());
    assert_eq!(broker.stats().connections_opened, 2);
}

/// Shutting down ends an acquire that is stuck retrying.
#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_retries() {
    let mut broker = MockBroker::new();
    broker.expect_connect().returning(|address| {
        Err(BrokerError::ConnectionRefused {
            address: address.to_string(),
            message: "connection refused".to_string(),
        })
    });
    let (manager, shutdown) = manager_for(Arc::new(broker), &["amqp://nowhere"]);

    let pending = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire().await })
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown.send_replace(true);

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SessionError::Closed)));
    assert_eq!(manager.state("amqp://nowhere"), None);
}

/// Closing everything marks connections closed and empties the registry.
#[tokio::test]
async fn test_close_all() {
    let broker = InMemoryBroker::new();
    let (manager, _shutdown) = manager_for(Arc::new(broker.clone()), &["memory://a"]);

    let connection = manager.acquire().await.unwrap();
    manager.close_all().await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(manager.state("memory://a"), None);
}
