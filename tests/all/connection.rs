use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rabbit_lot::pool::{ConnectionManager, ConnectionRole, Error, RetryPolicy};
use tokio::time::Instant;

use crate::helpers::{ConnectFailure, FakeBroker};

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_on_a_cold_cache_connect_exactly_once() {
    // Arrange
    let broker = FakeBroker::with_connect_latency(Duration::from_millis(100));
    let connections = ConnectionManager::new(broker.clone(), RetryPolicy::default());

    // Act
    let acquired = join_all((0..10).map(|_| connections.acquire(ConnectionRole::Consumer))).await;

    // Assert
    assert_eq!(broker.connect_attempts(), 1);
    let acquired: Vec<_> = acquired.into_iter().map(Result::unwrap).collect();
    assert!(acquired.iter().all(|c| Arc::ptr_eq(c, &acquired[0])));
}

#[tokio::test]
async fn roles_get_their_own_connection() {
    let broker = FakeBroker::default();
    let connections = ConnectionManager::new(broker.clone(), RetryPolicy::default());

    let consumer = connections.acquire(ConnectionRole::Consumer).await.unwrap();
    let publisher = connections.acquire(ConnectionRole::Publisher).await.unwrap();
    let consumer_again = connections.acquire(ConnectionRole::Consumer).await.unwrap();

    assert_eq!(broker.connect_attempts(), 2);
    assert!(!Arc::ptr_eq(&consumer, &publisher));
    assert!(Arc::ptr_eq(&consumer, &consumer_again));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_exponential_backoff() {
    // Arrange
    let broker = FakeBroker::default();
    broker.fail_next_connects([ConnectFailure::Refused, ConnectFailure::Unreachable]);
    let connections = ConnectionManager::new(broker.clone(), RetryPolicy::new(5, 2).unwrap());
    let start = Instant::now();

    // Act
    let connection = connections.acquire(ConnectionRole::Publisher).await;

    // Assert
    assert!(connection.is_ok());
    assert_eq!(broker.connect_attempts(), 3);
    // 2^1 + 2^2 seconds
    assert!(start.elapsed() >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn fatal_failures_are_not_retried_and_nothing_is_cached() {
    let broker = FakeBroker::default();
    broker.fail_next_connects([ConnectFailure::Fatal]);
    let connections = ConnectionManager::new(broker.clone(), RetryPolicy::default());

    let outcome = connections.acquire(ConnectionRole::Consumer).await;

    match outcome {
        Err(Error::ConnectionEstablishmentFailure { role, attempts, .. }) => {
            assert_eq!(role, ConnectionRole::Consumer);
            assert_eq!(attempts, 1);
        }
        Err(e) => panic!("Unexpected error: {e}"),
        Ok(_) => panic!("The connection should have failed"),
    }
    assert_eq!(broker.connect_attempts(), 1);

    // The next acquire starts from scratch.
    assert!(connections.acquire(ConnectionRole::Consumer).await.is_ok());
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn giving_up_after_the_retry_budget_is_exhausted() {
    let broker = FakeBroker::default();
    broker.fail_next_connects([ConnectFailure::Refused; 5]);
    let connections = ConnectionManager::new(broker.clone(), RetryPolicy::new(2, 2).unwrap());

    let outcome = connections.acquire(ConnectionRole::Publisher).await;

    assert!(matches!(
        outcome,
        Err(Error::ConnectionEstablishmentFailure { attempts: 3, .. })
    ));
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test]
async fn a_closed_connection_is_replaced_on_the_next_acquire() {
    let broker = FakeBroker::default();
    let connections = ConnectionManager::new(broker.clone(), RetryPolicy::default());
    let first = connections.acquire(ConnectionRole::Consumer).await.unwrap();

    broker.close_connections();
    let second = connections.acquire(ConnectionRole::Consumer).await.unwrap();

    assert_eq!(broker.connect_attempts(), 2);
    assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn a_broker_shutdown_marks_the_connection_for_replacement() {
    let broker = FakeBroker::default();
    let connections = ConnectionManager::new(broker.clone(), RetryPolicy::default());
    let first = connections.acquire(ConnectionRole::Publisher).await.unwrap();

    broker.shut_down_connections("CONNECTION_FORCED - broker forced connection closure");
    // Reconnection is lazy.
    assert_eq!(broker.connect_attempts(), 1);
    let second = connections.acquire(ConnectionRole::Publisher).await.unwrap();

    assert_eq!(broker.connect_attempts(), 2);
    assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test(start_paused = true)]
async fn cancelling_an_acquire_during_backoff_releases_the_role_lock() {
    // Arrange
    let broker = FakeBroker::default();
    broker.fail_next_connects([ConnectFailure::Refused]);
    let connections = ConnectionManager::new(broker.clone(), RetryPolicy::new(3, 10).unwrap());

    // Act - the first retry waits 10 seconds
    let cancelled = tokio::time::timeout(
        Duration::from_secs(1),
        connections.acquire(ConnectionRole::Consumer),
    )
    .await;

    // Assert
    assert!(cancelled.is_err());
    assert_eq!(broker.connect_attempts(), 1);
    let connection = tokio::time::timeout(
        Duration::from_secs(1),
        connections.acquire(ConnectionRole::Consumer),
    )
    .await;
    assert!(matches!(connection, Ok(Ok(_))));
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn a_stalled_role_does_not_block_the_other() {
    let broker = FakeBroker::default();
    broker.fail_next_connects([ConnectFailure::Refused]);
    let connections = Arc::new(ConnectionManager::new(
        broker.clone(),
        RetryPolicy::new(3, 30).unwrap(),
    ));

    // The consumer connection is now backing off for 30 seconds.
    let stalled = tokio::spawn({
        let connections = Arc::clone(&connections);
        async move { connections.acquire(ConnectionRole::Consumer).await.map(|_| ()) }
    });
    while broker.connect_attempts() == 0 {
        tokio::task::yield_now().await;
    }

    let publisher = tokio::time::timeout(
        Duration::from_secs(1),
        connections.acquire(ConnectionRole::Publisher),
    )
    .await;

    assert!(matches!(publisher, Ok(Ok(_))));
    assert!(!stalled.is_finished());
    stalled.abort();
}
