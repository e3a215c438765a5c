use std::sync::Arc;
use std::time::Duration;

use livesync::handle::{HandleState, TransportHandle};
use livesync::livecore::ClientEvent;
use livesync::livecore::types::GroupId;
use livesync::transport::mock::{MockPushStreamFactory, MockTransportFactory};
use livesync::ConnectionError;

fn handle(factory: &MockTransportFactory) -> Arc<TransportHandle> {
    let _ = env_logger::builder().is_test(true).try_init();
    TransportHandle::new(
        Arc::new(factory.clone()),
        Arc::new(MockPushStreamFactory::new()),
    )
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_create_one_transport() {
    let factory = MockTransportFactory::new().with_connect_delay(Duration::from_millis(100));
    let handle = handle(&factory);

    let mut attempts = Vec::new();
    for _ in 0..5 {
        let handle = handle.clone();
        attempts.push(tokio::spawn(async move { handle.connect("token").await }));
    }
    for attempt in attempts {
        assert_eq!(attempt.await.unwrap(), Ok(()));
    }

    assert_eq!(factory.created(), 1);
    assert_eq!(factory.credentials(), vec!["token".to_string()]);
    assert_eq!(handle.state(), HandleState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_share_a_failed_attempt() {
    let factory = MockTransportFactory::new().with_connect_delay(Duration::from_millis(100));
    factory.fail_next("unauthorized");
    let handle = handle(&factory);

    let (a, b) = tokio::join!(handle.connect("token"), handle.connect("token"));
    assert!(matches!(a, Err(ConnectionError::Network(_))));
    assert_eq!(a, b);
    assert_eq!(factory.created(), 1);

    // No internal retry: the next call is a new attempt.
    assert_eq!(handle.connect("token").await, Ok(()));
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_missing_credential_never_dials() {
    let factory = MockTransportFactory::new();
    let handle = handle(&factory);

    assert_eq!(
        handle.connect("").await,
        Err(ConnectionError::MissingCredential)
    );
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_queued_emits_flush_in_order_after_connect() {
    let factory = MockTransportFactory::new();
    let handle = handle(&factory);

    for group in 1..=3 {
        handle.emit(&ClientEvent::join_room(GroupId(group))).unwrap();
    }
    assert!(factory.sent_frames().is_empty());

    handle.connect("token").await.unwrap();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    let groups: Vec<i64> = factory
        .sent_events()
        .iter()
        .map(|(_, payload)| payload["ChatGroupId"].as_i64().unwrap())
        .collect();
    assert_eq!(groups, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_close_during_connect_fails_waiters() {
    let factory = MockTransportFactory::new().with_connect_delay(Duration::from_millis(100));
    let handle = handle(&factory);

    let connecting = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.connect("token").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state(), HandleState::Connecting);

    handle.close().await;
    assert_eq!(connecting.await.unwrap(), Err(ConnectionError::Closed));
    assert_eq!(handle.state(), HandleState::Closed);
}
