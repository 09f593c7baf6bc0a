use super::*;
use crate::broker::MockBroker;
use crate::config::FailoverConfig;
use std::time::Duration;

fn config(urls: &[&str]) -> Arc<ClientConfig> {
    let mut config = ClientConfig::with_urls(urls.iter().copied());
    config.failover = FailoverConfig::immediate();
    Arc::new(config)
}

fn supervisor(broker: &MockBroker, urls: &[&str]) -> Arc<ConnectionSupervisor> {
    ConnectionSupervisor::new(config(urls), broker.connector(), ReplyRegistry::new())
}

async fn wait_for_status(supervisor: &ConnectionSupervisor, expected: LinkStatus) {
    for _ in 0..200 {
        if supervisor.status().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("supervisor never reached {:?}", expected);
}

#[test]
fn test_cursor_walks_candidates_then_exhausts() {
    let mut cursor = FailoverCursor::new(3);
    assert_eq!(cursor.on_connect_failed(0), Failover::Next(1));
    assert_eq!(cursor.on_connect_failed(1), Failover::Next(2));
    assert_eq!(cursor.on_connect_failed(2), Failover::Exhausted);
}

#[test]
fn test_cursor_single_candidate_is_terminal() {
    let mut cursor = FailoverCursor::new(1);
    assert_eq!(cursor.on_connect_failed(0), Failover::Exhausted);
}

#[test]
fn test_cursor_failure_count_bounds_walk() {
    let mut cursor = FailoverCursor::new(2);
    assert_eq!(cursor.on_connect_failed(0), Failover::Next(1));
    // Same index reported again still counts toward the bound
    assert_eq!(cursor.on_connect_failed(0), Failover::Exhausted);
}

#[tokio::test]
async fn test_connect_fails_over_to_next_endpoint() {
    let broker = MockBroker::new();
    broker.refuse("amqp://u1", "connection refused");
    let supervisor = supervisor(&broker, &["amqp://u1", "amqp://u2"]);

    let session = supervisor.connect().await.unwrap();

    assert_eq!(session.url, "amqp://u2");
    assert_eq!(broker.connect_attempts(), vec!["amqp://u1", "amqp://u2"]);
    assert_eq!(supervisor.status().await, LinkStatus::Ready);
}

#[tokio::test]
async fn test_connect_exhausts_every_endpoint() {
    let broker = MockBroker::new();
    broker.refuse("amqp://u1", "refused one");
    broker.refuse("amqp://u2", "refused two");
    broker.refuse("amqp://u3", "refused three");
    let supervisor = supervisor(&broker, &["amqp://u1", "amqp://u2", "amqp://u3"]);

    let err = supervisor.connect().await.err().unwrap();

    match err {
        ClientError::Connection(cause) => assert!(cause.contains("refused three")),
        other => panic!("expected connection error, got {:?}", other),
    }
    assert_eq!(broker.connect_attempts().len(), 3);
    assert!(matches!(supervisor.status().await, LinkStatus::Failed(_)));
}

#[tokio::test]
async fn test_connect_after_failure_starts_over() {
    let broker = MockBroker::new();
    broker.refuse("amqp://u1", "down");
    let supervisor = supervisor(&broker, &["amqp://u1"]);

    assert!(supervisor.connect().await.is_err());
    broker.accept("amqp://u1");

    assert!(supervisor.connect().await.is_ok());
    assert_eq!(broker.connect_attempts().len(), 2);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker, &["amqp://u1"]);

    let (a, b, c) = tokio::join!(
        supervisor.connect(),
        supervisor.connect(),
        supervisor.connect()
    );

    let a = a.unwrap();
    assert!(Arc::ptr_eq(&a, &b.unwrap()));
    assert!(Arc::ptr_eq(&a, &c.unwrap()));
    assert_eq!(broker.connect_attempts().len(), 1);
    assert_eq!(broker.operations().iter().filter(|op| op.starts_with("consume")).count(), 1);
}

#[tokio::test]
async fn test_ready_session_is_reused() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker, &["amqp://u1"]);

    let first = supervisor.connect().await.unwrap();
    let second = supervisor.connect().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn test_setup_runs_in_order_before_ready() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker, &["amqp://u1"]);

    supervisor.connect().await.unwrap();

    assert_eq!(
        broker.operations(),
        vec![
            "assert_queue:default",
            "prefetch:1:false",
            "consume:amq.rabbitmq.reply-to"
        ]
    );
}

#[tokio::test]
async fn test_disconnect_tears_down_session() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker, &["amqp://u1"]);
    supervisor.connect().await.unwrap();
    let connection = broker.last_connection().unwrap();
    let channel = broker.last_channel().unwrap();

    connection.disconnect("connection reset");
    wait_for_status(&supervisor, LinkStatus::Absent).await;

    assert!(connection.is_closed());
    assert!(channel.is_closed());

    // Next connect rebuilds from scratch
    supervisor.connect().await.unwrap();
    assert_eq!(broker.connection_count(), 2);
}

#[tokio::test]
async fn test_channel_loss_tears_down_session() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker, &["amqp://u1"]);
    supervisor.connect().await.unwrap();
    let connection = broker.last_connection().unwrap();

    broker.last_channel().unwrap().broker_close("PRECONDITION_FAILED");
    wait_for_status(&supervisor, LinkStatus::Absent).await;

    assert!(connection.is_closed());
    supervisor.connect().await.unwrap();
    assert_eq!(broker.connection_count(), 2);
}

#[tokio::test]
async fn test_error_event_keeps_session() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker, &["amqp://u1"]);
    let session = supervisor.connect().await.unwrap();

    broker.last_connection().unwrap().emit_error("channel hiccup");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(supervisor.status().await, LinkStatus::Ready);
    let again = supervisor.connect().await.unwrap();
    assert!(Arc::ptr_eq(&session, &again));
}

#[tokio::test]
async fn test_stale_teardown_is_ignored() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker, &["amqp://u1"]);
    let first = supervisor.connect().await.unwrap();

    broker.last_connection().unwrap().disconnect("gone");
    wait_for_status(&supervisor, LinkStatus::Absent).await;
    let second = supervisor.connect().await.unwrap();
    assert_ne!(first.generation, second.generation);

    supervisor.teardown(first.generation).await;

    assert_eq!(supervisor.status().await, LinkStatus::Ready);
    assert!(!broker.last_channel().unwrap().is_closed());
}

#[tokio::test]
async fn test_disconnect_during_setup_fails_attempt() {
    let broker = MockBroker::new();
    broker.disconnect_during_setup(Some("socket closed"));
    let supervisor = supervisor(&broker, &["amqp://u1"]);

    let err = supervisor.connect().await.err().unwrap();

    assert!(matches!(err, ClientError::Connection(ref cause) if cause == "socket closed"));
    assert!(broker.last_connection().unwrap().is_closed());
    assert!(matches!(supervisor.status().await, LinkStatus::Failed(_)));
}

#[tokio::test]
async fn test_missing_observers_do_not_block_setup() {
    let broker = MockBroker::new();
    broker.silence_observers(true);
    let supervisor = supervisor(&broker, &["amqp://u1"]);

    assert!(supervisor.connect().await.is_ok());
    assert_eq!(supervisor.status().await, LinkStatus::Ready);
}

#[tokio::test]
async fn test_setup_failure_closes_connection() {
    let broker = MockBroker::new();
    broker.fail_assert(Some("PRECONDITION_FAILED"));
    let supervisor = supervisor(&broker, &["amqp://u1"]);

    let err = supervisor.connect().await.err().unwrap();

    assert!(matches!(err, ClientError::ChannelSetup(_)));
    assert!(broker.last_connection().unwrap().is_closed());
    assert!(!broker.operations().iter().any(|op| op.starts_with("consume")));
}

#[tokio::test]
async fn test_close_returns_to_absent() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker, &["amqp://u1"]);
    supervisor.connect().await.unwrap();

    supervisor.close().await;

    assert_eq!(supervisor.status().await, LinkStatus::Absent);
    assert!(broker.last_connection().unwrap().is_closed());
}
