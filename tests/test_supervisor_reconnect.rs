//! Connection supervisor behaviour against the in-memory broker
//!
//! Time is paused in every test, so multi-second retry pauses complete
//! instantly while still being observable through `tokio::time::Instant`.

use amqp_relay::config::RelayConfig;
use amqp_relay::testing::{HostBehavior, MockBroker};
use amqp_relay::transport::amqp::topology::QueueSpec;
use amqp_relay::transport::amqp::{ConnectionSupervisor, Publisher, SessionState};
use amqp_relay::transport::{BrokerChannel, BrokerError};
use amqp_relay::RelayError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

fn supervisor(broker: &MockBroker, hosts: &str) -> Arc<ConnectionSupervisor<MockBroker>> {
    let mut config = RelayConfig::default();
    config.broker.hosts = hosts.to_string();
    Arc::new(ConnectionSupervisor::from_config(broker.clone(), &config))
}

#[tokio::test(start_paused = true)]
async fn test_hosts_are_swept_in_order_with_pause_between_sweeps() {
    let broker = MockBroker::new();
    broker.refuse_host("a:5672").await;
    broker
        .set_host_behavior("b:5672", HostBehavior::AcceptAfter(1))
        .await;

    let start = Instant::now();
    let handle = supervisor(&broker, "a:5672,b:5672").acquire().await;

    assert_eq!(
        broker.dial_log().await,
        vec!["a:5672", "b:5672", "a:5672", "b:5672"]
    );
    assert_eq!(broker.accepted_hosts().await, vec!["b:5672"]);
    assert!(
        start.elapsed() >= Duration::from_millis(1000),
        "a failed sweep should pause before the next one"
    );
    assert_eq!(handle.generation(), 1);
    assert!(handle.is_live());
}

#[tokio::test(start_paused = true)]
async fn test_first_accepting_host_wins() {
    let broker = MockBroker::new();

    let handle = supervisor(&broker, "a:5672,b:5672").acquire().await;

    assert_eq!(broker.dial_log().await, vec!["a:5672"]);
    assert_eq!(handle.session().connection.host(), "a:5672");
}

#[tokio::test(start_paused = true)]
async fn test_acquire_blocks_until_a_broker_accepts() {
    let broker = MockBroker::refusing().await;
    let supervisor = supervisor(&broker, "a:5672");

    let pending = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.acquire().await }
    });

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(!pending.is_finished(), "acquire must not give up");
    assert_eq!(supervisor.status().state, SessionState::Dialing);
    assert_eq!(supervisor.status().generation, 0);
    assert!(broker.dial_log().await.len() >= 4);

    broker.accept_host("a:5672").await;

    let handle = timeout(Duration::from_secs(5), pending)
        .await
        .expect("acquire should finish once the broker accepts")
        .expect("acquire task should not panic");
    assert_eq!(handle.wait_until_live().await, 1);
    assert_eq!(broker.open_connections().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_declare_failure_restarts_from_dialing() {
    let broker = MockBroker::new();
    broker.fail_next_declaration("restRetryQueue").await;

    let handle = supervisor(&broker, "a:5672").acquire().await;

    // The first connection is closed and a fresh one is dialed
    assert_eq!(broker.accepted_hosts().await.len(), 2);
    assert_eq!(broker.open_connections().await, 1);
    assert_eq!(handle.generation(), 1);

    assert!(broker.queue("restRetryQueue").await.is_some());
    assert_eq!(broker.bindings().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_inequivalent_existing_queue_keeps_supervisor_retrying() {
    let broker = MockBroker::new();
    broker
        .predeclare_queue(QueueSpec {
            name: "restRetryQueue".to_string(),
            durable: true,
            dead_letter_exchange: None,
            message_ttl_ms: Some(5000),
        })
        .await;
    let supervisor = supervisor(&broker, "a:5672");

    let pending = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.acquire().await }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!pending.is_finished());
    assert_eq!(supervisor.status().generation, 0);
    assert_ne!(supervisor.status().state, SessionState::Live);
    assert!(broker.accepted_hosts().await.len() >= 3);
    assert!(broker.open_connections().await <= 1);

    pending.abort();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_each_close_with_single_watcher() {
    let broker = MockBroker::new();
    let handle = supervisor(&broker, "a:5672").acquire().await;
    let mut status = handle.subscribe_status();

    for cycle in 1..=3u64 {
        let closed = broker.close_all_connections("CONNECTION_FORCED").await;
        assert_eq!(closed, 1);

        timeout(
            Duration::from_secs(10),
            status.wait_for(|s| s.state == SessionState::Live && s.generation == cycle + 1),
        )
        .await
        .expect("supervisor should reconnect")
        .expect("status channel should stay open");
    }

    let metrics = handle.metrics();
    assert_eq!(metrics.reconnects, 3);
    assert_eq!(metrics.armed_watchers, 1);
    assert_eq!(metrics.generation, 4);
    assert_eq!(handle.generation(), 4);
    assert_eq!(broker.open_connections().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_for_broker_to_return() {
    let broker = MockBroker::new();
    let handle = supervisor(&broker, "a:5672").acquire().await;

    broker.refuse_host("a:5672").await;
    broker.close_all_connections("node down").await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_ne!(handle.status().state, SessionState::Live);
    assert_eq!(handle.generation(), 1);

    broker.accept_host("a:5672").await;
    let mut status = handle.subscribe_status();
    let generation = timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.state == SessionState::Live && s.generation == 2),
    )
    .await
    .expect("supervisor should reconnect once the host accepts")
    .expect("status channel should stay open")
    .generation;

    assert_eq!(generation, 2);
    assert_eq!(handle.metrics().armed_watchers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_acquire_shares_one_session() {
    let broker = MockBroker::new();
    let supervisor = supervisor(&broker, "a:5672");

    let (first, second) = tokio::join!(supervisor.acquire(), supervisor.acquire());
    let third = supervisor.acquire().await;

    assert_eq!(broker.accepted_hosts().await, vec!["a:5672"]);
    assert_eq!(broker.open_connections().await, 1);
    assert_eq!(supervisor.metrics().armed_watchers, 1);
    for handle in [&first, &second, &third] {
        assert_eq!(handle.generation(), 1);
    }

    broker.close_all_connections("failover").await;
    let mut status = third.subscribe_status();
    status
        .wait_for(|s| s.state == SessionState::Live && s.generation == 2)
        .await
        .unwrap();

    assert_eq!(first.generation(), 2);
    assert_eq!(second.generation(), 2);
    assert_eq!(supervisor.metrics().reconnects, 1);
    assert_eq!(broker.open_connections().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_topology_redeclared_idempotently_after_reconnect() {
    let broker = MockBroker::new();
    let handle = supervisor(&broker, "a:5672").acquire().await;
    let first_pass = broker.declaration_log().await;

    broker.close_all_connections("restart").await;
    let mut status = handle.subscribe_status();
    status
        .wait_for(|s| s.state == SessionState::Live && s.generation == 2)
        .await
        .unwrap();

    let log = broker.declaration_log().await;
    assert_eq!(log.len(), first_pass.len() * 2);
    assert_eq!(&log[first_pass.len()..], first_pass.as_slice());
    assert_eq!(broker.exchange_names().await.len(), 3);
    assert_eq!(broker.queue_names().await.len(), 2);
    assert_eq!(broker.bindings().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_channel_fails_and_handle_recovers() {
    let broker = MockBroker::new();
    broker
        .predeclare_queue(QueueSpec {
            name: "discord".to_string(),
            durable: true,
            dead_letter_exchange: None,
            message_ttl_ms: None,
        })
        .await;
    let handle = supervisor(&broker, "a:5672").acquire().await;
    let publisher = Publisher::new(handle.clone(), "restRequests");
    let stale = handle.channel();

    broker.close_all_connections("failover").await;
    let mut status = handle.subscribe_status();
    status
        .wait_for(|s| s.state == SessionState::Live && s.generation == 2)
        .await
        .unwrap();

    let result = stale.publish("", "discord", b"late", "text/plain").await;
    assert!(matches!(result, Err(BrokerError::ChannelClosed(_))));

    publisher.send_to_discord("after failover").await.unwrap();
    let messages = broker.queue_messages("discord").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, b"after failover");
}

#[tokio::test(start_paused = true)]
async fn test_publish_on_closed_session_is_retryable() {
    let broker = MockBroker::new();
    let handle = supervisor(&broker, "a:5672").acquire().await;
    let publisher = Publisher::new(handle.clone(), "restRequests");

    // Keep the supervisor from swapping in a new session
    broker.refuse_host("a:5672").await;
    broker.close_all_connections("gone").await;

    let err = publisher.send_to_discord("lost").await.unwrap_err();
    assert!(matches!(err, RelayError::Broker(BrokerError::ChannelClosed(_))));
    assert!(err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_reconnecting() {
    let broker = MockBroker::new();
    let handle = supervisor(&broker, "a:5672").acquire().await;

    handle.shutdown().await;
    assert_eq!(broker.open_connections().await, 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(broker.accepted_hosts().await.len(), 1);
    assert_eq!(handle.metrics().reconnects, 0);
}
