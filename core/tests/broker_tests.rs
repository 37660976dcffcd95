//! End-to-end broker tests over real TCP sockets

use bytes::Bytes;
use futures::future::join_all;
use mqueue::{
    BrokerConfig, BrokerHandle, BrokerServer, Connection, ConnectionError, ErrorCode, Packet,
    RejectReason, Role,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

const T: Duration = Duration::from_secs(5);

async fn start(config: BrokerConfig) -> BrokerHandle {
    BrokerServer::new(config.with_address("127.0.0.1", 0))
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn try_connect(
    addr: SocketAddr,
    role: Role,
) -> Result<Connection<TcpStream>, ConnectionError> {
    let stream = TcpStream::connect(addr).await?;
    let mut conn = Connection::new(0, addr.to_string(), stream, 1024 * 1024);
    let welcome = conn.greet(role, "test", T).await?;
    conn.set_max_message_size(welcome.max_message_size as usize);
    Ok(conn)
}

async fn connect(addr: SocketAddr, role: Role) -> Connection<TcpStream> {
    try_connect(addr, role).await.unwrap()
}

async fn push(conn: &mut Connection<TcpStream>, id: &str, priority: u8, payload: &[u8]) {
    let reply = conn
        .request(
            Packet::Push {
                id: id.to_string(),
                priority,
                delay_ms: 0,
                payload: Bytes::copy_from_slice(payload),
            },
            T,
        )
        .await
        .unwrap();
    assert_eq!(reply, Packet::Accepted { id: id.to_string() });
}

async fn pop(conn: &mut Connection<TcpStream>, wait_ms: u32) -> Packet {
    conn.request(Packet::Pop { wait_ms }, T).await.unwrap()
}

async fn wait_for_active(broker: &BrokerHandle, expected: usize) {
    for _ in 0..200 {
        if broker.active_connections() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "Expected {} active connections, have {}",
        expected,
        broker.active_connections()
    );
}

#[tokio::test]
async fn test_admission_limit_rejects_exactly_the_excess() {
    let limit = 3;
    let broker = start(BrokerConfig {
        max_connections: limit,
        ..Default::default()
    })
    .await;
    let addr = broker.local_addr();

    let attempts = (0..=limit).map(|_| try_connect(addr, Role::Monitor));
    let mut admitted = Vec::new();
    let mut rejected = 0;
    for result in join_all(attempts).await {
        match result {
            Ok(conn) => admitted.push(conn),
            Err(ConnectionError::AdmissionRejected { reason }) => {
                assert_eq!(reason, RejectReason::AdmissionLimit);
                rejected += 1;
            }
            Err(e) => panic!("Expected admission or rejection, got {:?}", e),
        }
    }
    assert_eq!(admitted.len(), limit);
    assert_eq!(rejected, 1);
    assert_eq!(broker.active_connections(), limit);
    assert_eq!(broker.metrics().connections_rejected, 1);

    let mut leaving = admitted.pop().unwrap();
    leaving.send(Packet::Goodbye).await.unwrap();
    leaving.close().await;
    wait_for_active(&broker, limit - 1).await;

    let (first, second) = tokio::join!(
        try_connect(addr, Role::Monitor),
        try_connect(addr, Role::Monitor)
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ConnectionError::AdmissionRejected { .. }))));
    assert_eq!(broker.connections().len(), limit);

    drop(admitted);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_oversize_push_is_refused_and_connection_kept() {
    let broker = start(BrokerConfig {
        max_message_size: 250,
        ..Default::default()
    })
    .await;
    let addr = broker.local_addr();

    // Keeps its own 1 MiB ceiling instead of adopting the announced one.
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut producer = Connection::new(0, addr.to_string(), stream, 1024 * 1024);
    let welcome = producer.greet(Role::Producer, "big", T).await.unwrap();
    assert_eq!(welcome.max_message_size, 250);

    let reply = producer
        .request(
            Packet::Push {
                id: "big".to_string(),
                priority: 0,
                delay_ms: 0,
                payload: Bytes::from(vec![7u8; 300]),
            },
            T,
        )
        .await
        .unwrap();
    match reply {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::MessageTooLarge),
        other => panic!("Expected MessageTooLarge, got {:?}", other),
    }

    push(&mut producer, "small", 0, &[7u8; 250]).await;

    let metrics = broker.metrics();
    assert!(metrics.errors_sent >= 1);
    assert_eq!(metrics.protocol_violations, 0);

    let stats = broker.shutdown().await;
    assert_eq!(stats.accepted, 1);
}

#[tokio::test]
async fn test_fifo_within_priority_and_priority_order() {
    let broker = start(BrokerConfig::default()).await;
    let mut producer = connect(broker.local_addr(), Role::Producer).await;
    let mut consumer = connect(broker.local_addr(), Role::Consumer).await;

    for i in 0..10 {
        push(&mut producer, &format!("low-{}", i), 2, format!("p{}", i).as_bytes()).await;
    }
    push(&mut producer, "urgent", 0, b"now").await;

    let mut order = Vec::new();
    for _ in 0..11 {
        match pop(&mut consumer, 0).await {
            Packet::Deliver {
                id, token, payload, ..
            } => {
                if let Some(n) = id.strip_prefix("low-") {
                    assert_eq!(payload, Bytes::from(format!("p{}", n)));
                }
                let ack = consumer
                    .request(
                        Packet::Ack {
                            id: id.clone(),
                            token,
                            requeue: false,
                            delay_ms: 0,
                        },
                        T,
                    )
                    .await
                    .unwrap();
                assert_eq!(ack, Packet::Acked { id: id.clone() });
                order.push(id);
            }
            other => panic!("Expected Deliver, got {:?}", other),
        }
    }

    let mut expected = vec!["urgent".to_string()];
    expected.extend((0..10).map(|i| format!("low-{}", i)));
    assert_eq!(order, expected);
    assert_eq!(pop(&mut consumer, 0).await, Packet::Empty);

    let stats = broker.shutdown().await;
    assert_eq!(stats.accepted, 11);
    assert_eq!(stats.completed, 11);
}

#[tokio::test]
async fn test_waiting_consumer_gets_later_push() {
    let broker = start(BrokerConfig::default()).await;
    let addr = broker.local_addr();
    let mut consumer = connect(addr, Role::Consumer).await;

    let waiting = tokio::spawn(async move {
        let reply = pop(&mut consumer, 3_000).await;
        (consumer, reply)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut producer = connect(addr, Role::Producer).await;
    push(&mut producer, "late", 0, b"hello").await;

    let (_consumer, reply) = waiting.await.unwrap();
    match reply {
        Packet::Deliver { id, attempt, .. } => {
            assert_eq!(id, "late");
            assert_eq!(attempt, 1);
        }
        other => panic!("Expected Deliver, got {:?}", other),
    }
    broker.shutdown().await;
}

#[tokio::test]
async fn test_unacked_delivery_redelivered_then_failed() {
    let broker = start(BrokerConfig {
        max_retries: 1,
        ack_timeout_ms: 150,
        monitor_period_ms: 20,
        ..Default::default()
    })
    .await;
    let addr = broker.local_addr();
    let mut producer = connect(addr, Role::Producer).await;
    let mut consumer = connect(addr, Role::Consumer).await;
    let mut monitor = connect(addr, Role::Monitor).await;

    push(&mut producer, "slow", 0, b"work").await;

    let first = pop(&mut consumer, 0).await;
    assert!(matches!(first, Packet::Deliver { attempt: 1, .. }));

    match pop(&mut consumer, 2_000).await {
        Packet::Deliver { id, attempt, .. } => {
            assert_eq!(id, "slow");
            assert_eq!(attempt, 2);
        }
        other => panic!("Expected redelivery, got {:?}", other),
    }

    // Second timeout exhausts the budget.
    tokio::time::sleep(Duration::from_millis(400)).await;
    match monitor.request(Packet::Count, T).await.unwrap() {
        Packet::Counts(counts) => {
            assert_eq!(counts.failed, 1);
            assert_eq!(counts.active, 0);
        }
        other => panic!("Expected Counts, got {:?}", other),
    }
    assert_eq!(
        monitor
            .request(Packet::ListFailed { limit: 10 }, T)
            .await
            .unwrap(),
        Packet::Failed {
            ids: vec!["slow".to_string()],
            truncated: false
        }
    );
    assert_eq!(
        monitor
            .request(
                Packet::EraseFailed {
                    ids: vec!["slow".to_string()]
                },
                T
            )
            .await
            .unwrap(),
        Packet::Erased {
            ids: vec!["slow".to_string()]
        }
    );

    let stats = broker.shutdown().await;
    assert_eq!(stats.accepted, stats.completed + stats.erased);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_consumer_disconnect_returns_delivery() {
    let broker = start(BrokerConfig::default()).await;
    let addr = broker.local_addr();
    let mut producer = connect(addr, Role::Producer).await;
    push(&mut producer, "m", 0, b"x").await;

    let mut first = connect(addr, Role::Consumer).await;
    assert!(matches!(pop(&mut first, 0).await, Packet::Deliver { .. }));
    drop(first);

    let mut second = connect(addr, Role::Consumer).await;
    match pop(&mut second, 2_000).await {
        Packet::Deliver { id, attempt, .. } => {
            assert_eq!(id, "m");
            assert_eq!(attempt, 2);
        }
        other => panic!("Expected Deliver, got {:?}", other),
    }
    broker.shutdown().await;
}

#[tokio::test]
async fn test_stale_token_rejected() {
    let broker = start(BrokerConfig::default()).await;
    let addr = broker.local_addr();
    let mut producer = connect(addr, Role::Producer).await;
    let mut consumer = connect(addr, Role::Consumer).await;
    push(&mut producer, "m", 0, b"x").await;

    let token = match pop(&mut consumer, 0).await {
        Packet::Deliver { token, .. } => token,
        other => panic!("Expected Deliver, got {:?}", other),
    };
    let reply = consumer
        .request(
            Packet::Ack {
                id: "m".to_string(),
                token: token + 100,
                requeue: false,
                delay_ms: 0,
            },
            T,
        )
        .await
        .unwrap();
    match reply {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidToken),
        other => panic!("Expected Error, got {:?}", other),
    }
    broker.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_rejects_push() {
    let broker = start(BrokerConfig {
        queue_capacity: 2,
        ..Default::default()
    })
    .await;
    let mut producer = connect(broker.local_addr(), Role::Producer).await;
    push(&mut producer, "a", 0, b"").await;
    push(&mut producer, "b", 0, b"").await;

    let reply = producer
        .request(
            Packet::Push {
                id: "c".to_string(),
                priority: 0,
                delay_ms: 0,
                payload: Bytes::new(),
            },
            T,
        )
        .await
        .unwrap();
    match reply {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::QueueFull),
        other => panic!("Expected Error, got {:?}", other),
    }
    broker.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_dropped_after_handshake_timeout() {
    let broker = start(BrokerConfig {
        handshake_timeout_ms: 100,
        ..Default::default()
    })
    .await;
    let mut raw = TcpStream::connect(broker.local_addr()).await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(T, raw.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0)) || read.is_err());
    wait_for_active(&broker, 0).await;
    assert_eq!(broker.metrics().handshake_failures, 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections_and_listener() {
    let broker = start(BrokerConfig {
        shutdown_grace_ms: 1_000,
        ..Default::default()
    })
    .await;
    let addr = broker.local_addr();
    let mut consumer = connect(addr, Role::Consumer).await;
    consumer.send(Packet::Pop { wait_ms: 60_000 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(T, broker.shutdown()).await.unwrap();

    match consumer.receive_timeout(T).await {
        Ok(Packet::Error { code, .. }) => assert_eq!(code, ErrorCode::ShuttingDown),
        other => panic!("Expected ShuttingDown, got {:?}", other),
    }
    assert!(matches!(
        consumer.receive_timeout(T).await,
        Err(ConnectionError::Closed)
    ));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_bind_conflict_reported() {
    let broker = start(BrokerConfig::default()).await;
    let port = broker.local_addr().port();

    let second = BrokerServer::new(BrokerConfig::default().with_address("127.0.0.1", port))
        .unwrap()
        .start()
        .await;
    assert!(matches!(second, Err(mqueue::MqError::Bind { .. })));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_refused() {
    let result = BrokerServer::new(BrokerConfig {
        max_connections: 0,
        ..Default::default()
    });
    assert!(matches!(result, Err(mqueue::MqError::Config(_))));
}
