//! Remote peering over TCP: supervisor retries and end-to-end replication.

use std::time::Duration;
use tokio::time::{sleep, timeout};
use weft_core::{Endpoint, PeerPhase, StatusKind};
use weft_model::Data;

async fn connected(endpoint: &Endpoint) -> bool {
    endpoint
        .peers()
        .await
        .unwrap()
        .iter()
        .any(|p| p.phase == PeerPhase::Connected)
}
use weft_store::{BackendOptions, BackendType};

/// Reserve a local port by binding and immediately releasing it.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn test_supervisor_retries_until_server_appears() {
    let port = free_port().await;

    let mut a = Endpoint::new();
    let mut a_out = a.outgoing_status().unwrap();
    a.peer_remotely("127.0.0.1", port, Duration::from_millis(100))
        .await
        .unwrap();

    // First the supervisor announces itself, then every failed attempt
    // surfaces as a disconnect.
    let event = timeout(Duration::from_secs(1), a_out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, StatusKind::Initializing);
    let event = timeout(Duration::from_secs(1), a_out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, StatusKind::Disconnected);

    // Bring the server up; the next retry window must establish.
    sleep(Duration::from_millis(300)).await;
    let b = Endpoint::new();
    b.listen(&format!("127.0.0.1:{port}")).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        assert!(!remaining.is_zero(), "no Established status before deadline");
        let event = timeout(remaining, a_out.recv()).await.unwrap().unwrap();
        match event.kind {
            StatusKind::Established => break,
            StatusKind::Disconnected => continue,
            other => panic!("unexpected status {other:?}"),
        }
    }

    // The handshake identified the real peer on both sides.
    for _ in 0..100 {
        if connected(&a).await && connected(&b).await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("peer tables never converged");
}

#[tokio::test]
async fn test_single_attempt_with_zero_retry() {
    let port = free_port().await;

    let mut a = Endpoint::new();
    let mut a_out = a.outgoing_status().unwrap();
    a.peer_remotely("127.0.0.1", port, Duration::ZERO)
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), a_out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, StatusKind::Initializing);
    let event = timeout(Duration::from_secs(1), a_out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, StatusKind::Disconnected);

    // No further attempts follow.
    sleep(Duration::from_millis(400)).await;
    assert!(a_out.try_recv().is_err());
}

#[tokio::test]
async fn test_replication_over_tcp() {
    let b = Endpoint::new();
    let addr = b.listen("127.0.0.1:0").await.unwrap();

    let master = b
        .attach_master("kv", BackendType::Memory, BackendOptions::default())
        .await
        .unwrap();
    master
        .put(Data::from("greeting"), Data::from("hello"), None)
        .await
        .unwrap();

    let a = Endpoint::new();
    a.peer_remotely("127.0.0.1", addr.port(), Duration::from_millis(100))
        .await
        .unwrap();

    for _ in 0..150 {
        if connected(&a).await && connected(&b).await {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    let clone = a.attach_clone("kv").await.unwrap();
    for _ in 0..150 {
        if clone.get(Data::from("greeting")).await.unwrap() == Some(Data::from("hello")) {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        clone.get(Data::from("greeting")).await.unwrap(),
        Some(Data::from("hello"))
    );

    // Publishes cross the wire too.
    let mut sub = a.subscribe(["news"].into_iter().collect()).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    b.publish("news/today", Data::from(7i64)).await.unwrap();
    let (topic, data) = timeout(Duration::from_secs(2), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic.as_str(), "news/today");
    assert_eq!(data, Data::Integer(7));
}
