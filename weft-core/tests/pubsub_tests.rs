//! Pub/sub and handshake scenarios over in-process peerings.

use std::time::Duration;
use tokio::time::{sleep, timeout};
use weft_core::{Endpoint, PeerPhase, StatusKind};
use weft_model::{Data, Filter, PeerMessage, Topic, WIRE_VERSION};

const TICK: Duration = Duration::from_millis(20);
const WINDOW: Duration = Duration::from_millis(500);

async fn wait_connected(a: &Endpoint, b: &Endpoint) {
    for _ in 0..100 {
        let a_sees = a
            .peers()
            .await
            .unwrap()
            .iter()
            .any(|p| p.info.id == b.id() && p.phase == PeerPhase::Connected);
        let b_sees = b
            .peers()
            .await
            .unwrap()
            .iter()
            .any(|p| p.info.id == a.id() && p.phase == PeerPhase::Connected);
        if a_sees && b_sees {
            return;
        }
        sleep(TICK).await;
    }
    panic!("peering never completed");
}

#[tokio::test]
async fn test_two_endpoint_pubsub() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    let mut sub = a.subscribe(["x"].into_iter().collect()).await.unwrap();
    a.peer(&b).await.unwrap();
    wait_connected(&a, &b).await;

    b.publish("x/y", Data::from(42i64)).await.unwrap();
    let (topic, data) = timeout(WINDOW, sub.recv()).await.unwrap().unwrap();
    assert_eq!(topic, Topic::new("x/y"));
    assert_eq!(data, Data::Integer(42));

    // A non-matching topic is never delivered; the sentinel after it is.
    b.publish("z", Data::from(99i64)).await.unwrap();
    b.publish("x/end", Data::from(0i64)).await.unwrap();
    let (topic, _) = timeout(WINDOW, sub.recv()).await.unwrap().unwrap();
    assert_eq!(topic, Topic::new("x/end"));
}

#[tokio::test]
async fn test_handshake_symmetry() {
    let a = Endpoint::new();
    let b = Endpoint::new();
    a.peer(&b).await.unwrap();
    wait_connected(&a, &b).await;

    assert_eq!(a.peers().await.unwrap().len(), 1);
    assert_eq!(b.peers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_replayed_peer_init_is_dropped() {
    let mut a = Endpoint::new();
    let b = Endpoint::new();
    let mut a_out = a.outgoing_status().unwrap();

    a.peer(&b).await.unwrap();
    wait_connected(&a, &b).await;

    // Replay step #1 twice; B must keep exactly one record for A.
    for _ in 0..2 {
        b.handle()
            .peer_message(
                a.handle(),
                PeerMessage::PeerInit {
                    version: WIRE_VERSION,
                    filter: Filter::new(),
                    origin: a.handle().info().clone(),
                },
            )
            .await
            .unwrap();
    }
    sleep(WINDOW).await;

    let peers = b.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].info.id, a.id());
    assert_eq!(peers[0].phase, PeerPhase::Connected);

    let mut established = 0;
    while let Ok(event) = a_out.try_recv() {
        if event.kind == StatusKind::Established {
            established += 1;
        }
    }
    assert_eq!(established, 1);
}

#[tokio::test]
async fn test_anonymous_peer_init_is_dropped() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    b.handle()
        .peer_message(
            a.handle(),
            PeerMessage::PeerInit {
                version: WIRE_VERSION,
                filter: Filter::new(),
                origin: weft_model::EndpointInfo::new(weft_model::EndpointId::nil()),
            },
        )
        .await
        .unwrap();
    sleep(WINDOW).await;
    assert!(b.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_incompatible_version_is_rejected() {
    let a = Endpoint::new();
    let mut b = Endpoint::new();
    let mut b_in = b.incoming_status().unwrap();

    b.handle()
        .peer_message(
            a.handle(),
            PeerMessage::PeerInit {
                version: WIRE_VERSION + 1,
                filter: Filter::new(),
                origin: a.handle().info().clone(),
            },
        )
        .await
        .unwrap();

    let event = timeout(WINDOW, b_in.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind, StatusKind::Incompatible);
    assert!(b.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stray_peer_ack_is_dropped() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    // Step #3 without any preceding step #1.
    b.handle()
        .peer_message(a.handle(), PeerMessage::PeerAck { stream: weft_model::StreamId(7) })
        .await
        .unwrap();
    sleep(WINDOW).await;
    assert!(b.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_no_reverse_path_duplicates() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    // Both sides subscribe the same topic, so a forwarded message could
    // loop back if reverse-path filtering were broken.
    let mut a_sub = a.subscribe(["t"].into_iter().collect()).await.unwrap();
    let mut b_sub = b.subscribe(["t"].into_iter().collect()).await.unwrap();

    a.peer(&b).await.unwrap();
    wait_connected(&a, &b).await;

    a.publish("t", Data::from(1i64)).await.unwrap();

    let (_, data) = timeout(WINDOW, a_sub.recv()).await.unwrap().unwrap();
    assert_eq!(data, Data::Integer(1));
    let (_, data) = timeout(WINDOW, b_sub.recv()).await.unwrap().unwrap();
    assert_eq!(data, Data::Integer(1));

    // Neither side may see a second copy.
    sleep(WINDOW).await;
    assert!(a_sub.try_recv().is_none());
    assert!(b_sub.try_recv().is_none());
}

#[tokio::test]
async fn test_filter_stays_canonical_and_propagates() {
    let a = Endpoint::new();
    let b = Endpoint::new();
    a.peer(&b).await.unwrap();
    wait_connected(&a, &b).await;

    let _s1 = a.subscribe(["m", "c"].into_iter().collect()).await.unwrap();
    let _s2 = a.subscribe(["c", "a"].into_iter().collect()).await.unwrap();

    let filter = a.handle().filter().await.unwrap();
    let entries: Vec<_> = filter.iter().map(|t| t.as_str().to_string()).collect();
    assert_eq!(entries, ["a", "c", "m"]);

    // The grown filter reaches the peer: messages on the new topics route.
    let mut sub = a.subscribe(["late"].into_iter().collect()).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    b.publish("late/news", Data::from(5i64)).await.unwrap();
    let (topic, _) = timeout(WINDOW, sub.recv()).await.unwrap().unwrap();
    assert_eq!(topic, Topic::new("late/news"));
}

#[tokio::test]
async fn test_unpeer_tears_down_both_sides() {
    let a = Endpoint::new();
    let b = Endpoint::new();
    a.peer(&b).await.unwrap();
    wait_connected(&a, &b).await;

    a.unpeer(b.id()).await.unwrap();
    for _ in 0..100 {
        if a.peers().await.unwrap().is_empty() && b.peers().await.unwrap().is_empty() {
            return;
        }
        sleep(TICK).await;
    }
    panic!("unpeer did not tear down both sides");
}

#[tokio::test]
async fn test_crossed_peer_calls_converge() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    // Both sides initiate simultaneously; the id tie-break must leave one
    // connected peering, not two or zero.
    let (ra, rb) = tokio::join!(a.peer(&b), b.peer(&a));
    ra.unwrap();
    rb.unwrap();
    wait_connected(&a, &b).await;

    assert_eq!(a.peers().await.unwrap().len(), 1);
    assert_eq!(b.peers().await.unwrap().len(), 1);
}
