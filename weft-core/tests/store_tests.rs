//! Master/clone store scenarios over in-process peerings.

use std::time::Duration;
use tokio::time::sleep;
use weft_core::{Endpoint, MasterRef, PeerPhase, StoreFrontend};
use weft_model::{Data, FabricError, Span};
use weft_store::{BackendOptions, BackendType};

const TICK: Duration = Duration::from_millis(20);

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

async fn eventually_eq(store: &StoreFrontend, key: Data, expected: Option<Data>) {
    for _ in 0..150 {
        if store.get(key.clone()).await.unwrap() == expected {
            return;
        }
        sleep(TICK).await;
    }
    panic!(
        "store {:?} never reached {:?} for key {:?}",
        store.name(),
        expected,
        key
    );
}

fn memory() -> (BackendType, BackendOptions) {
    (BackendType::Memory, BackendOptions::default())
}

#[tokio::test]
async fn test_master_then_clone_replication() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    let (ty, opts) = memory();
    let master = a.attach_master("kv", ty, opts).await.unwrap();
    master.put(Data::from("a"), Data::from(1i64), None).await.unwrap();

    b.peer(&a).await.unwrap();
    wait_connected(&a, &b).await;

    let clone = b.attach_clone("kv").await.unwrap();
    assert!(!clone.is_master());

    // Snapshot bootstrap carries the pre-peering write.
    eventually_eq(&clone, Data::from("a"), Some(Data::Integer(1))).await;

    // Incremental updates flow after bootstrap.
    master.increment(Data::from("a"), 1).await.unwrap();
    eventually_eq(&clone, Data::from("a"), Some(Data::Integer(2))).await;
}

#[tokio::test]
async fn test_clone_writes_reach_master() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    let (ty, opts) = memory();
    let master = a.attach_master("kv", ty, opts).await.unwrap();
    b.peer(&a).await.unwrap();
    wait_connected(&a, &b).await;

    let clone = b.attach_clone("kv").await.unwrap();
    clone
        .put(Data::from("k"), Data::from("v"), None)
        .await
        .unwrap();

    eventually_eq(&master, Data::from("k"), Some(Data::from("v"))).await;
    // And the write replicates back down to the clone itself.
    eventually_eq(&clone, Data::from("k"), Some(Data::from("v"))).await;
}

#[tokio::test]
async fn test_clone_sequence_is_monotonic() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    let (ty, opts) = memory();
    let master = a.attach_master("kv", ty, opts).await.unwrap();
    b.peer(&a).await.unwrap();
    wait_connected(&a, &b).await;
    let clone = b.attach_clone("kv").await.unwrap();

    let mut last = 0;
    for i in 0..10 {
        master
            .put(Data::from("k"), Data::from(i as i64), None)
            .await
            .unwrap();
        let seq = clone.sequence().await.unwrap();
        assert!(seq >= last, "clone sequence went backwards: {last} -> {seq}");
        last = seq;
    }

    // In quiescence the clone catches up to the master.
    let master_seq = master.sequence().await.unwrap();
    for _ in 0..150 {
        if clone.sequence().await.unwrap() == master_seq {
            return;
        }
        sleep(TICK).await;
    }
    panic!("clone never caught up to master sequence {master_seq}");
}

#[tokio::test]
async fn test_attach_clone_without_peers_fails() {
    let a = Endpoint::new();
    let err = a.attach_clone("kv").await.unwrap_err();
    assert_eq!(err, FabricError::NoSuchMaster);
}

#[tokio::test]
async fn test_resolver_rejects_when_no_peer_hosts_master() {
    let a = Endpoint::new();
    let b = Endpoint::new();
    a.peer(&b).await.unwrap();
    wait_connected(&a, &b).await;

    let err = a.attach_clone("nowhere").await.unwrap_err();
    assert_eq!(err, FabricError::NoSuchMaster);
}

#[tokio::test]
async fn test_type_clash_leaves_value_and_sequence_untouched() {
    let a = Endpoint::new();
    let (ty, opts) = memory();
    let master = a.attach_master("kv", ty, opts).await.unwrap();

    master
        .put(Data::from("s"), Data::from("text"), None)
        .await
        .unwrap();
    let seq_before = master.sequence().await.unwrap();

    let err = master.increment(Data::from("s"), 1).await.unwrap_err();
    assert_eq!(err, FabricError::TypeClash);

    assert_eq!(
        master.get(Data::from("s")).await.unwrap(),
        Some(Data::from("text"))
    );
    assert_eq!(master.sequence().await.unwrap(), seq_before);
}

#[tokio::test]
async fn test_at_most_one_local_master() {
    let a = Endpoint::new();
    let (ty, opts) = memory();
    let first = a.attach_master("kv", ty, opts).await.unwrap();

    // Re-attaching yields a handle to the same master, not a second one.
    let (ty, opts) = memory();
    let second = a.attach_master("kv", ty, opts).await.unwrap();
    first.put(Data::from("k"), Data::from(1i64), None).await.unwrap();
    assert_eq!(
        second.get(Data::from("k")).await.unwrap(),
        Some(Data::Integer(1))
    );
}

#[tokio::test]
async fn test_attach_master_rejects_remote_duplicate() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    let (ty, opts) = memory();
    a.attach_master("kv", ty, opts).await.unwrap();
    b.peer(&a).await.unwrap();
    wait_connected(&a, &b).await;

    let (ty, opts) = memory();
    let err = b.attach_master("kv", ty, opts).await.unwrap_err();
    assert_eq!(err, FabricError::MasterExists);
}

#[tokio::test]
async fn test_lookup_master() {
    let a = Endpoint::new();
    let (ty, opts) = memory();
    a.attach_master("kv", ty, opts).await.unwrap();

    match a.lookup_master("kv").await.unwrap() {
        MasterRef::Local(_) => {}
        other => panic!("expected local master, got {other:?}"),
    }
    assert_eq!(
        a.lookup_master("missing").await.unwrap_err(),
        FabricError::NoSuchMaster
    );
}

#[tokio::test]
async fn test_entries_expire_on_master_and_clone() {
    let a = Endpoint::new();
    let b = Endpoint::new();

    let (ty, opts) = memory();
    let master = a.attach_master("kv", ty, opts).await.unwrap();
    b.peer(&a).await.unwrap();
    wait_connected(&a, &b).await;
    let clone = b.attach_clone("kv").await.unwrap();

    master
        .put(
            Data::from("ttl"),
            Data::from(1i64),
            Some(Span::from_millis(150)),
        )
        .await
        .unwrap();
    eventually_eq(&clone, Data::from("ttl"), Some(Data::Integer(1))).await;

    // The master expires the entry and replicates the erasure.
    eventually_eq(&master, Data::from("ttl"), None).await;
    eventually_eq(&clone, Data::from("ttl"), None).await;
}

#[tokio::test]
async fn test_persistent_master_backend() {
    let dir = tempfile::tempdir().unwrap();
    let a = Endpoint::new();
    let options = BackendOptions {
        path: Some(dir.path().join("kv.redb")),
    };
    let master = a
        .attach_master("kv", BackendType::Persistent, options)
        .await
        .unwrap();
    master.put(Data::from("k"), Data::from(9i64), None).await.unwrap();
    assert_eq!(
        master.get(Data::from("k")).await.unwrap(),
        Some(Data::Integer(9))
    );
    assert_eq!(master.size().await.unwrap(), 1);
    assert_eq!(master.keys().await.unwrap(), vec![Data::from("k")]);
}
