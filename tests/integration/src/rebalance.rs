//! Growth rebalancing when members join.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lode_cluster::{MemberId, OwnershipTable};
use lode_grid::GridNode;

use crate::helpers::{eventually, TestCluster, SETTLE};

async fn seed_region(node: &GridNode, keys: usize) {
    node.create_region(node.region_config("orders", 8, 1))
        .await
        .unwrap();
    for i in 0..keys {
        node.write("orders", format!("o{i}"), format!("value-{i}"))
            .await
            .unwrap();
    }
}

/// Waits until the coordinator has nothing left to move.
async fn quiesce(coordinator: &GridNode) {
    eventually("the rebalance settles", || {
        let coordinator = coordinator.clone();
        async move {
            let status = coordinator.rebalance_status();
            (status.completed > 0 && status.pending == 0 && status.in_flight.is_none())
                .then_some(())
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn newcomer_receives_copies_and_data() {
    let mut cluster = TestCluster::start(2).await;
    let coordinator = cluster.nodes[0].clone();
    seed_region(&coordinator, 100).await;

    let newcomer = cluster.add_member().await;
    cluster.wait_for_members(3).await;
    quiesce(&coordinator).await;

    let status = coordinator.region_status("orders").unwrap();
    assert!(status.is_healthy());
    let load = status.load_of(newcomer.id()).unwrap();
    // 16 copies over 3 members
    assert!(load.primaries + load.secondaries >= 5, "newcomer load {load:?}");
    assert!(load.primaries >= 1, "newcomer load {load:?}");

    for i in 0..100 {
        let key = format!("o{i}");
        assert_eq!(
            newcomer.read("orders", key.clone()).await.unwrap(),
            Some(Bytes::from(format!("value-{i}"))),
            "{key} after rebalance"
        );
    }

    // every copy the newcomer hosts was seeded completely
    let table = newcomer.snapshot("orders").unwrap();
    for i in 0..100 {
        let key = format!("o{i}");
        let bucket = lode_cluster::bucket_for_key(key.as_bytes(), 8);
        if table.bucket(bucket).unwrap().is_owner(newcomer.id()) {
            assert_eq!(
                newcomer.read_local("orders", key).await.unwrap(),
                Some(Bytes::from(format!("value-{i}")))
            );
        }
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_keep_flowing_during_moves() {
    let mut cluster = TestCluster::start(2).await;
    let coordinator = cluster.nodes[0].clone();
    seed_region(&coordinator, 40).await;

    cluster.add_member().await;
    // writes through a member that is not moving anything itself
    let writer = cluster.nodes[1].clone();
    let mut written = 0;
    for round in 0..20 {
        for i in 0..40 {
            let value = format!("r{round}-{i}");
            // a move can briefly refuse a write; the caller retries
            if writer.write("orders", format!("o{i}"), value).await.is_ok() {
                written += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(written > 0);
    quiesce(&coordinator).await;

    // the last accepted value of every key is what everyone reads
    for i in 0..40 {
        let key = format!("o{i}");
        let expected = coordinator.read("orders", key.clone()).await.unwrap();
        for node in &cluster.nodes {
            assert_eq!(node.read("orders", key.clone()).await.unwrap(), expected);
        }
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_rebalance_waits_for_resume() {
    let mut cluster = TestCluster::start(2).await;
    let coordinator = cluster.nodes[0].clone();
    seed_region(&coordinator, 20).await;
    coordinator.pause_rebalance();

    let newcomer = cluster.add_member().await;
    cluster.wait_for_members(3).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(newcomer.hosted_buckets("orders").is_empty());
    assert_eq!(coordinator.rebalance_status().completed, 0);

    coordinator.resume_rebalance();
    quiesce(&coordinator).await;
    assert!(!newcomer.hosted_buckets("orders").is_empty());
    for i in 0..20 {
        assert_eq!(
            newcomer.read("orders", format!("o{i}")).await.unwrap(),
            Some(Bytes::from(format!("value-{i}")))
        );
    }
    cluster.shutdown().await;
}

/// Compares two successive tables of one region: epochs never go back,
/// and a bucket whose owners changed holds a newer epoch.
fn check_successor(before: &OwnershipTable, after: &OwnershipTable) -> Result<(), String> {
    if after.version < before.version {
        return Err(format!("table version {} -> {}", before.version, after.version));
    }
    for (idx, (old, new)) in before.buckets().iter().zip(after.buckets()).enumerate() {
        let moved = old.primary != new.primary || old.secondaries != new.secondaries;
        if new.epoch < old.epoch || (moved && new.epoch == old.epoch) {
            return Err(format!(
                "bucket {idx}: epoch {} -> {} ({old:?} -> {new:?})",
                old.epoch, new.epoch
            ));
        }
    }
    Ok(())
}

/// Samples the coordinator's table of `orders` until `stop` is set.
///
/// Fails if an epoch goes backwards, owners change under the same epoch,
/// or `gone` shows up again once it has left both the view and the table.
async fn watch_table(coordinator: GridNode, gone: MemberId, stop: Arc<AtomicBool>) -> Result<usize, String> {
    let mut last = coordinator.snapshot("orders").map_err(|e| e.to_string())?;
    let mut removed = false;
    let mut samples = 0;
    while !stop.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let Ok(table) = coordinator.snapshot("orders") else {
            continue;
        };
        samples += 1;
        check_successor(&last, &table)?;
        let present = table.buckets().iter().any(|b| b.is_owner(gone));
        if removed && present {
            return Err(format!("{gone} returned to the table at version {}", table.version));
        }
        removed |= !present && !coordinator.current_view().contains(gone);
        last = table;
    }
    Ok(samples)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn target_crashing_mid_move_stays_out() {
    const KEYS: usize = 1000;
    let mut cluster = TestCluster::start(2).await;
    let coordinator = cluster.nodes[0].clone();
    // enough entries that seeding a bucket takes several chunks
    seed_region(&coordinator, KEYS).await;

    let newcomer = cluster.add_member().await;
    let gone = newcomer.id();
    let stop = Arc::new(AtomicBool::new(false));
    let watcher = tokio::spawn(watch_table(coordinator.clone(), gone, Arc::clone(&stop)));

    // crash the newcomer while a move towards it is under way; moves are
    // short, so poll far more often than `eventually` does
    tokio::time::timeout(SETTLE, async {
        while coordinator
            .rebalance_status()
            .in_flight
            .map_or(true, |m| m.step.to != gone)
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("no move towards the newcomer started");
    cluster.kill(gone);
    cluster.wait_for_members(2).await;

    // the interrupted move waits out its seeding deadline, then gives up
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let status = coordinator.rebalance_status();
            if status.in_flight.as_ref().map_or(true, |m| m.step.to != gone) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("the interrupted move never finished");
    // let anything the move published afterwards land
    tokio::time::sleep(Duration::from_millis(500)).await;

    stop.store(true, Ordering::SeqCst);
    let samples = watcher.await.unwrap().unwrap();
    assert!(samples > 0);

    for node in &cluster.nodes {
        let table = node.snapshot("orders").unwrap();
        assert!(
            table.buckets().iter().all(|b| !b.is_owner(gone)),
            "crashed member still owns buckets"
        );
        assert!(table.buckets().iter().all(|b| b.primary.is_some()));
    }
    for i in 0..KEYS {
        assert_eq!(
            coordinator.read("orders", format!("o{i}")).await.unwrap(),
            Some(Bytes::from(format!("value-{i}")))
        );
    }
    cluster.shutdown().await;
}
