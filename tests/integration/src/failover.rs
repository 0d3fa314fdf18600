//! Member crashes: promotion of secondaries, repair and lost buckets.

use bytes::Bytes;
use lode_cluster::GridError;

use crate::helpers::{eventually, key_in, owners_of, TestCluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_survives_primary_crash() {
    let mut cluster = TestCluster::start(3).await;
    let entry = cluster.nodes[1]
        .create_region(cluster.nodes[1].region_config("orders", 4, 1))
        .await
        .unwrap();
    let first = cluster.nodes[2].write("orders", "o1", "A").await.unwrap();

    let (bucket, primary, secondaries) = owners_of(&entry.table, "o1");
    cluster.kill(primary);
    cluster.wait_for_members(2).await;

    let survivor = cluster.nodes[0].clone();
    let value = eventually("o1 is readable again", || {
        let survivor = survivor.clone();
        async move { survivor.read("orders", "o1").await.ok() }
    })
    .await;
    assert_eq!(value, Some(Bytes::from("A")));

    // the old secondary took over under a newer epoch
    let table = survivor.snapshot("orders").unwrap();
    let ownership = table.bucket(bucket).unwrap();
    assert_eq!(ownership.primary, Some(secondaries[0]));
    assert!(ownership.epoch > entry.table.epoch_of(bucket).unwrap());

    // and the bucket got its second copy back
    let status = eventually("orders is fully redundant", || {
        let survivor = survivor.clone();
        async move {
            survivor
                .region_status("orders")
                .ok()
                .filter(|s| s.is_healthy())
        }
    })
    .await;
    assert!(status.lost_buckets.is_empty());

    // writes of the promoted primary order after everything before
    let ack = survivor.write("orders", "o1", "B").await.unwrap();
    assert!(ack.stamp > first.stamp);
    for node in cluster.nodes.clone() {
        eventually("every copy holds the new value", || {
            let node = node.clone();
            async move {
                (node.read_local("orders", "o1").await.ok()? == Some(Bytes::from("B"))).then_some(())
            }
        })
        .await;
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_key_survives_a_crash() {
    let mut cluster = TestCluster::start(3).await;
    let node = cluster.nodes[0].clone();
    node.create_region(node.region_config("users", 8, 1))
        .await
        .unwrap();
    for i in 0..64 {
        node.write("users", format!("u{i}"), format!("{i}"))
            .await
            .unwrap();
    }

    let victim = cluster.nodes[2].id();
    cluster.kill(victim);
    cluster.wait_for_members(2).await;

    let reader = cluster.nodes[1].clone();
    for i in 0..64 {
        let key = format!("u{i}");
        let value = eventually(&format!("{key} is readable"), || {
            let reader = reader.clone();
            let key = key.clone();
            async move { reader.read("users", key).await.ok() }
        })
        .await;
        assert_eq!(value, Some(Bytes::from(format!("{i}"))));
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreplicated_buckets_are_lost_not_recreated() {
    let mut cluster = TestCluster::start(3).await;
    let coordinator = cluster.coordinator().clone();
    let entry = coordinator
        .create_region(coordinator.region_config("scratch", 6, 0))
        .await
        .unwrap();

    let victim = cluster
        .nodes
        .iter()
        .map(|n| n.id())
        .find(|id| *id != coordinator.id())
        .unwrap();
    let victim_buckets: Vec<u32> = (0..6)
        .filter(|b| entry.table.primary_of(*b) == Some(victim))
        .collect();
    assert!(!victim_buckets.is_empty());
    let doomed = key_in("k", 6, &victim_buckets);
    let safe_buckets: Vec<u32> = (0..6).filter(|b| !victim_buckets.contains(b)).collect();
    let safe = key_in("k", 6, &safe_buckets);
    coordinator.write("scratch", doomed.clone(), "gone").await.unwrap();
    coordinator.write("scratch", safe.clone(), "kept").await.unwrap();

    cluster.kill(victim);
    cluster.wait_for_members(2).await;

    let status = eventually("the victim's buckets are reported lost", || {
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .region_status("scratch")
                .ok()
                .filter(|s| !s.lost_buckets.is_empty())
        }
    })
    .await;
    assert_eq!(status.lost_buckets, victim_buckets);
    assert!(!status.is_healthy());

    for node in &cluster.nodes {
        assert!(matches!(
            node.write("scratch", doomed.clone(), "again").await,
            Err(GridError::Degraded { .. })
        ));
        assert!(matches!(
            node.read("scratch", doomed.clone()).await,
            Err(GridError::Degraded { .. })
        ));
        assert_eq!(
            node.read("scratch", safe.clone()).await.unwrap(),
            Some(Bytes::from("kept"))
        );
    }
    cluster.shutdown().await;
}
