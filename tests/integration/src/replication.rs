//! Quorum replication across members.

use bytes::Bytes;
use lode_cluster::{GridError, QuorumPolicy};

use crate::helpers::{owners_of, TestCluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_owner_holds_the_last_write() {
    let cluster = TestCluster::start(3).await;
    let nodes = &cluster.nodes;
    nodes[1]
        .create_region(nodes[1].region_config("orders", 4, 2))
        .await
        .unwrap();

    // the same key written through every member in turn
    for (i, node) in nodes.iter().enumerate() {
        let ack = node.write("orders", "o1", format!("v{i}")).await.unwrap();
        assert_eq!(ack.required, 2);
        assert_eq!(ack.acks, 2);
        assert!(!ack.degraded);
    }
    for node in nodes {
        assert_eq!(
            node.read_local("orders", "o1").await.unwrap(),
            Some(Bytes::from("v2"))
        );
    }

    nodes[0].remove("orders", "o1").await.unwrap();
    for node in nodes {
        assert_eq!(node.read_local("orders", "o1").await.unwrap(), None);
        assert_eq!(node.read("orders", "o1").await.unwrap(), None);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stamps_increase_per_bucket() {
    let cluster = TestCluster::start(2).await;
    let node = &cluster.nodes[0];
    node.create_region(node.region_config("events", 1, 1))
        .await
        .unwrap();

    let mut last = None;
    for i in 0..20 {
        let ack = cluster.nodes[i % 2]
            .write("events", format!("e{i}"), "x")
            .await
            .unwrap();
        if let Some(prev) = last {
            assert!(ack.stamp > prev, "{} not after {}", ack.stamp, prev);
        }
        last = Some(ack.stamp);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quorum_timeout_then_retry_after_heal() {
    let cluster = TestCluster::start(3).await;
    let entry = cluster.nodes[0]
        .create_region(cluster.nodes[0].region_config("orders", 4, 1))
        .await
        .unwrap();
    let (bucket, primary, secondaries) = owners_of(&entry.table, "o1");
    let secondary = secondaries[0];
    let primary_node = cluster.node(primary).clone();
    let secondary_node = cluster.node(secondary).clone();

    cluster
        .net
        .partition(primary_node.addr(), secondary_node.addr());
    let err = primary_node.write("orders", "o1", "A").await.unwrap_err();
    assert!(
        matches!(err, GridError::QuorumTimeout { acked: 0, required: 1 }),
        "got {err:?}"
    );
    assert!(err.is_ambiguous());
    // the primary kept its copy; the secondary never saw it
    assert_eq!(
        primary_node.read_local("orders", "o1").await.unwrap(),
        Some(Bytes::from("A"))
    );
    assert_eq!(secondary_node.read_local("orders", "o1").await.unwrap(), None);

    cluster.net.heal_all();
    let ack = primary_node.write("orders", "o1", "A").await.unwrap();
    assert_eq!(ack.acks, 1);

    let at_primary = primary_node
        .bucket_stats("orders", bucket)
        .await
        .unwrap()
        .unwrap();
    let at_secondary = secondary_node
        .bucket_stats("orders", bucket)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_primary.entries, 1);
    assert_eq!(at_secondary.entries, 1);
    assert_eq!(at_primary.high_water, Some(ack.stamp));
    assert_eq!(at_secondary.high_water, Some(ack.stamp));
    assert_eq!(
        secondary_node.read_local("orders", "o1").await.unwrap(),
        Some(Bytes::from("A"))
    );
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn count_quorum_tolerates_one_cut_secondary() {
    let cluster = TestCluster::start(3).await;
    let node = &cluster.nodes[0];
    let config = node
        .region_config("carts", 2, 2)
        .with_quorum(QuorumPolicy::Count(1));
    let entry = node.create_region(config).await.unwrap();
    let (_, primary, secondaries) = owners_of(&entry.table, "c1");
    let primary_node = cluster.node(primary).clone();

    cluster
        .net
        .partition(primary_node.addr(), cluster.node(secondaries[0]).addr());
    let ack = primary_node.write("carts", "c1", "x").await.unwrap();
    assert_eq!(ack.required, 1);
    assert_eq!(ack.acks, 1);
    assert_eq!(
        cluster
            .node(secondaries[1])
            .read_local("carts", "c1")
            .await
            .unwrap(),
        Some(Bytes::from("x"))
    );
    cluster.net.heal_all();
    cluster.shutdown().await;
}
