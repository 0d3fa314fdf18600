//! Region lifecycle and placement seen from several members.

use bytes::Bytes;
use lode_cluster::{bucket_for_key, GridError, RegionState};

use crate::helpers::{eventually, test_config, TestCluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lifecycle_is_visible_everywhere() {
    let cluster = TestCluster::start(3).await;
    let nodes = &cluster.nodes;

    // created through a member that does not coordinate
    let first = nodes[2]
        .create_region(nodes[2].region_config("carts", 4, 1))
        .await
        .unwrap();
    assert_eq!(first.state, RegionState::Active);
    for node in nodes {
        let entry = node.directory().region("carts").cloned().unwrap();
        assert_eq!(entry.id, first.id);
        assert_eq!(entry.state, RegionState::Active);
    }
    assert!(matches!(
        nodes[1].create_region(nodes[1].region_config("carts", 4, 1)).await,
        Err(GridError::RegionExists(_))
    ));

    nodes[0].write("carts", "c1", "x").await.unwrap();
    nodes[1].destroy_region("carts").await.unwrap();
    for node in nodes.clone() {
        eventually("the region is gone everywhere", || {
            let node = node.clone();
            async move {
                let gone = matches!(
                    node.read("carts", "c1").await,
                    Err(GridError::RegionNotFound(_))
                );
                (gone && node.hosted_buckets("carts").is_empty()).then_some(())
            }
        })
        .await;
    }

    // the name is free again, for an unrelated region
    let second = nodes[0]
        .create_region(nodes[0].region_config("carts", 2, 2))
        .await
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.table.bucket_count(), 2);
    for node in nodes {
        assert_eq!(node.read("carts", "c1").await.unwrap(), None);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn copies_spread_over_members() {
    let cluster = TestCluster::start(3).await;
    let node = &cluster.nodes[0];
    node.create_region(node.region_config("users", 12, 1))
        .await
        .unwrap();

    let status = node.region_status("users").unwrap();
    assert!(status.is_healthy());
    assert_eq!(status.members.len(), 3);
    let primaries: Vec<usize> = status.members.iter().map(|m| m.primaries).collect();
    let secondaries: usize = status.members.iter().map(|m| m.secondaries).sum();
    assert_eq!(primaries.iter().sum::<usize>(), 12);
    assert_eq!(secondaries, 12);
    let (min, max) = (primaries.iter().min().unwrap(), primaries.iter().max().unwrap());
    assert!(max - min <= 1, "unbalanced primaries {primaries:?}");

    for member in &cluster.nodes {
        let load = status.load_of(member.id()).unwrap();
        assert_eq!(
            member.hosted_buckets("users").len(),
            load.primaries + load.secondaries
        );
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tagged_keys_share_a_bucket() {
    let cluster = TestCluster::start(2).await;
    let node = &cluster.nodes[1];
    node.create_region(node.region_config("carts", 16, 1))
        .await
        .unwrap();

    let a = node.route("carts", "{cart-7}items").await.unwrap();
    let b = node.route("carts", "{cart-7}total").await.unwrap();
    assert_eq!(a.bucket, b.bucket);
    assert_eq!(a.member, b.member);
    assert_eq!(a.bucket, bucket_for_key(b"cart-7", 16));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn copies_land_in_other_zones() {
    let mut cluster = TestCluster::start(0).await;
    for (port, zone) in [(7501, "a"), (7502, "b"), (7503, "b")] {
        let mut cfg = test_config(port);
        cfg.node.zone = Some(zone.into());
        if let Some(founder) = cluster.nodes.first() {
            cfg.node.seeds = vec![founder.addr()];
        }
        cluster.start_member(cfg).await;
    }
    cluster.wait_for_members(3).await;

    let node = cluster.nodes[0].clone();
    let entry = node
        .create_region(node.region_config("zoned", 8, 1))
        .await
        .unwrap();
    let view = node.current_view();
    let zone_of = |id| view.member(id).and_then(|m| m.zone.clone());
    for bucket in entry.table.buckets() {
        let primary = bucket.primary.unwrap();
        for secondary in bucket.secondaries.iter() {
            assert_ne!(zone_of(primary), zone_of(*secondary));
        }
    }

    node.write("zoned", "z", "1").await.unwrap();
    assert_eq!(
        cluster.nodes[2].read("zoned", "z").await.unwrap(),
        Some(Bytes::from("1"))
    );
    cluster.shutdown().await;
}
