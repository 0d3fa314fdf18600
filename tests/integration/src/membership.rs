//! Views, coordinator succession, partitions and graceful departure.

use std::time::Duration;

use bytes::Bytes;
use lode_cluster::{GridError, LocalStatus};
use tokio_stream::StreamExt;

use crate::helpers::{eventually, TestCluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn members_join_through_the_founder() {
    let cluster = TestCluster::start(3).await;
    let founder = &cluster.nodes[0];
    assert!(founder.is_coordinator());

    let view = founder.current_view();
    assert_eq!(view.len(), 3);
    // incarnations follow admission order
    let incarnations: Vec<u64> = cluster
        .nodes
        .iter()
        .map(|n| view.member(n.id()).unwrap().incarnation)
        .collect();
    assert_eq!(incarnations[0], 1);
    assert!(incarnations.windows(2).all(|w| w[0] < w[1]));

    for node in &cluster.nodes {
        assert_eq!(node.status().await, LocalStatus::Active);
        assert_eq!(node.current_view().generation, view.generation);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn view_stream_reports_admissions() {
    let mut cluster = TestCluster::start(1).await;
    let mut views = cluster.nodes[0].subscribe_views();
    let first = views.next().await.unwrap();
    assert_eq!(first.len(), 1);

    cluster.add_member().await;
    let grown = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = views.next().await.unwrap();
            if view.len() == 2 {
                return view;
            }
        }
    })
    .await
    .unwrap();
    assert!(grown.generation > first.generation);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn view_changes_report_every_transition() {
    let mut cluster = TestCluster::start(1).await;
    let mut changes = cluster.nodes[0].view_changes();

    // a member that comes and goes leaves the founder's view where it
    // started, but both transitions are still reported
    let visitor = cluster.add_member().await.id();
    cluster.kill(visitor);
    cluster.wait_for_members(1).await;

    let (joined, departed) = tokio::time::timeout(Duration::from_secs(5), async {
        let joined = changes.next().await.unwrap().unwrap();
        let departed = changes.next().await.unwrap().unwrap();
        (joined, departed)
    })
    .await
    .unwrap();
    assert_eq!(
        joined.joined().iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![visitor]
    );
    assert!(joined.departed().is_empty());
    assert_eq!(
        departed.departed().iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![visitor]
    );
    assert_eq!(departed.old.generation, joined.new.generation);
    assert!(departed.new.generation > joined.new.generation);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coordinator_crash_elects_the_oldest_survivor() {
    let mut cluster = TestCluster::start(3).await;
    let founder = cluster.nodes[0].id();
    let successor = cluster.nodes[1].id();
    cluster.kill(founder);
    cluster.wait_for_members(2).await;

    let view = cluster.nodes[0].current_view();
    assert_eq!(view.coordinator().map(|c| c.id), Some(successor));
    assert!(cluster.node(successor).is_coordinator());

    // the directory keeps working under the new coordinator
    let other = cluster.nodes[1].clone();
    let created = eventually("a region can be created", || {
        let other = other.clone();
        async move {
            other
                .create_region(other.region_config("after-election", 4, 1))
                .await
                .ok()
        }
    })
    .await;
    assert_eq!(created.table.redundancy, 1);
    other.write("after-election", "k", "v").await.unwrap();
    assert_eq!(
        cluster.nodes[0].read("after-election", "k").await.unwrap(),
        Some(Bytes::from("v"))
    );
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_member_stops_writing_then_rejoins() {
    let cluster = TestCluster::start(3).await;
    let coordinator = cluster.nodes[0].clone();
    coordinator
        .create_region(coordinator.region_config("orders", 4, 1))
        .await
        .unwrap();
    let isolated = cluster.nodes[2].clone();
    let old_incarnation = isolated
        .current_view()
        .member(isolated.id())
        .unwrap()
        .incarnation;

    cluster.net.isolate(isolated.addr());
    // until it notices, a write it happens to be primary for can still
    // reach it and time out on its quorum
    eventually("the isolated member refuses writes", || {
        let isolated = isolated.clone();
        async move {
            match isolated.write("orders", "o1", "x").await {
                Err(GridError::MembershipPartitioned | GridError::Unavailable(_)) => Some(()),
                _ => None,
            }
        }
    })
    .await;

    // the majority side carries on without it
    eventually("the majority drops the isolated member", || {
        let coordinator = coordinator.clone();
        async move { (coordinator.current_view().len() == 2).then_some(()) }
    })
    .await;
    // ownership is repaired right after the view change
    eventually("the majority accepts writes", || {
        let coordinator = coordinator.clone();
        async move { coordinator.write("orders", "o1", "majority").await.ok() }
    })
    .await;
    assert_eq!(isolated.current_view().len(), 3);

    cluster.net.heal_all();
    cluster.wait_for_members(3).await;
    let view = coordinator.current_view();
    assert!(view.member(isolated.id()).unwrap().incarnation > old_incarnation);

    let value = eventually("the rejoined member reads again", || {
        let isolated = isolated.clone();
        async move { isolated.read("orders", "o1").await.ok() }
    })
    .await;
    assert_eq!(value, Some(Bytes::from("majority")));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_keeps_data() {
    let cluster = TestCluster::start(3).await;
    let node = cluster.nodes[0].clone();
    node.create_region(node.region_config("orders", 8, 1))
        .await
        .unwrap();
    for i in 0..32 {
        node.write("orders", format!("o{i}"), format!("{i}"))
            .await
            .unwrap();
    }

    let leaving = cluster.nodes[2].clone();
    leaving.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(leaving.status().await, LocalStatus::Left);
    assert!(matches!(
        leaving.write("orders", "o1", "late").await,
        Err(GridError::Unavailable(_))
    ));

    eventually("the survivors agree on two members", || {
        let nodes = cluster.nodes[..2].to_vec();
        async move { nodes.iter().all(|n| n.current_view().len() == 2).then_some(()) }
    })
    .await;
    for i in 0..32 {
        let key = format!("o{i}");
        let value = eventually(&format!("{key} is readable"), || {
            let node = node.clone();
            let key = key.clone();
            async move { node.read("orders", key).await.ok() }
        })
        .await;
        assert_eq!(value, Some(Bytes::from(format!("{i}"))));
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leaving_coordinator_hands_over() {
    let cluster = TestCluster::start(3).await;
    let founder = cluster.nodes[0].clone();
    let successor = cluster.nodes[1].clone();
    founder.shutdown(Duration::from_secs(5)).await.unwrap();

    eventually("the next oldest member coordinates", || {
        let successor = successor.clone();
        async move { (successor.is_coordinator() && successor.current_view().len() == 2).then_some(()) }
    })
    .await;
    successor
        .create_region(successor.region_config("orders", 2, 1))
        .await
        .unwrap();
    cluster.shutdown().await;
}
