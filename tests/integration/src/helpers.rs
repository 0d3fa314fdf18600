//! Test helpers for running several members over an in-memory network.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lode_cluster::{bucket_for_key, ConsistencyMode, MemberId, OwnershipTable};
use lode_grid::{GridConfig, GridNode, InMemoryNetwork};

/// Upper bound for anything that waits on failure detection or elections.
pub const SETTLE: Duration = Duration::from_secs(15);

/// Timings tight enough for tests but loose enough that a busy test
/// runner does not see spurious departures.
pub fn test_config(port: u16) -> GridConfig {
    let mut cfg = GridConfig::default();
    cfg.node.bind = SocketAddr::from(([127, 0, 0, 1], port));
    cfg.membership.heartbeat_interval_ms = 50;
    cfg.membership.suspect_after_missed = 4;
    cfg.membership.depart_after_missed = 30;
    cfg.membership.coordinator_timeout_ms = 1000;
    cfg.membership.election_timeout_ms = 5000;
    cfg.replication.quorum_timeout_ms = 300;
    cfg.router.max_retries = 8;
    cfg.router.backoff_base_ms = 10;
    cfg.router.backoff_max_ms = 200;
    cfg.router.request_timeout_ms = 2000;
    cfg.rebalance.move_interval_ms = 50;
    cfg.rebalance.handoff_chunk_entries = 16;
    cfg.rebalance.chunk_timeout_ms = 1000;
    cfg.rebalance.handoff_timeout_ms = 10_000;
    cfg
}

/// Routes test logs through the harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A cluster of in-process members.
pub struct TestCluster {
    pub net: InMemoryNetwork,
    pub nodes: Vec<GridNode>,
    next_port: u16,
    consistency: ConsistencyMode,
}

impl TestCluster {
    /// Starts `size` members in strict mode and waits until every one of
    /// them sees the full view.
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, ConsistencyMode::Strict).await
    }

    pub async fn start_with(size: usize, consistency: ConsistencyMode) -> Self {
        init_tracing();
        let mut cluster = Self {
            net: InMemoryNetwork::new(),
            nodes: Vec::new(),
            next_port: 7400,
            consistency,
        };
        for _ in 0..size {
            cluster.add_member().await;
        }
        cluster.wait_for_members(size).await;
        cluster
    }

    fn config(&mut self) -> GridConfig {
        let mut cfg = test_config(self.next_port);
        self.next_port += 1;
        cfg.membership.consistency = self.consistency;
        if let Some(founder) = self.nodes.first() {
            cfg.node.seeds = vec![founder.addr()];
        }
        cfg
    }

    /// Starts one more member, seeded with the first one, and waits for
    /// its admission.
    pub async fn add_member(&mut self) -> GridNode {
        let cfg = self.config();
        self.start_member(cfg).await
    }

    pub async fn start_member(&mut self, cfg: GridConfig) -> GridNode {
        let (transport, inbox) = self.net.bind(cfg.node.bind).unwrap();
        let node = GridNode::start(cfg, Arc::new(transport), inbox)
            .await
            .unwrap();
        node.join_cluster(SETTLE).await.unwrap();
        self.nodes.push(node.clone());
        node
    }

    /// Waits until every running member holds a view of `size` members.
    pub async fn wait_for_members(&self, size: usize) {
        let nodes = self.nodes.clone();
        eventually(&format!("all members see {size} members"), || {
            let nodes = nodes.clone();
            async move {
                nodes
                    .iter()
                    .all(|n| n.current_view().len() == size)
                    .then_some(())
            }
        })
        .await;
    }

    pub fn node(&self, id: MemberId) -> &GridNode {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .unwrap_or_else(|| panic!("no running member {id}"))
    }

    pub fn coordinator(&self) -> &GridNode {
        self.nodes
            .iter()
            .find(|n| n.is_coordinator())
            .expect("no member coordinates the view")
    }

    /// Crashes a member: stops it without a goodbye and takes its address
    /// off the network.
    pub fn kill(&mut self, id: MemberId) -> GridNode {
        let index = self
            .nodes
            .iter()
            .position(|n| n.id() == id)
            .unwrap_or_else(|| panic!("no running member {id}"));
        let node = self.nodes.remove(index);
        node.abort();
        self.net.unbind(node.addr());
        node
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.abort();
        }
    }
}

/// Polls `check` until it yields a value, panicking after [`SETTLE`].
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Owners of the bucket `key` hashes to: (bucket, primary, secondaries).
pub fn owners_of(table: &OwnershipTable, key: &str) -> (u32, MemberId, Vec<MemberId>) {
    let bucket = bucket_for_key(key.as_bytes(), table.bucket_count());
    let ownership = table.bucket(bucket).unwrap();
    (
        bucket,
        ownership.primary.expect("bucket has a primary"),
        ownership.secondaries.iter().copied().collect(),
    )
}

/// First key of the form `{prefix}{n}` that hashes into one of `buckets`.
pub fn key_in(prefix: &str, bucket_count: u32, buckets: &[u32]) -> String {
    (0..10_000)
        .map(|n| format!("{prefix}{n}"))
        .find(|k| buckets.contains(&bucket_for_key(k.as_bytes(), bucket_count)))
        .expect("no key hashes into the requested buckets")
}
