//! The member runtime.
//!
//! A [`GridNode`] ties the pieces together: the membership engine, the
//! region directory, one actor per hosted bucket, replication, routing and
//! the rebalancer. It runs four long-lived tasks:
//!
//! - the inbound loop, which processes envelopes from the transport in
//!   arrival order
//! - the tick loop, which drives heartbeats and failure detection
//! - the event loop, which reacts to view changes (on the coordinator, by
//!   repairing every region's ownership table)
//! - the rebalance loop, which moves buckets onto new members
//!
//! Ownership changes always flow the same way: the coordinator publishes a
//! new directory entry, applies it locally and sends it to every member,
//! and each member reconciles its bucket actors against the new table.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use lode_cluster::{
    BucketHealth, BucketOwnership, BucketSnapshotChunk, DirectorySnapshot, Envelope, GridError,
    GridMessage, HandoffKey, HandoffManager, LocalStatus, MemberId, MemberInfo,
    MembershipEngine, MembershipEvent, OwnerRole, OwnershipTable, ReadPolicy, ReadRequest,
    RegionConfig, RegionEntry, RegionId, RegionState, ReplicaOutcome, ReplicateApply, Request,
    Response, Revision, Secondaries, View, ViewChange, WriteAck, WriteForward,
};
use lode_core::{
    BucketConfig, BucketHandle, BucketRequest, BucketResponse, BucketStats, DurabilityHook,
};
use metrics::{counter, gauge};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigError, GridConfig};
use crate::handoff;
use crate::rebalance::{self, RebalanceStatus, Rebalancer};
use crate::replication::{self, ReplicationCoordinator};
use crate::router::{Route, Router};
use crate::rpc::PendingCalls;
use crate::status::RegionStatus;
use crate::transport::{Inbox, Transport};

/// A stream of installed membership views.
pub type ViewStream = WatchStream<Arc<View>>;

/// Every view transition in install order. A subscriber that falls more
/// than [`VIEW_CHANGE_BACKLOG`] transitions behind gets a `Lagged` item
/// instead of a silent gap.
pub type ViewChangeStream = BroadcastStream<ViewChange>;

/// Depth of the membership event channel.
const EVENT_QUEUE: usize = 256;

/// Transitions buffered for view-change subscribers.
pub const VIEW_CHANGE_BACKLOG: usize = 64;

/// One member of the grid.
///
/// Cheap to clone; every clone drives the same member.
#[derive(Clone)]
pub struct GridNode {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for GridNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridNode")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .finish_non_exhaustive()
    }
}

pub(crate) struct NodeInner {
    pub(crate) id: MemberId,
    pub(crate) addr: SocketAddr,
    pub(crate) config: GridConfig,
    transport: Arc<dyn Transport>,
    membership: Mutex<MembershipEngine>,
    views: watch::Receiver<Arc<View>>,
    view_changes: broadcast::Sender<ViewChange>,
    pub(crate) directory: lode_cluster::RegionDirectory,
    buckets: DashMap<(RegionId, u32), BucketHandle>,
    calls: PendingCalls,
    replication: Arc<ReplicationCoordinator>,
    pub(crate) handoffs: Mutex<HandoffManager>,
    pub(crate) rebalancer: Rebalancer,
    router: Router,
    durability: Option<Arc<dyn DurabilityHook>>,
    /// Coordinator only: rebalance moves waiting for a copy to be seeded.
    pub(crate) seed_waiters: DashMap<HandoffKey, oneshot::Sender<u64>>,
    /// Set while a directory catch-up fetch is in flight.
    fetching: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl GridNode {
    /// Starts a member on `transport`, reading inbound traffic from
    /// `inbox`. With no seeds configured the member founds a new cluster;
    /// otherwise it starts asking the seeds to admit it.
    pub async fn start(
        config: GridConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
    ) -> Result<Self, ConfigError> {
        Self::start_inner(config, transport, inbox, None).await
    }

    /// Like [`start`](Self::start), with every write accepted by a local
    /// primary passed through `hook` before it is applied.
    pub async fn start_with_durability(
        config: GridConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        hook: Arc<dyn DurabilityHook>,
    ) -> Result<Self, ConfigError> {
        Self::start_inner(config, transport, inbox, Some(hook)).await
    }

    async fn start_inner(
        config: GridConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        durability: Option<Arc<dyn DurabilityHook>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let id = MemberId::new();
        let addr = config.node.bind;
        let local = MemberInfo {
            id,
            addr,
            zone: config.node.zone.clone(),
        };
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let engine = MembershipEngine::new(
            local,
            config.membership.to_membership_config(),
            config.node.seeds.clone(),
            event_tx,
        );
        let views = engine.subscribe();
        let replication = Arc::new(ReplicationCoordinator::new(
            id,
            addr,
            Arc::clone(&transport),
            views.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        let (view_changes, _) = broadcast::channel(VIEW_CHANGE_BACKLOG);
        let router = Router::new(config.router.clone());

        let inner = Arc::new(NodeInner {
            id,
            addr,
            config,
            transport,
            membership: Mutex::new(engine),
            views,
            view_changes,
            directory: lode_cluster::RegionDirectory::new(),
            buckets: DashMap::new(),
            calls: PendingCalls::new(),
            replication,
            handoffs: Mutex::new(HandoffManager::new()),
            rebalancer: Rebalancer::new(),
            router,
            durability,
            seed_waiters: DashMap::new(),
            fetching: AtomicBool::new(false),
            shutdown,
            tasks: StdMutex::new(Vec::new()),
        });

        info!(member = %id, %addr, "grid member starting");
        inner.spawn_tasks(inbox, event_rx);
        let out = inner.membership.lock().await.start().await;
        inner.emit(out);
        Ok(GridNode { inner })
    }

    /// Waits until this member appears in an installed view.
    pub async fn join_cluster(&self, timeout: Duration) -> Result<Arc<View>, GridError> {
        let id = self.inner.id;
        let mut views = self.inner.views.clone();
        let joined = tokio::time::timeout(timeout, views.wait_for(|v| v.contains(id)))
            .await
            .map_err(|_| GridError::Timeout)?
            .map_err(|_| GridError::Unavailable("membership stopped".into()))?;
        let view = Arc::clone(&joined);
        info!(member = %id, generation = view.generation, members = view.len(), "joined the cluster");
        Ok(view)
    }

    pub fn id(&self) -> MemberId {
        self.inner.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn config(&self) -> &GridConfig {
        &self.inner.config
    }

    pub fn current_view(&self) -> Arc<View> {
        self.inner.view()
    }

    /// Every view this member installs from now on, starting with the
    /// current one.
    pub fn subscribe_views(&self) -> ViewStream {
        WatchStream::new(self.inner.views.clone())
    }

    /// Every view transition this member installs from now on, one item
    /// per transition. Subscribing again starts a fresh sequence.
    pub fn view_changes(&self) -> ViewChangeStream {
        BroadcastStream::new(self.inner.view_changes.subscribe())
    }

    pub async fn status(&self) -> LocalStatus {
        self.inner.membership.lock().await.status()
    }

    pub fn is_coordinator(&self) -> bool {
        self.inner.view().is_coordinator(self.inner.id)
    }

    /// A region config carrying this member's default quorum and read
    /// policy.
    pub fn region_config(&self, name: &str, bucket_count: u32, redundancy: u32) -> RegionConfig {
        let replication = &self.inner.config.replication;
        RegionConfig::new(name, bucket_count, redundancy)
            .with_quorum(replication.default_quorum)
            .with_read_policy(replication.default_read_policy)
    }

    /// Creates a region. The coordinator computes the initial ownership
    /// table and publishes it; other members forward the request there.
    pub async fn create_region(&self, config: RegionConfig) -> Result<RegionEntry, GridError> {
        config.validate()?;
        let inner = &self.inner;
        inner.check_writable().await?;
        let view = inner.view();
        let coordinator = view
            .coordinator()
            .ok_or(GridError::MembershipPartitioned)?;
        if coordinator.id == inner.id {
            return inner.create_region_here(config).await;
        }
        match inner.call(coordinator.addr, Request::CreateRegion(config)).await? {
            Response::Created(result) => {
                let entry = result?;
                // make the new region routable here without waiting for
                // the coordinator's broadcast to land
                inner.install_entry(entry.clone()).await;
                Ok(entry)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Destroys a region and everything stored in it.
    pub async fn destroy_region(&self, name: &str) -> Result<(), GridError> {
        let inner = &self.inner;
        inner.check_writable().await?;
        let view = inner.view();
        let coordinator = view
            .coordinator()
            .ok_or(GridError::MembershipPartitioned)?;
        if coordinator.id == inner.id {
            return inner.destroy_region_here(name).await;
        }
        let request = Request::DestroyRegion {
            name: name.to_string(),
        };
        match inner.call(coordinator.addr, request).await? {
            Response::Destroyed(result) => result,
            other => Err(unexpected(&other)),
        }
    }

    /// The ownership table of `name` in the local directory.
    pub fn snapshot(&self, name: &str) -> Result<Arc<OwnershipTable>, GridError> {
        self.inner.directory.snapshot(name)
    }

    /// The whole local directory.
    pub fn directory(&self) -> Arc<DirectorySnapshot> {
        self.inner.directory.current()
    }

    /// Writes `value` under `key`, routed to the key's primary.
    ///
    /// Succeeds once the region's write quorum acknowledged. A
    /// `QuorumTimeout` is ambiguous: the write is applied at the primary
    /// and maybe some secondaries, and a retry with the same value is safe.
    pub async fn write(
        &self,
        region: &str,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<WriteAck, GridError> {
        self.inner
            .mutate(region, key.into(), Some(value.into()))
            .await
    }

    /// Deletes `key`. The delete is replicated like a write and later reads
    /// return nothing.
    pub async fn remove(&self, region: &str, key: impl Into<Bytes>) -> Result<WriteAck, GridError> {
        self.inner.mutate(region, key.into(), None).await
    }

    /// Reads `key` from the owner the region's read policy selects.
    pub async fn read(&self, region: &str, key: impl Into<Bytes>) -> Result<Option<Bytes>, GridError> {
        let inner = &self.inner;
        inner.check_readable().await?;
        let key: Bytes = key.into();
        let key = &key;
        let result = inner
            .router
            .retry(
                move || inner.try_read(region, key.clone()),
                move || inner.refresh_directory(),
            )
            .await;
        counter!("lode_reads_total").increment(1);
        result
    }

    /// Reads this member's own copy of `key`, whatever its role. Returns
    /// `NotOwner` if the member hosts no copy of the key's bucket.
    pub async fn read_local(&self, region: &str, key: impl Into<Bytes>) -> Result<Option<Bytes>, GridError> {
        let inner = &self.inner;
        let entry = inner.entry(region)?;
        let key = key.into();
        let bucket = lode_cluster::bucket_for_key(&key, entry.config.bucket_count);
        inner.read_bucket(&entry.id, bucket, None, key, false).await
    }

    /// The member currently holding the primary for `key`.
    pub async fn route(&self, region: &str, key: impl Into<Bytes>) -> Result<Route, GridError> {
        let inner = &self.inner;
        let key: Bytes = key.into();
        let key = &key;
        inner
            .router
            .retry(
                move || async move {
                    let entry = inner.entry(region)?;
                    Router::primary_route(&entry, key, &inner.view())
                },
                move || inner.refresh_directory(),
            )
            .await
    }

    pub fn region_status(&self, name: &str) -> Result<RegionStatus, GridError> {
        let entry = self.inner.entry(name)?;
        Ok(RegionStatus::build(&entry, &self.inner.view()))
    }

    /// Counters of a locally hosted bucket, or `None` if this member hosts
    /// no copy of it.
    pub async fn bucket_stats(&self, region: &str, bucket: u32) -> Result<Option<BucketStats>, GridError> {
        let entry = self.inner.entry(region)?;
        let Some(handle) = self.inner.bucket(&entry.id, bucket) else {
            return Ok(None);
        };
        match handle.send(BucketRequest::Stats).await? {
            BucketResponse::Stats(stats) => Ok(Some(stats)),
            BucketResponse::Err(e) => Err(e),
            _ => Err(GridError::Unavailable("unexpected bucket response".into())),
        }
    }

    /// Buckets of `region` this member runs an actor for.
    pub fn hosted_buckets(&self, region: &str) -> Vec<u32> {
        let mut hosted: Vec<u32> = self
            .inner
            .buckets
            .iter()
            .filter(|e| e.key().0.name == region)
            .map(|e| e.key().1)
            .collect();
        hosted.sort_unstable();
        hosted
    }

    pub fn pause_rebalance(&self) {
        self.inner.rebalancer.pause();
    }

    pub fn resume_rebalance(&self) {
        self.inner.rebalancer.resume();
    }

    /// Drops the pending rebalance plan and pauses. A move already in
    /// flight runs to completion.
    pub fn cancel_rebalance(&self) {
        self.inner.rebalancer.cancel();
    }

    pub fn rebalance_status(&self) -> RebalanceStatus {
        self.inner.rebalancer.status()
    }

    /// Leaves the cluster and stops.
    ///
    /// Waits up to `timeout` for a view without this member, so the
    /// coordinator can repair ownership before the member goes away. If
    /// that view never arrives the member stops anyway and returns
    /// `Timeout`; the others will then detect the departure by silence.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), GridError> {
        let inner = &self.inner;
        info!(member = %inner.id, "leaving the cluster");
        let out = inner.membership.lock().await.leave().await;
        inner.emit(out);

        let id = inner.id;
        let mut views = inner.views.clone();
        let departed = matches!(
            tokio::time::timeout(timeout, views.wait_for(|v| !v.contains(id))).await,
            Ok(Ok(_))
        );
        let result = if departed {
            Ok(())
        } else {
            warn!(member = %id, "no departure view within {timeout:?}, stopping anyway");
            inner.membership.lock().await.abandon().await;
            Err(GridError::Timeout)
        };
        inner.stop();
        info!(member = %id, "stopped");
        result
    }

    /// Stops every task at once without telling anyone, as a crash would.
    pub fn abort(&self) {
        warn!(member = %self.inner.id, "aborting");
        self.inner.stop();
    }
}

impl NodeInner {
    fn spawn_tasks(self: &Arc<Self>, inbox: Inbox, events: mpsc::Receiver<MembershipEvent>) {
        let handles = [
            tokio::spawn(Arc::clone(self).run_inbound(inbox)),
            tokio::spawn(Arc::clone(self).run_ticks()),
            tokio::spawn(Arc::clone(self).run_events(events)),
            tokio::spawn(rebalance::run(Arc::clone(self))),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
    }

    fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        // dropping the handles stops the bucket actors
        self.buckets.clear();
        self.seed_waiters.clear();
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn view(&self) -> Arc<View> {
        self.views.borrow().clone()
    }

    pub(crate) fn bucket(&self, region: &RegionId, bucket: u32) -> Option<BucketHandle> {
        self.buckets
            .get(&(region.clone(), bucket))
            .map(|h| h.value().clone())
            .filter(|h| !h.is_closed())
    }

    fn entry(&self, name: &str) -> Result<Arc<RegionEntry>, GridError> {
        self.directory
            .entry(name)
            .ok_or_else(|| GridError::RegionNotFound(name.to_string()))
    }

    async fn check_writable(&self) -> Result<(), GridError> {
        self.membership.lock().await.check_writable()
    }

    async fn check_readable(&self) -> Result<(), GridError> {
        self.membership.lock().await.check_readable()
    }

    /// True if this member coordinates the view and can act on it.
    pub(crate) async fn is_acting_coordinator(&self) -> bool {
        let membership = self.membership.lock().await;
        membership.is_coordinator() && membership.status() == LocalStatus::Active
    }

    // --- messaging ---

    fn send(&self, to: SocketAddr, message: GridMessage) -> Result<(), GridError> {
        self.transport
            .send(to, Envelope::new(self.id, self.addr, message))
            .map_err(|e| GridError::Transport(e.to_string()))
    }

    /// Sends where a failure needs no handling beyond a log line.
    fn send_quiet(&self, to: SocketAddr, message: GridMessage) {
        let kind = message.kind();
        if let Err(e) = self.send(to, message) {
            debug!(%to, kind, "send failed: {e}");
        }
    }

    fn emit(&self, out: Vec<(SocketAddr, GridMessage)>) {
        for (to, message) in out {
            self.send_quiet(to, message);
        }
    }

    /// Sends a request now and returns a future for its response.
    ///
    /// The message leaves before the future is first polled, so requests
    /// issued back to back reach a peer in issue order.
    fn request(
        &self,
        to: SocketAddr,
        body: Request,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Response, GridError>> + '_ {
        let deadline = Instant::now() + timeout;
        let (id, rx) = self.calls.register();
        let sent = self.send(to, GridMessage::Request { id, body });
        async move {
            sent.inspect_err(|_| self.calls.cancel(id))?;
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(GridError::Transport("request abandoned".into())),
                Err(_) => {
                    self.calls.cancel(id);
                    Err(GridError::Timeout)
                }
            }
        }
    }

    pub(crate) async fn call(&self, to: SocketAddr, body: Request) -> Result<Response, GridError> {
        self.request(to, body, self.config.router.request_timeout()).await
    }

    pub(crate) async fn call_with(
        &self,
        to: SocketAddr,
        body: Request,
        timeout: Duration,
    ) -> Result<Response, GridError> {
        self.request(to, body, timeout).await
    }

    // --- long-lived tasks ---

    async fn run_inbound(self: Arc<Self>, mut inbox: Inbox) {
        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(member = %self.id, "inbound loop stopped");
    }

    async fn run_ticks(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.membership.heartbeat_interval_ms,
        ));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let revision = self.directory.current().revision;
                    let out = self.membership.lock().await.tick(revision).await;
                    self.emit(out);
                    self.replication.sweep();
                    gauge!("lode_hosted_buckets").set(self.buckets.len() as f64);
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Never locks the membership engine: the engine may be waiting on
    /// this loop to drain the event channel.
    async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<MembershipEvent>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            match event {
                MembershipEvent::ViewInstalled(change) => self.on_view_installed(change).await,
                MembershipEvent::MemberSuspected(member) => {
                    debug!(%member, "member suspected");
                }
                MembershipEvent::MemberRecovered(member) => {
                    debug!(%member, "member recovered");
                }
                MembershipEvent::StatusChanged(status) => {
                    info!(member = %self.id, %status, "local status changed");
                }
            }
        }
    }

    async fn on_view_installed(self: &Arc<Self>, change: ViewChange) {
        gauge!("lode_view_members").set(change.new.len() as f64);
        // no subscribers is fine
        let _ = self.view_changes.send(change.clone());
        for m in change.joined() {
            debug!(member = %m.id, addr = %m.addr, "member joined");
        }
        for m in change.departed() {
            debug!(member = %m.id, "member departed");
        }
        if !change.new.is_coordinator(self.id) {
            return;
        }
        if change.coordinator_changed() && !change.old.is_empty() {
            info!(member = %self.id, generation = change.new.generation, "now coordinating");
        }

        let before = self.directory.current();
        let changed = self.directory.reassign_all(&change.old, &change.new);
        for entry in &changed {
            let previous = before.region(entry.name()).cloned();
            self.apply_entry(entry, previous.as_deref()).await;
        }
        if !changed.is_empty() {
            info!(
                regions = changed.len(),
                generation = change.new.generation,
                "ownership repaired after view change"
            );
            let node = Arc::clone(self);
            tokio::spawn(async move {
                for entry in &changed {
                    node.broadcast_entry(entry).await;
                }
            });
        }
    }

    // --- inbound dispatch ---

    async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        let Envelope {
            from,
            from_addr,
            message,
        } = envelope;
        trace!(%from, kind = message.kind(), "inbound");
        match message {
            GridMessage::ReplicateApply(apply) => {
                self.observe(from).await;
                self.on_replicate(from_addr, apply).await;
            }
            GridMessage::ReplicateAck { ack_id, outcome } => {
                self.observe(from).await;
                self.replication.deliver(ack_id, from, outcome);
            }
            GridMessage::RegionRetired { id, revision } => {
                self.observe(from).await;
                self.on_region_retired(&id, revision).await;
            }
            GridMessage::HandoffComplete {
                region,
                bucket,
                target,
                epoch,
            } => {
                self.observe(from).await;
                self.on_copy_seeded(HandoffKey { region, bucket, target }, epoch);
            }
            GridMessage::Request { id, body } => {
                self.observe(from).await;
                self.on_request(from_addr, id, body).await;
            }
            GridMessage::Response { id, body } => {
                self.observe(from).await;
                if !self.calls.complete(id, body) {
                    trace!(id, %from, "late response dropped");
                }
            }
            membership => {
                let revision = match &membership {
                    GridMessage::Heartbeat { directory, .. } => Some(*directory),
                    _ => None,
                };
                let out = self
                    .membership
                    .lock()
                    .await
                    .handle_message(from, from_addr, membership)
                    .await;
                self.emit(out);
                if let Some(revision) = revision {
                    self.catch_up(from, from_addr, revision);
                }
            }
        }
    }

    async fn observe(&self, from: MemberId) {
        self.membership.lock().await.observe(from);
    }

    /// Fetches the directory from `from` if it advertised a newer one.
    ///
    /// Members trust the coordinator's directory. A coordinator also
    /// catches up from members, which may hold entries its predecessor
    /// published after it last heard.
    fn catch_up(self: &Arc<Self>, from: MemberId, from_addr: SocketAddr, revision: Revision) {
        if revision <= self.directory.current().revision {
            return;
        }
        let view = self.view();
        if !view.is_coordinator(from) && !view.is_coordinator(self.id) {
            return;
        }
        if self.fetching.swap(true, Ordering::SeqCst) {
            return;
        }
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.fetch_directory(from_addr).await;
            node.fetching.store(false, Ordering::SeqCst);
        });
    }

    async fn fetch_directory(self: &Arc<Self>, from: SocketAddr) {
        match self.call(from, Request::DirectoryFetch).await {
            Ok(Response::Directory {
                revision,
                entries,
                retired,
            }) => {
                for id in &retired {
                    self.on_region_retired(id, revision).await;
                }
                let mut installed = 0;
                for entry in entries {
                    if self.install_entry(entry).await {
                        installed += 1;
                    }
                }
                debug!(%revision, installed, "directory caught up");
            }
            Ok(other) => debug!("directory fetch got {}", response_kind(&other)),
            Err(e) => debug!(%from, "directory fetch failed: {e}"),
        }
    }

    /// Pulls the coordinator's directory. Used by the router between
    /// retries.
    async fn refresh_directory(self: &Arc<Self>) {
        let view = self.view();
        if let Some(coordinator) = view.coordinator().filter(|c| c.id != self.id) {
            self.fetch_directory(coordinator.addr).await;
        }
    }

    async fn on_region_retired(&self, id: &RegionId, revision: Revision) {
        if self.directory.install_retirement(id, revision) {
            info!(region = %id, "region retired");
            self.drop_region(id).await;
        }
    }

    pub(crate) fn on_copy_seeded(&self, key: HandoffKey, epoch: u64) {
        match self.seed_waiters.remove(&key) {
            Some((_, waiter)) => {
                let _ = waiter.send(epoch);
            }
            None => debug!(%key, epoch, "copy seeded"),
        }
    }

    /// Tells the coordinator a copy is fully seeded.
    pub(crate) fn report_seeded(&self, key: HandoffKey, epoch: u64) {
        let view = self.view();
        match view.coordinator() {
            Some(c) if c.id == self.id => self.on_copy_seeded(key, epoch),
            Some(c) => self.send_quiet(
                c.addr,
                GridMessage::HandoffComplete {
                    region: key.region,
                    bucket: key.bucket,
                    target: key.target,
                    epoch,
                },
            ),
            None => {}
        }
    }

    async fn on_request(self: &Arc<Self>, from_addr: SocketAddr, id: u64, body: Request) {
        match body {
            // both are queued inline so they reach their bucket actors in
            // the order the sender issued them, interleaved correctly with
            // replicated writes from the same sender
            Request::SnapshotChunk(chunk) => {
                let queued = self.queue_chunk(chunk).await;
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    let result = queued.finish(&node).await;
                    node.send_quiet(
                        from_addr,
                        GridMessage::Response {
                            id,
                            body: Response::ChunkAck(result),
                        },
                    );
                });
            }
            Request::DirectoryUpdate(entry) => {
                self.install_entry(entry).await;
                self.send_quiet(
                    from_addr,
                    GridMessage::Response {
                        id,
                        body: Response::DirectoryAck,
                    },
                );
            }
            body => {
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    let body = node.serve(body).await;
                    node.send_quiet(from_addr, GridMessage::Response { id, body });
                });
            }
        }
    }

    async fn serve(self: &Arc<Self>, body: Request) -> Response {
        match body {
            Request::CreateRegion(config) => Response::Created(self.create_region_here(config).await),
            Request::DestroyRegion { name } => {
                Response::Destroyed(self.destroy_region_here(&name).await)
            }
            Request::DirectoryFetch => {
                let snapshot = self.directory.current();
                Response::Directory {
                    revision: snapshot.revision,
                    entries: snapshot.regions().map(|e| RegionEntry::clone(e)).collect(),
                    retired: snapshot.retired().cloned().collect(),
                }
            }
            Request::DirectoryUpdate(entry) => {
                self.install_entry(entry).await;
                Response::DirectoryAck
            }
            Request::WriteForward(forward) => Response::Write(self.serve_write(forward).await),
            Request::Read(read) => Response::Read(self.serve_read(read).await),
            Request::SnapshotChunk(chunk) => {
                Response::ChunkAck(self.queue_chunk(chunk).await.finish(self).await)
            }
            Request::HandoffFinalize {
                region,
                bucket,
                epoch,
                target,
            } => Response::HandoffReady(handoff::finalize(self, &region, bucket, epoch, target).await),
        }
    }

    // --- directory and reconciliation ---

    /// Installs an entry received from elsewhere and reconciles local
    /// buckets against it. Returns false if the entry was not newer.
    async fn install_entry(self: &Arc<Self>, entry: RegionEntry) -> bool {
        let previous = self.directory.entry(entry.name());
        if !self.directory.install(entry.clone()) {
            return false;
        }
        debug!(
            region = %entry.id,
            revision = %entry.revision,
            state = %entry.state,
            "directory entry installed"
        );
        self.apply_entry(&entry, previous.as_deref()).await;
        true
    }

    /// Brings the local bucket actors in line with `entry`.
    ///
    /// Spawns actors for newly owned buckets, updates roles of existing
    /// ones and drops the rest. As primary, starts seeding any owner the
    /// previous table did not have.
    async fn apply_entry(self: &Arc<Self>, entry: &RegionEntry, previous: Option<&RegionEntry>) {
        if let Some(prev) = previous.filter(|p| p.id != entry.id) {
            // the name was reused: whatever the old region left is garbage
            self.drop_region(&prev.id).await;
        }
        if matches!(entry.state, RegionState::Destroying | RegionState::Destroyed) {
            self.drop_region(&entry.id).await;
            return;
        }
        let previous = previous.filter(|p| p.id == entry.id);

        for (index, ownership) in entry.table.buckets().iter().enumerate() {
            let bucket = index as u32;
            let role = entry.table.role_of(self.id, bucket);
            let key = (entry.id.clone(), bucket);
            if !role.is_owner() {
                if self.buckets.remove(&key).is_some() {
                    debug!(region = %entry.id, bucket, "released bucket");
                }
                continue;
            }

            match self.bucket(&entry.id, bucket) {
                Some(handle) => {
                    let update = BucketRequest::SetRole {
                        role,
                        secondaries: ownership.secondaries.clone(),
                    };
                    if handle.dispatch(update).await.is_err() {
                        self.spawn_bucket(entry.id.clone(), bucket, role, ownership.secondaries.clone());
                    }
                }
                None => {
                    self.spawn_bucket(entry.id.clone(), bucket, role, ownership.secondaries.clone());
                }
            }

            if role.is_primary() {
                self.seed_new_owners(entry, bucket, ownership, previous).await;
            }
        }
    }

    async fn seed_new_owners(
        self: &Arc<Self>,
        entry: &RegionEntry,
        bucket: u32,
        ownership: &BucketOwnership,
        previous: Option<&RegionEntry>,
    ) {
        let owners: Vec<MemberId> = ownership.owners().collect();
        self.handoffs
            .lock()
            .await
            .retain_targets(&entry.id, bucket, &owners);
        let Some(before) = previous.and_then(|p| p.table.bucket(bucket)) else {
            // a fresh region has nothing to seed
            return;
        };
        // a promoted primary cannot tell how far its predecessor got with
        // seeding, so it re-seeds everyone; entries already held are skipped
        let promoted = before.primary != Some(self.id);
        for target in ownership
            .secondaries
            .iter()
            .filter(|s| promoted || !before.is_owner(**s))
        {
            let key = HandoffKey {
                region: entry.id.clone(),
                bucket,
                target: *target,
            };
            handoff::spawn_seed(self, key);
        }
    }

    fn spawn_bucket(
        &self,
        region: RegionId,
        bucket: u32,
        role: OwnerRole,
        secondaries: Secondaries,
    ) -> BucketHandle {
        let incarnation = self
            .view()
            .member(self.id)
            .map(|m| m.incarnation)
            .unwrap_or(0);
        debug!(region = %region, bucket, %role, "hosting bucket");
        let config = BucketConfig {
            region: region.clone(),
            bucket,
            member: self.id,
            incarnation,
            role,
            secondaries,
            durability: self.durability.clone(),
            sink: self.replication.clone(),
        };
        let handle = lode_core::spawn_bucket(self.config.node.bucket_queue, config);
        self.buckets.insert((region, bucket), handle.clone());
        handle
    }

    async fn drop_region(&self, id: &RegionId) {
        let before = self.buckets.len();
        self.buckets.retain(|(region, _), _| region != id);
        let dropped = before - self.buckets.len();
        if dropped > 0 {
            debug!(region = %id, buckets = dropped, "dropped region buckets");
        }
        self.handoffs.lock().await.forget_region(id);
    }

    /// The actor an inbound replication or hand-off for `region`/`bucket`
    /// should go to.
    ///
    /// A primary can ship entries before its new secondary has installed
    /// the table naming it. If the local directory has nothing newer that
    /// says otherwise, the secondary starts hosting the bucket right away;
    /// the table arriving later confirms the role.
    fn bucket_for_incoming(&self, region: &RegionId, bucket: u32, epoch: u64) -> Option<BucketHandle> {
        if let Some(handle) = self.bucket(region, bucket) {
            return Some(handle);
        }
        let snapshot = self.directory.current();
        if snapshot.is_retired(region) {
            return None;
        }
        if let Some(local) = snapshot.region(&region.name) {
            if local.id.serial > region.serial {
                return None;
            }
            if local.id == *region
                && (!local.is_active() && local.state != RegionState::Creating
                    || local.table.epoch_of(bucket).is_some_and(|e| e >= epoch))
            {
                return None;
            }
        }
        debug!(region = %region, bucket, epoch, "hosting bucket ahead of its table");
        Some(self.spawn_bucket(
            region.clone(),
            bucket,
            OwnerRole::SecondaryFor { bucket, epoch },
            Secondaries::new(),
        ))
    }

    async fn on_replicate(self: &Arc<Self>, from_addr: SocketAddr, apply: ReplicateApply) {
        let ReplicateApply {
            ack_id,
            region,
            bucket,
            epoch,
            entry,
        } = apply;
        let queued = match self.bucket_for_incoming(&region, bucket, epoch) {
            Some(handle) => handle
                .dispatch(BucketRequest::Replicate { epoch, entry })
                .await
                .ok(),
            None => None,
        };
        let Some(reply) = queued else {
            let outcome = ReplicaOutcome::Rejected(GridError::not_owner(&region.name, bucket, self.id));
            self.send_quiet(from_addr, GridMessage::ReplicateAck { ack_id, outcome });
            return;
        };
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match reply.await {
                Ok(BucketResponse::Replicated(outcome)) => outcome,
                Ok(BucketResponse::Err(e)) => ReplicaOutcome::Rejected(e),
                _ => ReplicaOutcome::Rejected(GridError::Unavailable("bucket stopped".into())),
            };
            node.send_quiet(from_addr, GridMessage::ReplicateAck { ack_id, outcome });
        });
    }

    async fn queue_chunk(&self, chunk: BucketSnapshotChunk) -> QueuedChunk {
        let BucketSnapshotChunk {
            region,
            bucket,
            epoch,
            entries,
            last,
        } = chunk;
        let count = entries.len();
        let reply = match self.bucket_for_incoming(&region, bucket, epoch) {
            Some(handle) => handle
                .dispatch(BucketRequest::ApplyChunk { epoch, entries })
                .await
                .map_err(GridError::from),
            None => Err(GridError::not_owner(&region.name, bucket, self.id)),
        };
        QueuedChunk {
            region,
            bucket,
            count,
            last,
            reply,
        }
    }

    // --- region lifecycle (coordinator) ---

    async fn create_region_here(self: &Arc<Self>, config: RegionConfig) -> Result<RegionEntry, GridError> {
        let view = self.view();
        if !view.is_coordinator(self.id) {
            return Err(GridError::Unavailable("not the coordinator".into()));
        }
        self.check_writable().await?;

        let created = self.directory.create_region(config, &view)?;
        self.apply_entry(&created, None).await;
        self.broadcast_entry(&created).await;

        let active = self
            .directory
            .set_state(created.name(), RegionState::Active, view.generation)?;
        self.apply_entry(&active, Some(&created)).await;
        self.broadcast_entry(&active).await;
        info!(region = %active.id, revision = %active.revision, "region active");
        Ok(active)
    }

    async fn destroy_region_here(self: &Arc<Self>, name: &str) -> Result<(), GridError> {
        let view = self.view();
        if !view.is_coordinator(self.id) {
            return Err(GridError::Unavailable("not the coordinator".into()));
        }
        self.check_writable().await?;

        let previous = self.directory.entry(name);
        let destroying = self.directory.destroy_region(name, view.generation)?;
        info!(region = %destroying.id, "region destroying");
        self.apply_entry(&destroying, previous.as_deref()).await;
        self.broadcast_entry(&destroying).await;

        if let Some(revision) = self.directory.retire(&destroying.id, view.generation) {
            self.drop_region(&destroying.id).await;
            for member in view.members().iter().filter(|m| m.id != self.id) {
                self.send_quiet(
                    member.addr,
                    GridMessage::RegionRetired {
                        id: destroying.id.clone(),
                        revision,
                    },
                );
            }
        }
        info!(region = %destroying.id, "region destroyed");
        Ok(())
    }

    /// Sends `entry` to every other view member and waits, up to the
    /// request timeout, for them to acknowledge.
    async fn broadcast_entry(&self, entry: &RegionEntry) {
        let view = self.view();
        let timeout = self.config.router.request_timeout();
        let pending: Vec<_> = view
            .members()
            .iter()
            .filter(|m| m.id != self.id)
            .map(|m| (m.id, self.request(m.addr, Request::DirectoryUpdate(entry.clone()), timeout)))
            .collect();
        for (member, response) in pending {
            match response.await {
                Ok(Response::DirectoryAck) => {}
                Ok(other) => debug!(%member, "directory update got {}", response_kind(&other)),
                Err(e) => debug!(%member, region = %entry.id, "directory update not acknowledged: {e}"),
            }
        }
    }

    /// Coordinator only: publishes `ownership` for one bucket of `name`,
    /// applies it here and sends it to everyone.
    ///
    /// `expected_epoch` is the epoch of the slot `ownership` was derived
    /// from; a slot that has moved on since is left alone and `StaleEpoch`
    /// returned.
    pub(crate) async fn publish_bucket(
        self: &Arc<Self>,
        name: &str,
        bucket: u32,
        expected_epoch: u64,
        ownership: BucketOwnership,
    ) -> Result<RegionEntry, GridError> {
        let view = self.view();
        let (previous, entry) =
            self.directory
                .publish_bucket(name, bucket, expected_epoch, ownership, view.generation)?;
        self.apply_entry(&entry, Some(&previous)).await;
        self.broadcast_entry(&entry).await;
        Ok(entry)
    }

    // --- data path ---

    async fn mutate(
        self: &Arc<Self>,
        region: &str,
        key: Bytes,
        value: Option<Bytes>,
    ) -> Result<WriteAck, GridError> {
        self.check_writable().await?;
        let (key, value) = (&key, &value);
        let result = self
            .router
            .retry(
                move || self.try_write(region, key.clone(), value.clone()),
                move || self.refresh_directory(),
            )
            .await;
        match &result {
            Ok(_) => counter!("lode_writes_total").increment(1),
            Err(_) => counter!("lode_write_errors_total").increment(1),
        }
        result
    }

    async fn try_write(
        self: &Arc<Self>,
        region: &str,
        key: Bytes,
        value: Option<Bytes>,
    ) -> Result<WriteAck, GridError> {
        let entry = self.entry(region)?;
        let view = self.view();
        let route = Router::primary_route(&entry, &key, &view)?;
        if route.member == self.id {
            return self.write_bucket(&entry, route.bucket, route.epoch, key, value).await;
        }
        let addr = view
            .addr_of(route.member)
            .ok_or_else(|| GridError::not_owner(region, route.bucket, route.member))?;
        let forward = WriteForward {
            region: route.region,
            bucket: route.bucket,
            epoch: route.epoch,
            key,
            value,
        };
        // the primary may spend its whole quorum timeout waiting on acks
        let timeout = self.config.router.request_timeout() + self.config.replication.quorum_timeout();
        match self.call_with(addr, Request::WriteForward(forward), timeout).await? {
            Response::Write(result) => result,
            other => Err(unexpected(&other)),
        }
    }

    async fn write_bucket(
        &self,
        entry: &RegionEntry,
        bucket: u32,
        epoch: u64,
        key: Bytes,
        value: Option<Bytes>,
    ) -> Result<WriteAck, GridError> {
        let handle = self
            .bucket(&entry.id, bucket)
            .ok_or_else(|| GridError::not_owner(entry.name(), bucket, self.id))?;
        let accepted = match handle.send(BucketRequest::Write { key, value, epoch }).await? {
            BucketResponse::Accepted(accepted) => accepted,
            BucketResponse::Err(e) => return Err(e),
            _ => return Err(GridError::Unavailable("unexpected bucket response".into())),
        };
        // the quorum counts live secondaries only; one the view already
        // dropped would never answer
        let required = entry.config.quorum.required(accepted.targets.len());
        let degraded = accepted.skipped > 0
            || matches!(
                entry.table.health(bucket, self.view().len()),
                BucketHealth::UnderRedundant { .. }
            );
        replication::await_quorum(
            accepted,
            required,
            degraded,
            self.config.replication.quorum_timeout(),
        )
        .await
    }

    async fn serve_write(&self, forward: WriteForward) -> Result<WriteAck, GridError> {
        self.check_writable().await?;
        let entry = self.local_entry_for(&forward.region, forward.bucket)?;
        self.write_bucket(&entry, forward.bucket, forward.epoch, forward.key, forward.value)
            .await
    }

    async fn try_read(self: &Arc<Self>, region: &str, key: Bytes) -> Result<Option<Bytes>, GridError> {
        let entry = self.entry(region)?;
        let view = self.view();
        let route = Router::read_route(&entry, &key, &view, self.id)?;
        let primary_only = entry.config.read_policy == ReadPolicy::Primary;
        if route.member == self.id {
            return self
                .read_bucket(&entry.id, route.bucket, Some(route.epoch), key, primary_only)
                .await;
        }
        let addr = view
            .addr_of(route.member)
            .ok_or_else(|| GridError::not_owner(region, route.bucket, route.member))?;
        let read = ReadRequest {
            region: route.region,
            bucket: route.bucket,
            epoch: route.epoch,
            key,
        };
        match self.call(addr, Request::Read(read)).await? {
            Response::Read(result) => result,
            other => Err(unexpected(&other)),
        }
    }

    async fn read_bucket(
        &self,
        region: &RegionId,
        bucket: u32,
        epoch: Option<u64>,
        key: Bytes,
        primary_only: bool,
    ) -> Result<Option<Bytes>, GridError> {
        let handle = self
            .bucket(region, bucket)
            .ok_or_else(|| GridError::not_owner(&region.name, bucket, self.id))?;
        let read = BucketRequest::Read {
            key,
            epoch,
            primary_only,
        };
        match handle.send(read).await? {
            BucketResponse::Value(value) => Ok(value),
            BucketResponse::Err(e) => Err(e),
            _ => Err(GridError::Unavailable("unexpected bucket response".into())),
        }
    }

    async fn serve_read(&self, read: ReadRequest) -> Result<Option<Bytes>, GridError> {
        self.check_readable().await?;
        let entry = self.local_entry_for(&read.region, read.bucket)?;
        let primary_only = entry.config.read_policy == ReadPolicy::Primary;
        self.read_bucket(&read.region, read.bucket, Some(read.epoch), read.key, primary_only)
            .await
    }

    /// The local entry for a request naming `region`. A mismatch is a
    /// routing error unless the region is gone for good.
    fn local_entry_for(&self, region: &RegionId, bucket: u32) -> Result<Arc<RegionEntry>, GridError> {
        let snapshot = self.directory.current();
        match snapshot.region(&region.name) {
            Some(entry) if entry.id == *region => Ok(Arc::clone(entry)),
            _ if snapshot.is_retired(region) => Err(GridError::RegionNotFound(region.name.clone())),
            _ => Err(GridError::not_owner(&region.name, bucket, self.id)),
        }
    }
}

/// A hand-off chunk queued on its bucket actor, waiting for the result.
struct QueuedChunk {
    region: RegionId,
    bucket: u32,
    count: usize,
    last: bool,
    reply: Result<oneshot::Receiver<BucketResponse>, GridError>,
}

impl QueuedChunk {
    async fn finish(self, node: &NodeInner) -> Result<usize, GridError> {
        let applied = match self.reply?.await {
            Ok(BucketResponse::ChunkApplied(n)) => n,
            Ok(BucketResponse::Err(e)) => return Err(e),
            _ => return Err(GridError::Unavailable("bucket stopped".into())),
        };
        let mut handoffs = node.handoffs.lock().await;
        handoffs.record_incoming(&self.region, self.bucket, self.count);
        if self.last {
            let total = handoffs.finish_incoming(&self.region, self.bucket);
            if total > 0 {
                info!(region = %self.region, bucket = self.bucket, entries = total, "bucket copy received");
            }
        }
        Ok(applied)
    }
}

fn response_kind(response: &Response) -> &'static str {
    match response {
        Response::Created(_) => "created",
        Response::Destroyed(_) => "destroyed",
        Response::Directory { .. } => "directory",
        Response::DirectoryAck => "directory-ack",
        Response::Write(_) => "write",
        Response::Read(_) => "read",
        Response::ChunkAck(_) => "chunk-ack",
        Response::HandoffReady(_) => "handoff-ready",
    }
}

pub(crate) fn unexpected(response: &Response) -> GridError {
    GridError::Transport(format!("unexpected {} response", response_kind(response)))
}
