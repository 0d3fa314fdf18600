//! Membership view service.
//!
//! A coordinator-driven membership protocol. The oldest member of the
//! current view is the coordinator and is the only member that publishes
//! views; every admission and removal goes through it, so views form a
//! single totally ordered sequence of generations.
//!
//! # Protocol overview
//!
//! Each tick:
//! 1. Send a heartbeat to every other member of the view
//! 2. Members silent for `suspect_after_missed` intervals become suspect
//! 3. Members silent for `depart_after_missed` intervals are departed
//! 4. The coordinator publishes a view without departed members
//! 5. If the coordinator itself departed, its successor runs an election
//!
//! The engine is sans-IO: handlers return the messages to send and the
//! caller owns the transport.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::directory::Revision;
use crate::election::Election;
use crate::member::{Member, MemberId, MemberInfo, MemberStatus};
use crate::message::GridMessage;
use crate::view::{View, ViewChange};
use crate::GridError;

/// What a member does when it loses contact with the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Stop accepting writes until a majority view is re-established.
    /// Departures and elections require a majority of the previous view.
    #[default]
    Strict,
    /// Keep serving writes on whichever side of a partition a member is on.
    Available,
}

/// Timing and policy for the membership protocol.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before a member is suspected.
    pub suspect_after_missed: u32,
    /// Missed heartbeats before a member is considered departed.
    pub depart_after_missed: u32,
    /// Silence from the coordinator after which a member considers itself
    /// partitioned.
    pub coordinator_timeout: Duration,
    /// How long a member waits for a new view after losing the coordinator
    /// before it reports itself unavailable.
    pub election_timeout: Duration,
    pub consistency: ConsistencyMode,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            suspect_after_missed: 3,
            depart_after_missed: 6,
            coordinator_timeout: Duration::from_secs(5),
            election_timeout: Duration::from_secs(5),
            consistency: ConsistencyMode::Strict,
        }
    }
}

impl MembershipConfig {
    pub fn suspect_after(&self) -> Duration {
        self.heartbeat_interval * self.suspect_after_missed
    }

    pub fn depart_after(&self) -> Duration {
        self.heartbeat_interval * self.depart_after_missed
    }
}

/// The local member's standing in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalStatus {
    /// Not yet admitted to a view.
    Joining,
    Active,
    /// Standing for coordinator after the previous one departed.
    Electing,
    /// Cut off from the coordinator (or, on the coordinator, from a
    /// majority of the view).
    Partitioned,
    /// No view could be established within the election timeout.
    Unavailable,
    Left,
}

impl std::fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalStatus::Joining => write!(f, "joining"),
            LocalStatus::Active => write!(f, "active"),
            LocalStatus::Electing => write!(f, "electing"),
            LocalStatus::Partitioned => write!(f, "partitioned"),
            LocalStatus::Unavailable => write!(f, "unavailable"),
            LocalStatus::Left => write!(f, "left"),
        }
    }
}

/// Events emitted by the membership engine.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// A newer view was installed locally.
    ViewInstalled(ViewChange),
    MemberSuspected(MemberId),
    /// A suspected member was heard from again.
    MemberRecovered(MemberId),
    StatusChanged(LocalStatus),
}

/// Tracks the view, detects failures and drives view changes.
pub struct MembershipEngine {
    local: MemberInfo,
    /// Assigned at admission; 0 until then.
    incarnation: u64,
    config: MembershipConfig,
    seeds: Vec<SocketAddr>,
    view_tx: watch::Sender<Arc<View>>,
    status: LocalStatus,
    /// Last time anything arrived from each view member.
    last_heard: HashMap<MemberId, Instant>,
    suspects: HashSet<MemberId>,
    installed_at: Instant,
    election: Option<Election>,
    /// The candidate this member supported, per view generation.
    voted: Option<(u64, MemberId)>,
    coordinator_lost_at: Option<Instant>,
    /// Coordinator only: when it lost contact with a majority.
    minority_since: Option<Instant>,
    leaving: bool,
    event_tx: mpsc::Sender<MembershipEvent>,
}

impl MembershipEngine {
    pub fn new(
        local: MemberInfo,
        config: MembershipConfig,
        seeds: Vec<SocketAddr>,
        event_tx: mpsc::Sender<MembershipEvent>,
    ) -> Self {
        let (view_tx, _rx) = watch::channel(Arc::new(View::empty()));
        let seeds = seeds.into_iter().filter(|s| *s != local.addr).collect();
        Self {
            local,
            incarnation: 0,
            config,
            seeds,
            view_tx,
            status: LocalStatus::Joining,
            last_heard: HashMap::new(),
            suspects: HashSet::new(),
            installed_at: Instant::now(),
            election: None,
            voted: None,
            coordinator_lost_at: None,
            minority_since: None,
            leaving: false,
            event_tx,
        }
    }

    pub fn local_id(&self) -> MemberId {
        self.local.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local.addr
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn status(&self) -> LocalStatus {
        self.status
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// The most recent view this member installed.
    pub fn view(&self) -> Arc<View> {
        self.view_tx.borrow().clone()
    }

    /// Subscribes to view publications. The receiver sees every installed
    /// view in generation order, coalescing ones it was too slow to observe.
    pub fn subscribe(&self) -> watch::Receiver<Arc<View>> {
        self.view_tx.subscribe()
    }

    pub fn is_coordinator(&self) -> bool {
        self.is_admitted() && self.view().is_coordinator(self.local.id)
    }

    fn is_admitted(&self) -> bool {
        !matches!(self.status, LocalStatus::Joining | LocalStatus::Left)
    }

    /// Health of `id` as seen from this member.
    pub fn member_status(&self, id: MemberId) -> MemberStatus {
        if id == self.local.id {
            return match self.status {
                LocalStatus::Joining => MemberStatus::Starting,
                LocalStatus::Left => MemberStatus::Departed,
                _ => MemberStatus::Alive,
            };
        }
        match self.view().member(id) {
            None => MemberStatus::Departed,
            Some(_) if self.suspects.contains(&id) => MemberStatus::Suspect,
            Some(_) => MemberStatus::Alive,
        }
    }

    /// Whether this member may accept new writes right now.
    pub fn check_writable(&self) -> Result<(), GridError> {
        match self.status {
            LocalStatus::Active | LocalStatus::Electing => Ok(()),
            LocalStatus::Partitioned => match self.config.consistency {
                ConsistencyMode::Strict => Err(GridError::MembershipPartitioned),
                ConsistencyMode::Available => Ok(()),
            },
            _ => Err(self.unavailable()),
        }
    }

    /// Whether this member may serve reads right now.
    pub fn check_readable(&self) -> Result<(), GridError> {
        match self.status {
            LocalStatus::Active | LocalStatus::Electing | LocalStatus::Partitioned => Ok(()),
            _ => Err(self.unavailable()),
        }
    }

    fn unavailable(&self) -> GridError {
        let reason = match self.status {
            LocalStatus::Joining => "member has not joined the cluster",
            LocalStatus::Left => "member has left the cluster",
            _ => "no membership view could be established",
        };
        GridError::Unavailable(reason.into())
    }

    /// Starts the protocol. Without seeds this member founds a new
    /// cluster; otherwise it asks the seeds to admit it.
    pub async fn start(&mut self) -> Vec<(SocketAddr, GridMessage)> {
        if self.seeds.is_empty() {
            let founder = Member::starting(self.local.id, self.local.addr, self.local.zone.clone());
            info!(member = %self.local.id, "no seeds configured, founding a new cluster");
            self.install(Arc::new(View::founding(founder))).await;
            return Vec::new();
        }
        self.join_messages()
    }

    fn join_messages(&self) -> Vec<(SocketAddr, GridMessage)> {
        let mut targets = self.seeds.clone();
        if let Some(coordinator) = self.view().coordinator() {
            if coordinator.id != self.local.id && !targets.contains(&coordinator.addr) {
                targets.push(coordinator.addr);
            }
        }
        targets
            .into_iter()
            .map(|addr| {
                (
                    addr,
                    GridMessage::JoinRequest {
                        member: self.local.clone(),
                    },
                )
            })
            .collect()
    }

    /// Records that something arrived from `from`. Any message counts as
    /// a heartbeat.
    pub fn observe(&mut self, from: MemberId) {
        if from != self.local.id && self.view().contains(from) {
            self.last_heard.insert(from, Instant::now());
        }
    }

    /// Handles an incoming membership message.
    ///
    /// Returns a list of `(address, message)` pairs to send. Messages that
    /// are not membership traffic are ignored.
    pub async fn handle_message(
        &mut self,
        from: MemberId,
        from_addr: SocketAddr,
        msg: GridMessage,
    ) -> Vec<(SocketAddr, GridMessage)> {
        self.observe(from);
        match msg {
            GridMessage::JoinRequest { member } => self.handle_join(member).await,
            GridMessage::ViewUpdate { view } => self.handle_view(view).await,
            GridMessage::Heartbeat { generation, .. } => {
                trace!("heartbeat gen={} from {}", generation, from);
                self.handle_heartbeat(from, from_addr, generation)
            }
            GridMessage::LeaveNotice { member } => self.handle_leave_notice(member).await,
            GridMessage::ElectionRequest { generation } => {
                self.handle_election_request(from, from_addr, generation)
            }
            GridMessage::ElectionVote {
                generation,
                granted,
            } => self.handle_vote(from, generation, granted).await,
            _ => Vec::new(),
        }
    }

    /// Coordinator: admits `member`. Other members forward the request to
    /// the coordinator they know.
    pub async fn handle_join(&mut self, member: MemberInfo) -> Vec<(SocketAddr, GridMessage)> {
        if !self.is_admitted() {
            return Vec::new();
        }
        let view = self.view();
        if !view.is_coordinator(self.local.id) {
            return match view.coordinator() {
                Some(c) => {
                    debug!(member = %member.id, coordinator = %c.id, "forwarding join");
                    vec![(c.addr, GridMessage::JoinRequest { member })]
                }
                None => Vec::new(),
            };
        }
        if self.status != LocalStatus::Active {
            debug!(member = %member.id, status = %self.status, "deferring join");
            return Vec::new();
        }
        if let Some(existing) = view.member(member.id) {
            if existing.addr == member.addr {
                // retried join from a member that missed its admission
                return vec![(
                    member.addr,
                    GridMessage::ViewUpdate {
                        view: View::clone(&view),
                    },
                )];
            }
        }
        info!(member = %member.id, addr = %member.addr, "admitting member");
        let next = view.admit(Member::starting(member.id, member.addr, member.zone));
        self.publish(next).await
    }

    async fn handle_view(&mut self, view: View) -> Vec<(SocketAddr, GridMessage)> {
        let current = self.view();
        if view.generation <= current.generation || self.status == LocalStatus::Left {
            trace!(
                "ignoring view gen={} (holding gen={})",
                view.generation,
                current.generation
            );
            return Vec::new();
        }
        if self.status == LocalStatus::Joining && !view.contains(self.local.id) {
            return Vec::new();
        }
        self.install(Arc::new(view)).await;
        if self.status == LocalStatus::Joining {
            return self.join_messages();
        }
        Vec::new()
    }

    fn handle_heartbeat(
        &mut self,
        from: MemberId,
        from_addr: SocketAddr,
        generation: u64,
    ) -> Vec<(SocketAddr, GridMessage)> {
        if !self.is_coordinator() {
            return Vec::new();
        }
        let view = self.view();
        // members behind on views, and members that were removed without
        // noticing, get the current view
        if !view.contains(from) || generation < view.generation {
            debug!(member = %from, their_gen = generation, our_gen = view.generation, "resending view");
            return vec![(
                from_addr,
                GridMessage::ViewUpdate {
                    view: View::clone(&view),
                },
            )];
        }
        Vec::new()
    }

    async fn handle_leave_notice(&mut self, member: MemberId) -> Vec<(SocketAddr, GridMessage)> {
        if !self.is_admitted() {
            return Vec::new();
        }
        let view = self.view();
        if !view.is_coordinator(self.local.id) {
            return match view.coordinator() {
                Some(c) => vec![(c.addr, GridMessage::LeaveNotice { member })],
                None => Vec::new(),
            };
        }
        if !view.contains(member) {
            return Vec::new();
        }
        info!(member = %member, "member leaving");
        self.publish(view.remove(&[member])).await
    }

    fn handle_election_request(
        &mut self,
        candidate: MemberId,
        candidate_addr: SocketAddr,
        generation: u64,
    ) -> Vec<(SocketAddr, GridMessage)> {
        let view = self.view();
        let coordinator_silent = view
            .coordinator()
            .is_some_and(|c| c.id != self.local.id && self.silence(c.id, Instant::now()) > self.config.suspect_after());
        let free = match self.voted {
            Some((g, c)) => g != generation || c == candidate,
            None => true,
        };
        let granted = self.is_admitted()
            && generation == view.generation
            && view.contains(candidate)
            && coordinator_silent
            && free;
        if granted {
            self.voted = Some((generation, candidate));
        }
        debug!(candidate = %candidate, generation, granted, "election vote");
        vec![(
            candidate_addr,
            GridMessage::ElectionVote {
                generation,
                granted,
            },
        )]
    }

    async fn handle_vote(
        &mut self,
        from: MemberId,
        generation: u64,
        granted: bool,
    ) -> Vec<(SocketAddr, GridMessage)> {
        if !granted {
            return Vec::new();
        }
        let view = self.view();
        let lost = self.departed_members(&view, Instant::now());
        let electorate = self.electorate(&view, &lost);
        let won = match self.election.as_mut() {
            Some(e) if e.generation == generation => e.record_vote(from, electorate),
            _ => false,
        };
        if won {
            return self.win_election(&view, lost).await;
        }
        Vec::new()
    }

    /// Runs one protocol period.
    ///
    /// `directory` is the latest directory revision this member holds; it
    /// rides on heartbeats so members can tell when they fall behind.
    pub async fn tick(&mut self, directory: Revision) -> Vec<(SocketAddr, GridMessage)> {
        match self.status {
            LocalStatus::Left => return Vec::new(),
            LocalStatus::Joining => return self.join_messages(),
            _ => {}
        }
        let view = self.view();
        let now = Instant::now();
        let mut outgoing: Vec<_> = view
            .members()
            .iter()
            .filter(|m| m.id != self.local.id)
            .map(|m| {
                (
                    m.addr,
                    GridMessage::Heartbeat {
                        generation: view.generation,
                        directory,
                    },
                )
            })
            .collect();

        self.update_suspicion(&view, now).await;
        let lost = self.departed_members(&view, now);
        if view.is_coordinator(self.local.id) {
            outgoing.extend(self.coordinator_tick(&view, lost, now).await);
        } else {
            outgoing.extend(self.member_tick(&view, lost, now).await);
        }
        outgoing
    }

    async fn coordinator_tick(
        &mut self,
        view: &View,
        lost: Vec<MemberId>,
        now: Instant,
    ) -> Vec<(SocketAddr, GridMessage)> {
        let reachable = 1 + view
            .members()
            .iter()
            .filter(|m| m.id != self.local.id && self.silence(m.id, now) <= self.config.coordinator_timeout)
            .count();
        if self.config.consistency == ConsistencyMode::Strict && reachable < view.majority() {
            let since = *self.minority_since.get_or_insert(now);
            if now.duration_since(since) >= self.config.election_timeout {
                if self.status != LocalStatus::Unavailable {
                    error!(reachable, members = view.len(), "coordinator cut off from majority, unavailable");
                    self.set_status(LocalStatus::Unavailable).await;
                }
            } else if self.status == LocalStatus::Active {
                warn!(reachable, members = view.len(), "coordinator cut off from majority");
                self.set_status(LocalStatus::Partitioned).await;
            }
            return Vec::new();
        }
        self.minority_since = None;
        if matches!(
            self.status,
            LocalStatus::Partitioned | LocalStatus::Unavailable | LocalStatus::Electing
        ) {
            self.set_status(LocalStatus::Active).await;
        }

        if lost.is_empty() {
            return Vec::new();
        }
        let survivors = view.len() - lost.len();
        if self.config.consistency == ConsistencyMode::Strict && survivors < view.majority() {
            return Vec::new();
        }
        for id in &lost {
            warn!(member = %id, "member departed");
        }
        self.publish(view.remove(&lost)).await
    }

    async fn member_tick(
        &mut self,
        view: &View,
        lost: Vec<MemberId>,
        now: Instant,
    ) -> Vec<(SocketAddr, GridMessage)> {
        let Some(coordinator) = view.coordinator().map(|c| c.id) else {
            return Vec::new();
        };
        let silence = self.silence(coordinator, now);
        let coordinator_lost = lost.contains(&coordinator);

        if !coordinator_lost && silence <= self.config.coordinator_timeout {
            self.coordinator_lost_at = None;
            self.election = None;
            if self.status != LocalStatus::Active {
                info!(coordinator = %coordinator, "coordinator reachable again");
                self.set_status(LocalStatus::Active).await;
            }
            return Vec::new();
        }

        if silence > self.config.coordinator_timeout
            && matches!(self.status, LocalStatus::Active | LocalStatus::Electing)
        {
            warn!(coordinator = %coordinator, "coordinator unreachable, member partitioned");
            self.set_status(LocalStatus::Partitioned).await;
        }
        if !coordinator_lost {
            return Vec::new();
        }

        let lost_at = *self.coordinator_lost_at.get_or_insert(now);
        if now.duration_since(lost_at) >= self.config.election_timeout
            && self.status != LocalStatus::Unavailable
        {
            error!(generation = view.generation, "no new view within election timeout, unavailable");
            self.set_status(LocalStatus::Unavailable).await;
        }

        if self.is_successor(view, &lost) {
            return self.run_election(view, lost, now).await;
        }
        Vec::new()
    }

    /// The successor is the oldest member that is neither the coordinator
    /// nor departed.
    fn is_successor(&self, view: &View, lost: &[MemberId]) -> bool {
        view.members()
            .iter()
            .filter(|m| !lost.contains(&m.id) && !view.is_coordinator(m.id))
            .min_by_key(|m| m.seniority())
            .is_some_and(|m| m.id == self.local.id)
    }

    fn electorate(&self, view: &View, lost: &[MemberId]) -> usize {
        match self.config.consistency {
            // every member of the old view except the departed coordinator
            ConsistencyMode::Strict => view.len().saturating_sub(1),
            ConsistencyMode::Available => view.len() - lost.len(),
        }
    }

    async fn run_election(
        &mut self,
        view: &View,
        lost: Vec<MemberId>,
        now: Instant,
    ) -> Vec<(SocketAddr, GridMessage)> {
        let expired = self.election.as_ref().is_some_and(|e| {
            e.generation != view.generation
                || now.duration_since(e.started_at) >= self.config.election_timeout
        });
        if expired {
            warn!(generation = view.generation, "election timed out, retrying");
            self.election = None;
        }
        if self.election.is_none() {
            info!(generation = view.generation, "coordinator departed, standing for election");
            let mut election = Election::new(view.generation);
            self.voted = Some((view.generation, self.local.id));
            let won = election.record_vote(self.local.id, self.electorate(view, &lost));
            self.election = Some(election);
            if self.status == LocalStatus::Active {
                self.set_status(LocalStatus::Electing).await;
            }
            if won {
                return self.win_election(view, lost).await;
            }
        }
        // re-sent every tick: voters that had not yet given up on the
        // coordinator may grant on a later round
        view.members()
            .iter()
            .filter(|m| m.id != self.local.id && !lost.contains(&m.id))
            .map(|m| {
                (
                    m.addr,
                    GridMessage::ElectionRequest {
                        generation: view.generation,
                    },
                )
            })
            .collect()
    }

    async fn win_election(
        &mut self,
        view: &View,
        mut lost: Vec<MemberId>,
    ) -> Vec<(SocketAddr, GridMessage)> {
        if let Some(c) = view.coordinator() {
            if !lost.contains(&c.id) {
                lost.push(c.id);
            }
        }
        let votes = self.election.as_ref().map(Election::votes).unwrap_or(0);
        info!(generation = view.generation, votes, "election won, taking over as coordinator");
        self.election = None;
        self.publish(view.remove(&lost)).await
    }

    /// Leaves the cluster gracefully.
    ///
    /// A leaving coordinator publishes the view without itself, handing
    /// coordination to the next oldest member. Other members ask the
    /// coordinator to remove them.
    pub async fn leave(&mut self) -> Vec<(SocketAddr, GridMessage)> {
        if !self.is_admitted() {
            self.set_status(LocalStatus::Left).await;
            return Vec::new();
        }
        self.leaving = true;
        let view = self.view();
        if view.is_coordinator(self.local.id) {
            info!("coordinator leaving, publishing successor view");
            return self.publish(view.remove(&[self.local.id])).await;
        }
        match view.coordinator() {
            Some(c) => vec![(
                c.addr,
                GridMessage::LeaveNotice {
                    member: self.local.id,
                },
            )],
            None => Vec::new(),
        }
    }

    /// Marks the member as left without waiting for the departure view.
    pub async fn abandon(&mut self) {
        self.leaving = true;
        self.set_status(LocalStatus::Left).await;
    }

    /// Installs `next` locally and returns the messages announcing it to
    /// its members and to anyone it removed.
    async fn publish(&mut self, next: View) -> Vec<(SocketAddr, GridMessage)> {
        let old = self.view();
        let outgoing: Vec<_> = next
            .members()
            .iter()
            .chain(old.members().iter().filter(|m| !next.contains(m.id)))
            .filter(|m| m.id != self.local.id)
            .map(|m| {
                (
                    m.addr,
                    GridMessage::ViewUpdate {
                        view: next.clone(),
                    },
                )
            })
            .collect();
        self.install(Arc::new(next)).await;
        outgoing
    }

    async fn install(&mut self, next: Arc<View>) {
        let old = self.view();
        let now = Instant::now();
        self.installed_at = now;

        match next.member(self.local.id) {
            Some(me) => {
                self.incarnation = me.incarnation;
                self.set_status(LocalStatus::Active).await;
            }
            None if self.leaving => self.set_status(LocalStatus::Left).await,
            None => {
                warn!(generation = next.generation, "removed from view, rejoining");
                self.set_status(LocalStatus::Joining).await;
            }
        }

        // fresh view, fresh timers: members get a full threshold to be heard
        self.last_heard.clear();
        for id in next.ids().filter(|id| *id != self.local.id) {
            self.last_heard.insert(id, now);
        }
        self.suspects.retain(|id| next.contains(*id));
        self.election = None;
        self.coordinator_lost_at = None;
        self.minority_since = None;

        self.view_tx.send_replace(Arc::clone(&next));
        info!(
            generation = next.generation,
            members = next.len(),
            coordinator = %next.coordinator().map(|c| c.id).unwrap_or_default(),
            "view installed"
        );
        self.emit(MembershipEvent::ViewInstalled(ViewChange::new(old, next)))
            .await;
    }

    async fn update_suspicion(&mut self, view: &View, now: Instant) {
        let threshold = self.config.suspect_after();
        for id in view.ids().filter(|id| *id != self.local.id) {
            let silent = self.silence(id, now) > threshold;
            if silent && self.suspects.insert(id) {
                warn!(member = %id, "member suspected");
                self.emit(MembershipEvent::MemberSuspected(id)).await;
            } else if !silent && self.suspects.remove(&id) {
                info!(member = %id, "suspected member recovered");
                self.emit(MembershipEvent::MemberRecovered(id)).await;
            }
        }
    }

    fn departed_members(&self, view: &View, now: Instant) -> Vec<MemberId> {
        let threshold = self.config.depart_after();
        view.ids()
            .filter(|id| *id != self.local.id && self.silence(*id, now) > threshold)
            .collect()
    }

    fn silence(&self, id: MemberId, now: Instant) -> Duration {
        let heard = self.last_heard.get(&id).copied().unwrap_or(self.installed_at);
        now.saturating_duration_since(heard)
    }

    async fn set_status(&mut self, status: LocalStatus) {
        if self.status == status {
            return;
        }
        debug!(from = %self.status, to = %status, "local status changed");
        self.status = status;
        self.emit(MembershipEvent::StatusChanged(status)).await;
    }

    /// Sends an event to the external event channel.
    ///
    /// Logs a warning when the channel is closed. This normally only
    /// happens during shutdown.
    async fn emit(&self, event: MembershipEvent) {
        if self.event_tx.send(event).await.is_err() {
            warn!("membership event channel closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    fn fast_config(consistency: ConsistencyMode) -> MembershipConfig {
        MembershipConfig {
            heartbeat_interval: Duration::from_millis(10),
            suspect_after_missed: 2,
            depart_after_missed: 4,
            coordinator_timeout: Duration::from_millis(200),
            election_timeout: Duration::from_millis(400),
            consistency,
        }
    }

    struct Node {
        engine: MembershipEngine,
        _events: mpsc::Receiver<MembershipEvent>,
    }

    fn node(port: u16, seeds: Vec<SocketAddr>, consistency: ConsistencyMode) -> Node {
        let (tx, rx) = mpsc::channel(256);
        let info = MemberInfo {
            id: MemberId::new(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            zone: None,
        };
        Node {
            engine: MembershipEngine::new(info, fast_config(consistency), seeds, tx),
            _events: rx,
        }
    }

    /// Delivers messages between nodes until none are left. Nodes whose
    /// index is in `down` drop everything addressed to them.
    async fn deliver(
        nodes: &mut [Node],
        from: usize,
        msgs: Vec<(SocketAddr, GridMessage)>,
        down: &[usize],
    ) {
        let mut queue: VecDeque<_> = msgs.into_iter().map(|(to, m)| (from, to, m)).collect();
        while let Some((from, to, msg)) = queue.pop_front() {
            let Some(target) = nodes.iter().position(|n| n.engine.local_addr() == to) else {
                continue;
            };
            if down.contains(&target) || down.contains(&from) {
                continue;
            }
            let (from_id, from_addr) = (nodes[from].engine.local_id(), nodes[from].engine.local_addr());
            let out = nodes[target]
                .engine
                .handle_message(from_id, from_addr, msg)
                .await;
            queue.extend(out.into_iter().map(|(to, m)| (target, to, m)));
        }
    }

    /// Founds a cluster on node 0 and joins the rest through it.
    async fn cluster(n: usize, consistency: ConsistencyMode) -> Vec<Node> {
        let seed = SocketAddr::from(([127, 0, 0, 1], 9000));
        let mut nodes = vec![node(9000, vec![], consistency)];
        nodes[0].engine.start().await;
        for i in 1..n {
            nodes.push(node(9000 + i as u16, vec![seed], consistency));
            let out = nodes[i].engine.start().await;
            deliver(&mut nodes, i, out, &[]).await;
        }
        nodes
    }

    /// Lets `rounds` heartbeat intervals pass, exchanging heartbeats among
    /// nodes that are not down.
    async fn run(nodes: &mut [Node], rounds: usize, down: &[usize]) {
        for _ in 0..rounds {
            tokio::time::sleep(Duration::from_millis(10)).await;
            for i in 0..nodes.len() {
                if down.contains(&i) {
                    continue;
                }
                let out = nodes[i].engine.tick(Revision::default()).await;
                deliver(nodes, i, out, down).await;
            }
        }
    }

    #[tokio::test]
    async fn first_member_founds_cluster() {
        let mut n = node(9000, vec![], ConsistencyMode::Strict);
        assert!(n.engine.start().await.is_empty());
        let view = n.engine.view();
        assert_eq!(view.generation, 1);
        assert!(n.engine.is_coordinator());
        assert_eq!(n.engine.incarnation(), 1);
        assert_eq!(n.engine.status(), LocalStatus::Active);
    }

    #[tokio::test]
    async fn join_through_seed() {
        let nodes = cluster(3, ConsistencyMode::Strict).await;
        for n in &nodes {
            assert_eq!(n.engine.status(), LocalStatus::Active);
            assert_eq!(n.engine.view().generation, 3);
            assert_eq!(n.engine.view().len(), 3);
        }
        assert_eq!(nodes[2].engine.incarnation(), 3);
        assert!(nodes[0].engine.is_coordinator());
    }

    #[tokio::test]
    async fn join_through_non_coordinator_is_forwarded() {
        let mut nodes = cluster(2, ConsistencyMode::Strict).await;
        let via = nodes[1].engine.local_addr();
        nodes.push(node(9002, vec![via], ConsistencyMode::Strict));
        let out = nodes[2].engine.start().await;
        deliver(&mut nodes, 2, out, &[]).await;
        assert_eq!(nodes[2].engine.status(), LocalStatus::Active);
        assert_eq!(nodes[0].engine.view().len(), 3);
    }

    #[tokio::test]
    async fn retried_join_does_not_bump_generation() {
        let mut nodes = cluster(2, ConsistencyMode::Strict).await;
        let info = MemberInfo {
            id: nodes[1].engine.local_id(),
            addr: nodes[1].engine.local_addr(),
            zone: None,
        };
        let out = nodes[0].engine.handle_join(info).await;
        assert_eq!(out.len(), 1);
        assert_eq!(nodes[0].engine.view().generation, 2);
    }

    #[tokio::test]
    async fn coordinator_removes_departed_member() {
        let mut nodes = cluster(3, ConsistencyMode::Strict).await;
        let victim = nodes[2].engine.local_id();
        run(&mut nodes, 8, &[2]).await;
        let view = nodes[0].engine.view();
        assert!(!view.contains(victim));
        assert_eq!(view.len(), 2);
        assert_eq!(nodes[1].engine.view().generation, view.generation);
    }

    #[tokio::test]
    async fn strict_coordinator_in_minority_keeps_view() {
        let mut nodes = cluster(3, ConsistencyMode::Strict).await;
        run(&mut nodes, 30, &[1, 2]).await;
        assert_eq!(nodes[0].engine.view().len(), 3);
        assert_ne!(nodes[0].engine.status(), LocalStatus::Active);
        assert!(nodes[0].engine.check_writable().is_err());
    }

    #[tokio::test]
    async fn available_coordinator_shrinks_to_survivors() {
        let mut nodes = cluster(3, ConsistencyMode::Available).await;
        run(&mut nodes, 8, &[1, 2]).await;
        assert_eq!(nodes[0].engine.view().len(), 1);
        assert!(nodes[0].engine.check_writable().is_ok());
    }

    #[tokio::test]
    async fn successor_takes_over_when_coordinator_departs() {
        let mut nodes = cluster(3, ConsistencyMode::Strict).await;
        let old = nodes[0].engine.local_id();
        run(&mut nodes, 10, &[0]).await;
        for n in &nodes[1..] {
            let view = n.engine.view();
            assert!(!view.contains(old));
            assert_eq!(view.len(), 2);
            assert_eq!(n.engine.status(), LocalStatus::Active);
        }
        assert!(nodes[1].engine.is_coordinator());
    }

    #[tokio::test]
    async fn one_vote_per_generation() {
        let mut nodes = cluster(3, ConsistencyMode::Strict).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let generation = nodes[2].engine.view().generation;
        let (a, b) = (&nodes[0].engine, &nodes[1].engine);
        let (a_id, a_addr, b_id, b_addr) = (a.local_id(), a.local_addr(), b.local_id(), b.local_addr());
        // node 2 has not heard from the coordinator recently
        let first = nodes[2].engine.handle_election_request(b_id, b_addr, generation);
        assert!(matches!(first[0].1, GridMessage::ElectionVote { granted: true, .. }));
        let again = nodes[2].engine.handle_election_request(b_id, b_addr, generation);
        assert!(matches!(again[0].1, GridMessage::ElectionVote { granted: true, .. }));
        let other = nodes[2].engine.handle_election_request(a_id, a_addr, generation);
        assert!(matches!(other[0].1, GridMessage::ElectionVote { granted: false, .. }));
    }

    #[tokio::test]
    async fn graceful_leave() {
        let mut nodes = cluster(3, ConsistencyMode::Strict).await;
        let out = nodes[2].engine.leave().await;
        deliver(&mut nodes, 2, out, &[]).await;
        assert_eq!(nodes[2].engine.status(), LocalStatus::Left);
        assert_eq!(nodes[0].engine.view().len(), 2);
        assert_eq!(nodes[1].engine.view().len(), 2);
    }

    #[tokio::test]
    async fn leaving_coordinator_hands_over() {
        let mut nodes = cluster(3, ConsistencyMode::Strict).await;
        let out = nodes[0].engine.leave().await;
        deliver(&mut nodes, 0, out, &[]).await;
        assert_eq!(nodes[0].engine.status(), LocalStatus::Left);
        assert!(nodes[1].engine.is_coordinator());
        assert_eq!(nodes[2].engine.view().len(), 2);
    }

    #[tokio::test]
    async fn removed_member_rejoins_with_new_incarnation() {
        let mut nodes = cluster(3, ConsistencyMode::Strict).await;
        run(&mut nodes, 8, &[2]).await;
        assert_eq!(nodes[0].engine.view().len(), 2);
        let before = nodes[2].engine.incarnation();
        // node 2 comes back: its heartbeat reaches the coordinator, which
        // tells it about the view that dropped it
        run(&mut nodes, 3, &[]).await;
        assert_eq!(nodes[2].engine.status(), LocalStatus::Active);
        assert!(nodes[2].engine.incarnation() > before);
        assert_eq!(nodes[0].engine.view().len(), 3);
    }

    #[tokio::test]
    async fn partitioned_member_rejects_writes_in_strict_mode() {
        let mut nodes = cluster(3, ConsistencyMode::Strict).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        // node 2 still hears node 1, the successor, but not the coordinator
        let peer = nodes[1].engine.local_id();
        nodes[2].engine.observe(peer);
        nodes[2].engine.tick(Revision::default()).await;
        assert_eq!(nodes[2].engine.status(), LocalStatus::Partitioned);
        assert_eq!(
            nodes[2].engine.check_writable(),
            Err(GridError::MembershipPartitioned)
        );
        assert!(nodes[2].engine.check_readable().is_ok());
    }
}
