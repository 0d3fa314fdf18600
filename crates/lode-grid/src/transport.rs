//! Message transport between members.
//!
//! The grid only needs reliable, ordered, point-to-point delivery per
//! sender/receiver pair. [`Transport::send`] queues a message and returns
//! immediately; inbound envelopes arrive on the [`Inbox`] handed out when
//! the endpoint was bound.
//!
//! [`InMemoryNetwork`] connects members inside one process. Every message
//! is encoded and decoded on the way through, and links can be cut to
//! simulate partitions.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lode_cluster::Envelope;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Inbound envelopes for one member.
pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no member listening at {0}")]
    UnknownPeer(SocketAddr),

    #[error("connection to {0} closed")]
    Disconnected(SocketAddr),

    #[error("address {0} already in use")]
    AddrInUse(SocketAddr),

    #[error("codec error: {0}")]
    Codec(String),
}

/// Sends envelopes to other members.
pub trait Transport: Send + Sync + 'static {
    /// Queues `envelope` for delivery to `to`. Messages to the same peer
    /// are delivered in the order they were queued.
    fn send(&self, to: SocketAddr, envelope: Envelope) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct NetworkInner {
    endpoints: DashMap<SocketAddr, mpsc::UnboundedSender<Envelope>>,
    /// Directed links that silently drop traffic.
    cut: RwLock<HashSet<(SocketAddr, SocketAddr)>>,
}

impl NetworkInner {
    fn is_cut(&self, from: SocketAddr, to: SocketAddr) -> bool {
        self.cut
            .read()
            .map(|cut| cut.contains(&(from, to)))
            .unwrap_or(false)
    }

    fn update_cut(&self, f: impl FnOnce(&mut HashSet<(SocketAddr, SocketAddr)>)) {
        if let Ok(mut cut) = self.cut.write() {
            f(&mut cut);
        }
    }
}

/// An in-process network of members.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("endpoints", &self.inner.endpoints.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint at `addr`.
    pub fn bind(&self, addr: SocketAddr) -> Result<(MemoryTransport, Inbox), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.endpoints.entry(addr) {
            Entry::Occupied(e) if !e.get().is_closed() => {
                return Err(TransportError::AddrInUse(addr));
            }
            Entry::Occupied(mut e) => {
                e.insert(tx);
            }
            Entry::Vacant(e) => {
                e.insert(tx);
            }
        }
        let transport = MemoryTransport {
            local: addr,
            network: Arc::clone(&self.inner),
        };
        Ok((transport, rx))
    }

    /// Removes the endpoint at `addr`, as if its process exited.
    pub fn unbind(&self, addr: SocketAddr) {
        self.inner.endpoints.remove(&addr);
    }

    /// Cuts every link between `addr` and the rest of the network.
    pub fn isolate(&self, addr: SocketAddr) {
        let peers: Vec<SocketAddr> = self.inner.endpoints.iter().map(|e| *e.key()).collect();
        self.inner.update_cut(|cut| {
            for peer in peers.into_iter().filter(|p| *p != addr) {
                cut.insert((addr, peer));
                cut.insert((peer, addr));
            }
        });
        debug!(%addr, "isolated");
    }

    /// Cuts the links between `a` and `b` in both directions.
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.update_cut(|cut| {
            cut.insert((a, b));
            cut.insert((b, a));
        });
    }

    /// Restores every link touching `addr`.
    pub fn heal(&self, addr: SocketAddr) {
        self.inner
            .update_cut(|cut| cut.retain(|(from, to)| *from != addr && *to != addr));
        debug!(%addr, "healed");
    }

    /// Restores every link.
    pub fn heal_all(&self) {
        self.inner.update_cut(|cut| cut.clear());
    }
}

/// One member's sending side of an [`InMemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    local: SocketAddr,
    network: Arc<NetworkInner>,
}

impl Transport for MemoryTransport {
    fn send(&self, to: SocketAddr, envelope: Envelope) -> Result<(), TransportError> {
        // round-trip through the codec so in-process clusters exercise the
        // same encoding as real ones
        let bytes = envelope
            .encode()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        if self.network.is_cut(self.local, to) {
            trace!(from = %self.local, %to, kind = envelope.message.kind(), "dropped on cut link");
            return Ok(());
        }
        let decoded = Envelope::decode(&bytes).map_err(|e| TransportError::Codec(e.to_string()))?;
        let tx = self
            .network
            .endpoints
            .get(&to)
            .map(|e| e.value().clone())
            .ok_or(TransportError::UnknownPeer(to))?;
        tx.send(decoded).map_err(|_| TransportError::Disconnected(to))
    }
}
