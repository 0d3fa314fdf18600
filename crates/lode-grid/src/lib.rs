//! lode-grid: the runtime of a lode member.
//!
//! [`GridNode`] runs one member: membership, the region directory, bucket
//! actors, quorum replication, routing with bounded retries, bucket
//! hand-off and growth rebalancing. Members talk over any [`Transport`];
//! [`InMemoryNetwork`] wires several of them together inside one process.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lode_grid::{GridConfig, GridNode, InMemoryNetwork};
//!
//! let net = InMemoryNetwork::new();
//! let config = GridConfig::default();
//! let (transport, inbox) = net.bind(config.node.bind)?;
//! let node = GridNode::start(config, Arc::new(transport), inbox).await?;
//! node.join_cluster(Duration::from_secs(5)).await?;
//!
//! node.create_region(node.region_config("orders", 16, 1)).await?;
//! node.write("orders", "o1", "v").await?;
//! assert_eq!(node.read("orders", "o1").await?.as_deref(), Some(&b"v"[..]));
//! ```

pub mod config;
mod handoff;
mod node;
mod rebalance;
pub mod replication;
pub mod router;
mod rpc;
pub mod status;
pub mod transport;

pub use config::{
    ConfigError, GridConfig, MembershipSection, NodeConfig, RebalanceConfig, ReplicationConfig,
    RouterConfig,
};
pub use node::{GridNode, ViewChangeStream, ViewStream, VIEW_CHANGE_BACKLOG};
pub use rebalance::{PlannedMove, RebalanceStatus};
pub use replication::{await_quorum, ReplicationCoordinator};
pub use router::{Route, Router};
pub use status::{MemberLoad, RegionStatus};
pub use transport::{InMemoryNetwork, Inbox, MemoryTransport, Transport, TransportError};
