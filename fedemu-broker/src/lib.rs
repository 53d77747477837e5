#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Distributed session broker.
//!
//! Decides, for every control message of an emulation session, whether it is handled on
//! this host, forwarded to remote emulation servers, or both. Links between nodes living
//! on different hosts are stitched together with GRE tunnels.

use std::net::SocketAddr;

use thiserror::Error;

mod broker;
pub use broker::{Broker, BrokerOptions};

mod connection;
pub use connection::{ConnectionId, ServerConnection};

mod hooks;
pub use hooks::{Hooks, LocalObserver, PhysicalNodeHook, RouteObserver, SessionLifecycle, VisualizationSink};

pub mod node;
pub use node::{NodeRegistry, NodeSpec};

mod persist;

mod placement;
pub use placement::{NodePlacementIndex, NodeSets, Placement};

mod receive;

mod router;
pub use router::{MessageRouter, RouteDecision};

mod server;
pub use server::{Server, ServerRegistry, LOCALHOST};

mod session;
pub use session::SessionState;

mod stats;
pub use stats::BrokerStats;

pub mod tunnel;
pub use tunnel::{tunnel_key, TunnelEnd, TunnelTable};

/// Default port of the emulation control protocol.
pub const DEFAULT_PORT: u16 = 4038;

/// Errors returned by the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Socket or file error.
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    /// A message could not be encoded or decoded.
    #[error("wire error: {0}")]
    Wire(#[from] fedemu_wire::Error),
    /// A tunnel could not be set up or torn down.
    #[error("tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),
    /// The connection to the given peer is no longer writable.
    #[error("connection to {0} closed")]
    ConnectionClosed(SocketAddr),
    /// A server list entry is malformed.
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// State shared between the router, the server registry and the receive loop.
#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    pub(crate) session: session::SessionStateCell,
    pub(crate) placements: NodePlacementIndex,
    pub(crate) sets: NodeSets,
    pub(crate) hooks: Hooks,
    pub(crate) stats: std::sync::Arc<BrokerStats>,
}
