use std::collections::{BTreeSet, HashMap, HashSet};

use fedemu_wire::NodeId;
use parking_lot::Mutex;

/// Where a node currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The node has not been placed on any server.
    Unplaced,
    /// The node lives on exactly one server.
    Single(String),
    /// The node is replicated on several servers (network nodes).
    Replicated(BTreeSet<String>),
}

#[derive(Debug, Default)]
struct Inner {
    /// Node id to the names of the servers hosting it.
    nodes: HashMap<NodeId, BTreeSet<String>>,
    /// Server name to the number of nodes placed on it.
    refs: HashMap<String, usize>,
}

/// Maps node ids to the servers hosting them, with a reference count per server.
///
/// Both maps live behind one lock: a membership change and its reference count update
/// are always observed together.
#[derive(Debug, Default)]
pub struct NodePlacementIndex {
    inner: Mutex<Inner>,
}

impl NodePlacementIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `node` on `server`. Placing a node twice on the same server is a no-op.
    pub fn add(&self, node: NodeId, server: &str) {
        let mut inner = self.inner.lock();
        if inner.nodes.entry(node).or_default().insert(server.to_owned()) {
            *inner.refs.entry(server.to_owned()).or_default() += 1;
        }
    }

    /// Removes `node` from `server` and returns the number of nodes still referencing
    /// the server. The count never goes below zero.
    pub fn remove(&self, node: NodeId, server: &str) -> usize {
        let mut inner = self.inner.lock();

        let removed = match inner.nodes.get_mut(&node) {
            Some(servers) => {
                let removed = servers.remove(server);
                if servers.is_empty() {
                    inner.nodes.remove(&node);
                }
                removed
            }
            None => false,
        };

        let count = inner.refs.entry(server.to_owned()).or_default();
        if removed {
            *count = count.saturating_sub(1);
        }
        *count
    }

    pub fn lookup(&self, node: NodeId) -> Placement {
        let inner = self.inner.lock();
        let Some(servers) = inner.nodes.get(&node) else {
            return Placement::Unplaced;
        };

        let mut iter = servers.iter();
        match (iter.next(), iter.next()) {
            (None, _) => Placement::Unplaced,
            (Some(only), None) => Placement::Single(only.clone()),
            _ => Placement::Replicated(servers.clone()),
        }
    }

    /// The names of the servers hosting `node`; empty if unplaced.
    pub fn servers(&self, node: NodeId) -> BTreeSet<String> {
        self.inner.lock().nodes.get(&node).cloned().unwrap_or_default()
    }

    /// Number of nodes placed on `server`.
    pub fn reference_count(&self, server: &str) -> usize {
        self.inner.lock().refs.get(server).copied().unwrap_or(0)
    }

    /// Servers that were referenced at some point and no longer host any node.
    pub fn unreferenced(&self) -> BTreeSet<String> {
        let inner = self.inner.lock();
        inner.refs.iter().filter(|(_, count)| **count == 0).map(|(name, _)| name.clone()).collect()
    }

    /// Every placed node with its servers.
    pub fn nodes(&self) -> Vec<(NodeId, BTreeSet<String>)> {
        let inner = self.inner.lock();
        let mut nodes: Vec<_> = inner.nodes.iter().map(|(id, s)| (*id, s.clone())).collect();
        nodes.sort_unstable_by_key(|(id, _)| *id);
        nodes
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.refs.clear();
    }
}

#[derive(Debug, Default)]
struct Sets {
    network: HashSet<NodeId>,
    physical: HashSet<NodeId>,
}

/// The network and physical node sets, updated as NODE messages are routed.
#[derive(Debug, Default)]
pub struct NodeSets {
    inner: Mutex<Sets>,
}

impl NodeSets {
    pub fn add_network(&self, node: NodeId) {
        self.inner.lock().network.insert(node);
    }

    pub fn add_physical(&self, node: NodeId) {
        self.inner.lock().physical.insert(node);
    }

    pub fn is_network(&self, node: NodeId) -> bool {
        self.inner.lock().network.contains(&node)
    }

    pub fn is_physical(&self, node: NodeId) -> bool {
        self.inner.lock().physical.contains(&node)
    }

    /// Network node ids in ascending order.
    pub fn network_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self.inner.lock().network.iter().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.network.clear();
        inner.physical.clear();
    }
}
