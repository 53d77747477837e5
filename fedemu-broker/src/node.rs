//! The node registry collaborator and node type classification.

use std::{collections::BTreeMap, fmt, net::IpAddr};

use fedemu_net::gre::GreTap;
use fedemu_wire::{NodeId, NodeType};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} not found")]
    NotFound(NodeId),
    #[error("node {0} already exists")]
    Exists(NodeId),
    #[error("node operation failed: {0}")]
    Other(String),
}

/// How the broker treats a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    /// An ordinary node, instantiated on exactly the servers it is placed on.
    Node,
    /// A physical passthrough node; its position updates go to the mobility hook.
    Physical,
    /// A link-layer network (switch, hub, WLAN, ...), replicated on every server.
    Network,
}

/// Why a node type code could not be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unresolved {
    Unknown(u32),
    Unimplemented(NodeType),
}

/// Resolves a node type attribute to the class the broker handles it as.
pub fn classify(code: u32) -> Result<NodeClass, Unresolved> {
    let node_type = NodeType::try_from(code).map_err(Unresolved::Unknown)?;
    match node_type {
        NodeType::Default | NodeType::Rj45 => Ok(NodeClass::Node),
        NodeType::Physical => Ok(NodeClass::Physical),
        NodeType::Xen | NodeType::Tbd => Err(Unresolved::Unimplemented(node_type)),
        NodeType::Switch
        | NodeType::Hub
        | NodeType::WirelessLan
        | NodeType::Tunnel
        | NodeType::Ktunnel
        | NodeType::Emane
        | NodeType::TapBridge
        | NodeType::PeerToPeer
        | NodeType::ControlNet
        | NodeType::EmaneNet => Ok(NodeClass::Network),
    }
}

/// A node as seen through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    /// Control networks created with a dedicated interface towards the servers do not
    /// need tunnels.
    pub has_server_interface: bool,
}

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A bridge with a GRE tap to `remote` attached, carrying frames tagged with `key`.
    GreTapBridge { remote: IpAddr, key: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
}

/// Creates, finds and destroys emulated nodes on this host.
pub trait NodeRegistry: Send + Sync + fmt::Debug {
    fn get_node(&self, id: NodeId) -> Option<NodeInfo>;

    fn add_node(&self, spec: NodeSpec) -> Result<NodeInfo, RegistryError>;

    fn delete_node(&self, id: NodeId) -> Result<(), RegistryError>;

    /// Attaches a GRE tap device directly to an existing node.
    fn attach_tap(&self, node: NodeId, tap: &GreTap) -> Result<(), RegistryError>;
}

/// A registry that only keeps track of nodes, without touching the host.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    nodes: Mutex<BTreeMap<NodeId, NodeInfo>>,
    specs: Mutex<BTreeMap<NodeId, NodeSpec>>,
    taps: Mutex<Vec<(NodeId, String)>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing node.
    pub fn insert(&self, info: NodeInfo) {
        self.nodes.lock().insert(info.id, info);
    }

    /// The spec a node was created with, if it was created through [`NodeRegistry::add_node`].
    pub fn spec(&self, id: NodeId) -> Option<NodeSpec> {
        self.specs.lock().get(&id).cloned()
    }

    /// Every `(node, device)` pair attached with [`NodeRegistry::attach_tap`].
    pub fn taps(&self) -> Vec<(NodeId, String)> {
        self.taps.lock().clone()
    }
}

impl NodeRegistry for MemoryRegistry {
    fn get_node(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.lock().get(&id).cloned()
    }

    fn add_node(&self, spec: NodeSpec) -> Result<NodeInfo, RegistryError> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&spec.id) {
            return Err(RegistryError::Exists(spec.id));
        }

        let info = NodeInfo {
            id: spec.id,
            name: spec.name.clone(),
            node_type: NodeType::Tunnel,
            has_server_interface: false,
        };
        nodes.insert(spec.id, info.clone());
        self.specs.lock().insert(spec.id, spec);
        Ok(info)
    }

    fn delete_node(&self, id: NodeId) -> Result<(), RegistryError> {
        self.specs.lock().remove(&id);
        self.nodes.lock().remove(&id).map(|_| ()).ok_or(RegistryError::NotFound(id))
    }

    fn attach_tap(&self, node: NodeId, tap: &GreTap) -> Result<(), RegistryError> {
        if !self.nodes.lock().contains_key(&node) {
            return Err(RegistryError::NotFound(node));
        }
        self.taps.lock().push((node, tap.name.clone()));
        Ok(())
    }
}
