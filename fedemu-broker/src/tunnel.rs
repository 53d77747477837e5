//! GRE tunnels stitching cross-host links together.

use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    net::IpAddr,
    sync::Arc,
};

use fedemu_net::{command, gre::GreTap, CommandRunner};
use fedemu_wire::NodeId;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use thiserror::Error;

use crate::node::{NodeKind, NodeRegistry, NodeSpec, RegistryError};

/// Errors raised while building or tearing down a tunnel device.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The node registry refused the bridge or the tap.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    /// An `ip` command failed.
    #[error("command error: {0}")]
    Command(#[from] command::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// One end of a tunnel, as used in the tunnel key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TunnelEnd {
    Node(NodeId),
    Address(IpAddr),
    /// Non-numeric endpoints such as `"ctrlnet"`.
    Named(String),
}

impl TunnelEnd {
    fn key_hash(&self) -> u64 {
        match self {
            Self::Node(id) => *id as u64,
            Self::Address(IpAddr::V4(ip)) => u32::from(*ip) as u64,
            Self::Address(ip @ IpAddr::V6(_)) => fx_hash(ip),
            Self::Named(name) => fx_hash(name),
        }
    }
}

impl fmt::Display for TunnelEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{id}"),
            Self::Address(ip) => write!(f, "{ip}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<NodeId> for TunnelEnd {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl From<IpAddr> for TunnelEnd {
    fn from(ip: IpAddr) -> Self {
        Self::Address(ip)
    }
}

fn fx_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Deterministic 32 bit key of the tunnel between `a` and `b` in session `session_id`.
/// The key is not symmetric in `a` and `b`.
pub fn tunnel_key(session_id: u32, a: &TunnelEnd, b: &TunnelEnd) -> u32 {
    let key = ((session_id as u64) << 16) ^ a.key_hash() ^ (b.key_hash() << 8);
    (key & 0xffff_ffff) as u32
}

/// What the tunnel device attaches to on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// A new bridge node, to which the local side of the link is wired.
    Bridge,
    /// An existing node (physical node or network) which adopts the tap directly.
    Node(NodeId),
}

/// What [`TunnelFactory::create`] builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// Key of the tunnel, also the GRE key.
    pub key: u32,
    /// Address of the remote host.
    pub remote: IpAddr,
    /// What the device attaches to on this host.
    pub attach: Attachment,
}

/// The device backing a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelDevice {
    /// A bridge node created through the registry.
    Bridge { node: NodeId },
    /// A bare GRE tap attached to an existing node.
    Tap(GreTap),
}

/// Builds and tears down tunnel devices.
pub trait TunnelFactory: Send + Sync + fmt::Debug {
    fn create(&self, request: &TunnelRequest) -> Result<TunnelDevice>;

    fn destroy(&self, device: &TunnelDevice) -> Result<()>;
}

/// Creates tunnel bridges through the node registry and bare taps through the command
/// runner.
#[derive(Debug, Clone)]
pub struct NodeTunnelFactory {
    registry: Arc<dyn NodeRegistry>,
    runner: Arc<dyn CommandRunner>,
}

impl NodeTunnelFactory {
    pub fn new(registry: Arc<dyn NodeRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { registry, runner }
    }
}

impl TunnelFactory for NodeTunnelFactory {
    fn create(&self, request: &TunnelRequest) -> Result<TunnelDevice> {
        match request.attach {
            Attachment::Bridge => {
                // the bridge node takes the whole key as its id
                let node: NodeId = request.key;
                let spec = NodeSpec {
                    id: node,
                    name: format!("gt{node}"),
                    kind: NodeKind::GreTapBridge { remote: request.remote, key: request.key },
                };
                self.registry.add_node(spec)?;
                Ok(TunnelDevice::Bridge { node })
            }
            Attachment::Node(node) => {
                let tap = GreTap::new(request.remote, request.key);
                tap.create(self.runner.as_ref())?;
                if let Err(e) = self.registry.attach_tap(node, &tap) {
                    if let Err(e) = tap.destroy(self.runner.as_ref()) {
                        tracing::warn!(?e, dev = %tap.name, "error removing unattached tap");
                    }
                    return Err(e.into());
                }
                Ok(TunnelDevice::Tap(tap))
            }
        }
    }

    fn destroy(&self, device: &TunnelDevice) -> Result<()> {
        match device {
            TunnelDevice::Bridge { node } => self.registry.delete_node(*node)?,
            TunnelDevice::Tap(tap) => tap.destroy(self.runner.as_ref())?,
        }
        Ok(())
    }
}

/// A live tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub key: u32,
    pub device: TunnelDevice,
    /// The endpoint on this host.
    pub local_num: TunnelEnd,
    /// The endpoint on the remote host.
    pub remote_num: TunnelEnd,
}

/// Every tunnel of a session, by key. At most one tunnel exists per key.
#[derive(Debug)]
pub struct TunnelTable {
    factory: Arc<dyn TunnelFactory>,
    tunnels: Mutex<HashMap<u32, Tunnel>>,
}

impl TunnelTable {
    pub fn new(factory: Arc<dyn TunnelFactory>) -> Self {
        Self { factory, tunnels: Mutex::new(HashMap::new()) }
    }

    /// Creates the tunnel described by `request`. Returns `false` without touching the
    /// existing tunnel if one already uses the key.
    pub fn add(&self, request: TunnelRequest, local_num: TunnelEnd, remote_num: TunnelEnd) -> Result<bool> {
        let mut tunnels = self.tunnels.lock();
        if let Some(existing) = tunnels.get(&request.key) {
            tracing::warn!(key = request.key, ?existing, "tunnel already exists");
            return Ok(false);
        }

        let device = self.factory.create(&request)?;
        tracing::info!(key = request.key, remote = %request.remote, %local_num, %remote_num, "added tunnel");

        tunnels.insert(request.key, Tunnel { key: request.key, device, local_num, remote_num });
        Ok(true)
    }

    /// Tears down the tunnel with `key`, if any.
    pub fn remove(&self, key: u32) -> Result<Option<Tunnel>> {
        let Some(tunnel) = self.tunnels.lock().remove(&key) else {
            tracing::debug!(key, "no tunnel to remove");
            return Ok(None);
        };

        self.factory.destroy(&tunnel.device)?;
        tracing::info!(key, "removed tunnel");
        Ok(Some(tunnel))
    }

    pub fn get(&self, key: u32) -> Option<Tunnel> {
        self.tunnels.lock().get(&key).cloned()
    }

    pub fn contains(&self, key: u32) -> bool {
        self.tunnels.lock().contains_key(&key)
    }

    pub fn keys(&self) -> Vec<u32> {
        let mut keys: Vec<_> = self.tunnels.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.lock().is_empty()
    }

    /// Tears down every tunnel. Failures are logged.
    pub fn clear(&self) {
        let drained: Vec<_> = self.tunnels.lock().drain().map(|(_, t)| t).collect();
        for tunnel in drained {
            if let Err(e) = self.factory.destroy(&tunnel.device) {
                tracing::warn!(?e, key = tunnel.key, "error tearing down tunnel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fedemu_net::Recorder;

    use super::*;
    use crate::node::MemoryRegistry;

    fn table() -> (TunnelTable, Arc<MemoryRegistry>, Recorder) {
        let registry = Arc::new(MemoryRegistry::new());
        let recorder = Recorder::new();
        let factory = NodeTunnelFactory::new(registry.clone(), Arc::new(recorder.clone()));
        (TunnelTable::new(Arc::new(factory)), registry, recorder)
    }

    #[test]
    fn key_is_stable_and_asymmetric() {
        let a = TunnelEnd::Node(3);
        let b = TunnelEnd::Node(7);

        assert_eq!(tunnel_key(1, &a, &b), tunnel_key(1, &a, &b));
        assert_ne!(tunnel_key(1, &a, &b), tunnel_key(1, &b, &a));
        assert_eq!(tunnel_key(1, &a, &b), (1 << 16) ^ 3 ^ (7 << 8));
    }

    #[test]
    fn key_accepts_names_and_addresses() {
        let ctrl = TunnelEnd::Named("ctrlnet".into());
        let host = TunnelEnd::Address("10.0.0.1".parse().unwrap());

        assert_eq!(tunnel_key(1, &ctrl, &host), tunnel_key(1, &ctrl, &host));
        assert_eq!(tunnel_key(0, &TunnelEnd::Node(0), &host), (0x0a00_0001u64 << 8) as u32);
    }

    #[test]
    fn duplicate_add_keeps_existing() {
        let (table, registry, _) = table();
        let request =
            TunnelRequest { key: 0x1_0203, remote: "10.0.0.1".parse().unwrap(), attach: Attachment::Bridge };

        assert!(table.add(request.clone(), 2.into(), 1.into()).unwrap());
        assert!(!table.add(request, 9.into(), 8.into()).unwrap());

        let tunnel = table.get(0x1_0203).unwrap();
        assert_eq!(tunnel.local_num, TunnelEnd::Node(2));
        assert_eq!(tunnel.device, TunnelDevice::Bridge { node: 0x1_0203 });
        assert!(registry.get_node(0x1_0203).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn tap_attaches_to_existing_node() {
        let (table, registry, recorder) = table();
        registry.insert(crate::node::NodeInfo {
            id: 4,
            name: "phys".into(),
            node_type: fedemu_wire::NodeType::Physical,
            has_server_interface: false,
        });

        let request =
            TunnelRequest { key: 0xabc, remote: "10.0.0.2".parse().unwrap(), attach: Attachment::Node(4) };
        table.add(request, 4.into(), 5.into()).unwrap();

        assert_eq!(registry.taps(), vec![(4, "gt.abc".to_owned())]);
        assert_eq!(recorder.commands().len(), 2);

        table.remove(0xabc).unwrap().unwrap();
        assert_eq!(recorder.commands().last().unwrap(), "ip link delete gt.abc");
        assert!(table.is_empty());
    }

    #[test]
    fn failed_attach_removes_tap() {
        let (table, _, recorder) = table();
        let request =
            TunnelRequest { key: 0x10, remote: "10.0.0.2".parse().unwrap(), attach: Attachment::Node(99) };

        assert!(matches!(
            table.add(request, 99.into(), 1.into()),
            Err(TunnelError::Registry(RegistryError::NotFound(99)))
        ));
        assert_eq!(recorder.commands().last().unwrap(), "ip link delete gt.10");
        assert!(!table.contains(0x10));
    }

    #[test]
    fn clear_tears_down_everything() {
        let (table, registry, _) = table();
        for key in [0x1_0001, 0x1_0002] {
            let request =
                TunnelRequest { key, remote: "10.0.0.1".parse().unwrap(), attach: Attachment::Bridge };
            table.add(request, 1.into(), 2.into()).unwrap();
        }
        assert_eq!(table.keys(), vec![0x1_0001, 0x1_0002]);

        table.clear();
        assert!(table.is_empty());
        assert!(registry.get_node(0x1_0001).is_none());
        assert!(registry.get_node(0x1_0002).is_none());
    }

    #[test]
    fn keys_sharing_low_bits_get_their_own_bridge() {
        let (table, registry, _) = table();
        for key in [0x1_0201, 0x201] {
            let request =
                TunnelRequest { key, remote: "10.0.0.1".parse().unwrap(), attach: Attachment::Bridge };
            assert!(table.add(request, 1.into(), 2.into()).unwrap());
        }

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0x1_0201).unwrap().device, TunnelDevice::Bridge { node: 0x1_0201 });
        assert_eq!(table.get(0x201).unwrap().device, TunnelDevice::Bridge { node: 0x201 });
        assert!(registry.get_node(0x1_0201).is_some());
        assert!(registry.get_node(0x201).is_some());
    }
}
