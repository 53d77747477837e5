use std::{collections::BTreeSet, net::IpAddr, path::PathBuf, sync::Arc};

use fedemu_wire::{
    tlv::{config, file},
    Message, MessageType,
};
use parking_lot::RwLock;

use crate::{
    placement::{NodePlacementIndex, NodeSets},
    server::ServerRegistry,
    session::SessionState,
    stats::BrokerStats,
    tunnel::TunnelTable,
    BrokerState,
};

mod link;
pub(crate) use link::resolve_host;

mod node;

/// Configuration objects that are broadcast to every server.
const BROADCAST_CONFIG_OBJECTS: [&str; 4] = ["location", "services", "session", "all"];

/// File type prefixes of files that are broadcast to every server.
const BROADCAST_FILE_PREFIXES: [&str; 2] = ["hook:", "service:"];

/// Who this host is in the session.
#[derive(Debug, Clone)]
pub(crate) struct Identity {
    /// The session id used in tunnel keys: the master's session id on a slave.
    pub(crate) session_id: u32,
    /// Whether this host runs the master session.
    pub(crate) master: bool,
    /// Address of this host as known by the master. Only set on a slave.
    pub(crate) local_address: Option<IpAddr>,
    /// Address of the host that sent us the session.
    pub(crate) master_address: Option<IpAddr>,
}

/// The outcome of a routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// Whether the message must (also) be handled on this host.
    pub handle_locally: bool,
    /// Names of the servers the message goes to.
    pub targets: BTreeSet<String>,
    /// The message to forward. Differs from the routed message when link endpoints had to
    /// be embedded.
    pub message: Message,
}

/// What a per-type handler decided.
#[derive(Debug, Default)]
struct Handled {
    handle_locally: bool,
    targets: BTreeSet<String>,
    rewritten: Option<Message>,
}

impl Handled {
    fn targets(targets: BTreeSet<String>) -> Self {
        Self { targets, ..Default::default() }
    }
}

type Handler = fn(&MessageRouter, &Message) -> Handled;

/// Routes control messages between this host and the remote emulation servers.
#[derive(Debug)]
pub struct MessageRouter {
    state: Arc<BrokerState>,
    servers: Arc<ServerRegistry>,
    tunnels: TunnelTable,
    identity: RwLock<Identity>,
    session_dir: Option<PathBuf>,
}

impl MessageRouter {
    pub(crate) fn new(
        state: Arc<BrokerState>,
        servers: Arc<ServerRegistry>,
        tunnels: TunnelTable,
        identity: Identity,
        session_dir: Option<PathBuf>,
    ) -> Self {
        Self { state, servers, tunnels, identity: RwLock::new(identity), session_dir }
    }

    /// The handler for each message type. LINK messages are decided on their own; every
    /// other type falls back to the placement of its first node when its handler
    /// returns no target.
    const fn handler(kind: Option<MessageType>) -> Handler {
        match kind {
            Some(MessageType::Node) => Self::handle_node_message,
            Some(MessageType::Link) => Self::handle_link_message,
            Some(MessageType::Event) => Self::handle_event_message,
            Some(MessageType::Config) => Self::handle_config_message,
            Some(MessageType::File) => Self::handle_file_message,
            _ => Self::handle_other_message,
        }
    }

    /// Decides where `msg` goes, without forwarding it. Tunnel and placement bookkeeping
    /// carried by the message is applied.
    ///
    /// Returns `None` when the message is not routed at all and must be handled
    /// locally: while the session is being defined, and for messages without a target
    /// that reference no node.
    pub fn decide(&self, msg: &Message) -> Option<RouteDecision> {
        if self.state.session.get() == SessionState::Definition {
            return None;
        }

        let kind = msg.message_type();
        let Handled { handle_locally, mut targets, rewritten } = Self::handler(kind)(self, msg);

        if kind != Some(MessageType::Link) && targets.is_empty() {
            let node = msg.node_numbers().first().copied()?;
            targets = self.state.placements.servers(node);
        }

        Some(RouteDecision { handle_locally, targets, message: rewritten.unwrap_or_else(|| msg.clone()) })
    }

    /// Routes `msg`: decides, notifies the route observers and forwards.
    ///
    /// Returns `true` if the message does not need to be handled by this host.
    pub fn route(&self, msg: &Message) -> bool {
        let Some(decision) = self.decide(msg) else {
            return false;
        };

        self.state.hooks.observe(&decision.message);

        let forwarded_locally = self.forward(&decision.message, &decision.targets);
        !(decision.handle_locally || forwarded_locally)
    }

    /// Sends `msg` to every server in `targets`. Returns `true` if the message must be
    /// handled here: `targets` is empty or contains this host.
    pub fn forward(&self, msg: &Message, targets: &BTreeSet<String>) -> bool {
        let mut handle_locally = targets.is_empty();

        for name in targets {
            let Some(server) = self.servers.get_by_name(name) else {
                tracing::warn!(server = %name, "forwarding to unknown server");
                continue;
            };

            if server.is_local() {
                handle_locally = true;
                continue;
            }

            let Some(conn) = server.connection.as_ref().filter(|c| c.is_live()) else {
                tracing::info!(
                    server = %name,
                    host = ?server.host,
                    port = ?server.port,
                    "server is disconnected"
                );
                continue;
            };

            match conn.send(msg.raw().clone()) {
                Ok(()) => {
                    self.state.stats.increment_forwarded();
                    tracing::trace!(server = %name, kind = msg.raw_type(), "forwarded message");
                }
                Err(e) => tracing::warn!(?e, server = %name, "error forwarding message"),
            }
        }

        handle_locally
    }

    fn all_servers(&self) -> BTreeSet<String> {
        self.servers.list_names().into_iter().collect()
    }

    fn handle_event_message(&self, _msg: &Message) -> Handled {
        Handled::targets(self.all_servers())
    }

    fn handle_config_message(&self, msg: &Message) -> Handled {
        match msg.tlv_str(config::OBJECT) {
            Some(object) if BROADCAST_CONFIG_OBJECTS.contains(&object) => {
                Handled::targets(self.all_servers())
            }
            _ => Handled::default(),
        }
    }

    fn handle_file_message(&self, msg: &Message) -> Handled {
        match msg.tlv_str(file::TYPE) {
            Some(kind) if BROADCAST_FILE_PREFIXES.iter().any(|p| kind.starts_with(p)) => {
                Handled::targets(self.all_servers())
            }
            _ => Handled::default(),
        }
    }

    fn handle_other_message(&self, _msg: &Message) -> Handled {
        Handled::default()
    }

    /// The servers messages are forwarded to.
    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    /// Tunnels of the cross-host links routed so far.
    pub fn tunnels(&self) -> &TunnelTable {
        &self.tunnels
    }

    /// Which servers every node lives on.
    pub fn placements(&self) -> &NodePlacementIndex {
        &self.state.placements
    }

    /// The network and physical nodes seen so far.
    pub fn node_sets(&self) -> &NodeSets {
        &self.state.sets
    }

    /// Forwarding and receive statistics.
    pub fn stats(&self) -> &BrokerStats {
        &self.state.stats
    }

    /// The current state of the session.
    pub fn session_state(&self) -> SessionState {
        self.state.session.get()
    }

    pub(crate) fn set_session_state(&self, state: SessionState) {
        self.state.session.set(state);
    }

    pub(crate) fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    pub(crate) fn update_identity(&self, f: impl FnOnce(&mut Identity)) {
        f(&mut self.identity.write());
    }

    pub(crate) fn session_dir(&self) -> Option<&PathBuf> {
        self.session_dir.as_ref()
    }
}
