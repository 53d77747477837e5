use std::{net::IpAddr, path::PathBuf, sync::Arc};

use bytes::Bytes;
use fedemu_net::CommandRunner;
use fedemu_wire::{
    tlv::{config, event, Tlv},
    EventType, Message, MessageBuilder, MessageType, NodeId, NodeType,
};

use crate::{
    hooks::Hooks,
    node::NodeRegistry,
    persist,
    router::{resolve_host, Identity, MessageRouter},
    server::{Server, ServerRegistry, LOCALHOST},
    session::SessionState,
    stats::BrokerStats,
    tunnel::{tunnel_key, Attachment, NodeTunnelFactory, TunnelEnd, TunnelRequest, TunnelTable},
    BrokerError, BrokerState, Result, DEFAULT_PORT,
};

/// Configuration object carrying the emulation server list.
pub const BROKER_CONFIG_OBJECT: &str = "broker";

/// Configuration message types. Requests and resets carry no server list.
const CONFIG_TYPE_REQUEST: u32 = 1;
const CONFIG_TYPE_UPDATE: u32 = 2;
const CONFIG_TYPE_RESET: u32 = 3;
/// Data type code of a string configuration value.
const CONFIG_DATA_STRING: u16 = 10;

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Id of the session owning the broker.
    session_id: u32,
    /// Whether this host runs the master session.
    master: bool,
    /// Directory receiving the server and node server files.
    session_dir: Option<PathBuf>,
    /// Command prefix opening a terminal on a remote host.
    tty_command: String,
    /// Port used for servers configured without one.
    default_port: u16,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            session_id: 0,
            master: true,
            session_dir: None,
            tty_command: "ssh -X -f".to_owned(),
            default_port: DEFAULT_PORT,
        }
    }
}

impl BrokerOptions {
    pub fn session_id(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    pub fn session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = Some(dir.into());
        self
    }

    /// Sets the command prefix used to open terminals on remote nodes, e.g. `ssh -X -f`.
    pub fn tty_command(mut self, command: impl Into<String>) -> Self {
        self.tty_command = command.into();
        self
    }

    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }
}

/// One `name:host:port` entry of a server list. Empty host or port mean "this host".
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerEntry {
    pub(crate) name: String,
    pub(crate) host: Option<String>,
    pub(crate) port: Option<u16>,
}

/// Parses the server list of a broker configuration value: `|` separated values, the
/// first one a `,` separated list of `name:host:port` entries.
pub(crate) fn parse_servers(values: &str, default_port: u16) -> Result<Vec<ServerEntry>> {
    let list = values.split('|').next().unwrap_or_default();

    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut fields = entry.split(':');
            let (Some(name), Some(host), Some(port)) = (fields.next(), fields.next(), fields.next()) else {
                return Err(BrokerError::InvalidConfig(entry.to_owned()));
            };
            if name.is_empty() {
                return Err(BrokerError::InvalidConfig(entry.to_owned()));
            }

            let host = (!host.is_empty()).then(|| host.to_owned());
            let port = match port {
                "" if host.is_some() => Some(default_port),
                "" => None,
                port => Some(port.parse().map_err(|_| BrokerError::InvalidConfig(entry.to_owned()))?),
            };

            Ok(ServerEntry { name: name.to_owned(), host, port })
        })
        .collect()
}

/// The distributed session broker of one emulation session.
///
/// Owns the server registry, the placement index, the tunnel table and the router. The
/// receive loop runs in the background as soon as a remote server is connected, so a
/// broker must be used from within a tokio runtime.
#[derive(Debug)]
pub struct Broker {
    state: Arc<BrokerState>,
    router: MessageRouter,
    registry: Arc<dyn NodeRegistry>,
    options: BrokerOptions,
}

impl Broker {
    /// Creates a broker building tunnels through `registry` and `runner`.
    pub fn new(registry: Arc<dyn NodeRegistry>, runner: Arc<dyn CommandRunner>, options: BrokerOptions) -> Self {
        let state = Arc::new(BrokerState::default());
        let servers = Arc::new(ServerRegistry::new(Arc::clone(&state), options.tty_command.clone()));
        let factory = NodeTunnelFactory::new(Arc::clone(&registry), runner);
        let identity = Identity {
            session_id: options.session_id,
            master: options.master,
            local_address: None,
            master_address: None,
        };

        let router = MessageRouter::new(
            Arc::clone(&state),
            servers,
            TunnelTable::new(Arc::new(factory)),
            identity,
            options.session_dir.clone(),
        );

        Self { state, router, registry, options }
    }

    /// Routes `msg`. Returns `true` if the message does not need to be handled by this
    /// host.
    pub fn route(&self, msg: &Message) -> bool {
        self.router.route(msg)
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        self.router.servers()
    }

    pub fn hooks(&self) -> &Hooks {
        &self.state.hooks
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.state.stats
    }

    pub fn session_state(&self) -> SessionState {
        self.router.session_state()
    }

    pub fn set_session_state(&self, state: SessionState) {
        tracing::debug!(?state, "session state changed");
        self.router.set_session_state(state);
    }

    /// Whether this host runs the master session.
    pub fn is_master(&self) -> bool {
        self.router.identity().master
    }

    /// The session id used in tunnel keys.
    pub fn tunnel_session_id(&self) -> u32 {
        self.router.identity().session_id
    }

    /// Records the address of the host that sent us the session, used as the tunnel
    /// endpoint of last resort.
    pub fn set_master_address(&self, address: IpAddr) {
        self.router.update_identity(|id| id.master_address = Some(address));
    }

    /// Adds or replaces server `name`, connecting to it when `host` and `port` are set.
    pub async fn add_server(&self, name: &str, host: Option<&str>, port: Option<u16>) -> Server {
        self.servers().add_server(name, host, port).await
    }

    pub fn remove_server(&self, name: &str) -> Option<Server> {
        self.servers().remove_server(name)
    }

    /// Handles a CONFIG message for the broker object. Returns `false` if the message is
    /// about another object.
    pub async fn handle_config(&self, msg: &Message) -> Result<bool> {
        if msg.message_type() != Some(MessageType::Config)
            || msg.tlv_str(config::OBJECT) != Some(BROKER_CONFIG_OBJECT)
        {
            return Ok(false);
        }

        if matches!(msg.tlv_u32(config::TYPE), Some(CONFIG_TYPE_REQUEST | CONFIG_TYPE_RESET)) {
            return Ok(true);
        }

        match msg.tlv_str(config::VALUES) {
            Some(values) => self.configure_servers(values, msg.tlv_str(config::SESSION)).await?,
            None => tracing::info!("emulation server data missing"),
        }

        Ok(true)
    }

    /// Configures the emulation servers from a broker configuration value.
    ///
    /// With a master `session` (`"<sid>|..."`) this host is a slave: each listed entry is
    /// this host as known by the master, so it is registered as local and its host is
    /// recorded as our own address.
    pub async fn configure_servers(&self, values: &str, session: Option<&str>) -> Result<()> {
        let entries = parse_servers(values, self.options.default_port)?;
        let master_session = match session {
            Some(session) => {
                let sid = session.split('|').next().unwrap_or_default();
                Some(sid.trim().parse::<u32>().map_err(|_| BrokerError::InvalidConfig(session.to_owned()))?)
            }
            None => None,
        };

        for entry in entries {
            let (host, port) = match master_session {
                Some(sid) => {
                    let local_address = entry.host.as_deref().and_then(resolve_host);
                    self.router.update_identity(|id| {
                        id.session_id = sid;
                        id.master = false;
                        id.local_address = local_address;
                    });
                    tracing::info!(master_session = sid, ?local_address, "configured as slave");
                    (None, None)
                }
                None => (entry.host.as_deref(), entry.port),
            };

            let server = self.add_server(&entry.name, host, port).await;
            if server.is_connected() {
                self.setup_server(&server)?;
            }
        }

        if let Err(e) = self.write_servers() {
            tracing::warn!(?e, "error writing servers file");
        }

        Ok(())
    }

    /// Sends the current session state and the server's own entry to a newly connected
    /// server.
    fn setup_server(&self, server: &Server) -> Result<()> {
        let Some(conn) = server.connection.as_ref() else {
            return Ok(());
        };

        let state = MessageBuilder::new(MessageType::Event)
            .u32(event::TYPE, self.session_state().event_type() as u32)
            .build()?;
        conn.send(state.raw().clone())?;

        let entry = format!(
            "{}:{}:{}",
            server.name,
            server.host.as_deref().unwrap_or_default(),
            server.port.map(|p| p.to_string()).unwrap_or_default()
        );
        let broker = MessageBuilder::new(MessageType::Config)
            .string(config::OBJECT, BROKER_CONFIG_OBJECT)
            .u32(config::TYPE, CONFIG_TYPE_UPDATE)
            .tlv(Tlv::new(config::DATA_TYPES, Bytes::copy_from_slice(&CONFIG_DATA_STRING.to_be_bytes())))
            .string(config::VALUES, &entry)
            .string(config::SESSION, &self.options.session_id.to_string())
            .build()?;
        conn.send(broker.raw().clone())?;

        tracing::debug!(server = %server.name, "sent session setup");
        Ok(())
    }

    /// Writes `<session_dir>/servers`, if a session directory is configured.
    pub fn write_servers(&self) -> std::io::Result<Option<PathBuf>> {
        let Some(dir) = self.router.session_dir() else {
            return Ok(None);
        };

        let master = match self.router.identity() {
            Identity { master: false, session_id, .. } => session_id,
            _ => self.options.session_id,
        };
        persist::write_servers(dir, master, &self.servers().list_all()).map(Some)
    }

    /// Creates the tunnels of every network node replicated on several servers. Returns
    /// the keys of the new tunnels.
    pub fn add_net_tunnels(&self) -> Vec<u32> {
        self.state.sets.network_nodes().into_iter().flat_map(|net| self.add_net_tunnel(net)).collect()
    }

    /// Creates one tunnel per remote host of network node `net`.
    pub fn add_net_tunnel(&self, net: NodeId) -> Vec<u32> {
        let Some(info) = self.registry.get_node(net) else {
            tracing::warn!(node = net, "network node not found");
            return Vec::new();
        };

        // these networks reach other servers without tunnels
        match info.node_type {
            NodeType::EmaneNet => return Vec::new(),
            NodeType::ControlNet if info.has_server_interface => return Vec::new(),
            _ => {}
        }

        let names = self.state.placements.servers(net);
        if names.len() < 2 {
            return Vec::new();
        }

        let identity = self.router.identity();
        let mut remotes: Vec<IpAddr> = names
            .iter()
            .filter_map(|name| self.servers().get_by_name(name))
            .filter_map(|s| s.host)
            .filter_map(|host| resolve_host(&host))
            .collect();
        if remotes.is_empty() {
            remotes.extend(identity.master_address);
        }

        let mut keys = Vec::new();
        for remote in remotes {
            let key_address = identity.local_address.unwrap_or(remote);
            let key = tunnel_key(identity.session_id, &TunnelEnd::Node(net), &TunnelEnd::Address(key_address));
            if self.router.tunnels().contains(key) {
                continue;
            }

            tracing::info!(node = net, %remote, key, "adding network tunnel");
            let request = TunnelRequest { key, remote, attach: Attachment::Node(net) };
            match self.router.tunnels().add(request, TunnelEnd::Node(net), TunnelEnd::Address(remote)) {
                Ok(true) => keys.push(key),
                Ok(false) => {}
                Err(e) => tracing::error!(?e, node = net, %remote, "error adding network tunnel"),
            }
        }

        keys
    }

    /// Marks this host as instantiated and tells the local observers.
    pub fn local_instantiation_complete(&self) -> Result<()> {
        self.servers().set_instantiation_complete(LOCALHOST);

        let msg = MessageBuilder::new(MessageType::Event)
            .u32(event::TYPE, EventType::InstantiationComplete as u32)
            .build()?;
        let failed = self.state.hooks.broadcast_local(msg.raw());
        if failed > 0 {
            self.state.stats.increment_rebroadcast_failures(failed);
        }

        Ok(())
    }

    /// `true` once every server, this host included, completed instantiation.
    pub fn instantiation_complete(&self) -> bool {
        self.servers().all_instantiated()
    }

    /// Closes every connection, tears down every tunnel and forgets every placement.
    pub fn reset(&self) {
        self.servers().reset();
        self.state.placements.clear();
        self.state.sets.clear();
        self.router.tunnels().clear();
        tracing::debug!("broker reset");
    }

    /// Resets the broker and stops the receive loop.
    pub async fn shutdown(&self) {
        self.reset();
        self.servers().stop_receive_loop().await;
    }
}
