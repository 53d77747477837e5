use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    net::{tcp::OwnedReadHalf, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::Instrument;

use crate::{
    connection::{ConnectionId, ServerConnection},
    receive::{ReceiveCommand, ReceiveLoop},
    BrokerState,
};

/// Name of the entry representing this host.
pub const LOCALHOST: &str = "localhost";

/// An emulation server taking part in the session.
#[derive(Debug, Clone)]
pub struct Server {
    pub name: String,
    /// `None` for this host.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connection: Option<ServerConnection>,
    pub instantiation_complete: bool,
    /// Number of NODE ADD responses received from this server.
    pub boot_count: usize,
}

impl Server {
    fn new(name: &str, host: Option<&str>, port: Option<u16>) -> Self {
        Self {
            name: name.to_owned(),
            host: host.map(str::to_owned),
            port,
            connection: None,
            instantiation_complete: false,
            boot_count: 0,
        }
    }

    /// A server without host and port stands for this host.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.host.is_none() && self.port.is_none()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(ServerConnection::is_live)
    }

    fn close(&self) {
        if let Some(conn) = &self.connection {
            tracing::debug!(server = %self.name, peer = %conn.peer_address(), "closing connection");
            conn.close();
        }
    }
}

/// Handle to the running receive loop.
#[derive(Debug)]
struct ReceiveHandle {
    tx: mpsc::UnboundedSender<ReceiveCommand>,
    task: JoinHandle<()>,
}

/// The known emulation servers, by name.
///
/// An entry named [`LOCALHOST`] without host and port always exists.
#[derive(Debug)]
pub struct ServerRegistry {
    servers: Mutex<BTreeMap<String, Server>>,
    receive: Mutex<Option<ReceiveHandle>>,
    state: Arc<BrokerState>,
    remote_shell: String,
}

impl ServerRegistry {
    pub(crate) fn new(state: Arc<BrokerState>, remote_shell: String) -> Self {
        let mut servers = BTreeMap::new();
        servers.insert(LOCALHOST.to_owned(), Server::new(LOCALHOST, None, None));

        Self { servers: Mutex::new(servers), receive: Mutex::new(None), state, remote_shell }
    }

    /// Adds or replaces server `name` and connects to it if `host` and `port` are given.
    ///
    /// Re-adding a live server with the same address is a no-op. A failed connection is
    /// logged and leaves the entry without a connection. A previous entry stays in place
    /// until its replacement is ready.
    pub async fn add_server(self: &Arc<Self>, name: &str, host: Option<&str>, port: Option<u16>) -> Server {
        if let Some(existing) = self.get_by_name(name) {
            if existing.host.as_deref() == host && existing.port == port && existing.is_connected() {
                tracing::debug!(server = name, "server already connected");
                return existing;
            }
        }

        let mut server = Server::new(name, host, port);
        let mut reader = None;
        if let (Some(host), Some(port)) = (host, port) {
            match TcpStream::connect((host, port)).await {
                Ok(stream) => match Self::split(stream, &self.state) {
                    Ok((conn, read)) => {
                        tracing::info!(server = name, peer = %conn.peer_address(), "connected to server");
                        server.connection = Some(conn);
                        reader = Some(read);
                    }
                    Err(e) => tracing::warn!(?e, server = name, "error setting up connection"),
                },
                Err(e) => {
                    tracing::warn!(?e, server = name, host, port, "error connecting to server");
                }
            }
        }

        // The entry must be visible before its first message can be read.
        let replaced = self.servers.lock().insert(name.to_owned(), server.clone());
        if let Some(replaced) = replaced {
            self.disconnect(&replaced);
        }

        if let (Some(id), Some(reader)) = (server.connection.as_ref().map(ServerConnection::id), reader) {
            if self.receive_loop().send(ReceiveCommand::Register { id, reader }).is_err() {
                tracing::warn!(server = name, "receive loop stopped, dropping connection");
                self.connection_lost(id);
                server.connection = None;
            }
        }

        server
    }

    /// Splits `stream` and spawns the writer of its write half.
    fn split(stream: TcpStream, state: &BrokerState) -> std::io::Result<(ServerConnection, OwnedReadHalf)> {
        let local: SocketAddr = stream.local_addr()?;
        let peer: SocketAddr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let conn = ServerConnection::spawn(ConnectionId::next(), local, peer, write, Arc::clone(&state.stats));
        Ok((conn, read))
    }

    /// The command channel of the receive loop, starting the loop if it is not running.
    fn receive_loop(self: &Arc<Self>) -> mpsc::UnboundedSender<ReceiveCommand> {
        let mut slot = self.receive.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.task.is_finished() {
                return handle.tx.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let receive = ReceiveLoop::new(
            Arc::downgrade(self),
            Arc::clone(&self.state),
            self.remote_shell.clone(),
            rx,
        );
        let task = tokio::spawn(receive.run().instrument(tracing::info_span!("receive_loop")));
        tracing::debug!("started receive loop");

        *slot = Some(ReceiveHandle { tx: tx.clone(), task });
        tx
    }

    /// Closes the connection of `server` and stops receiving from it.
    fn disconnect(&self, server: &Server) {
        server.close();
        if let Some(conn) = &server.connection {
            if let Some(handle) = self.receive.lock().as_ref() {
                let _ = handle.tx.send(ReceiveCommand::Deregister { id: conn.id() });
            }
        }
    }

    /// Closes the connection to server `name` and removes it.
    pub fn remove_server(&self, name: &str) -> Option<Server> {
        let Some(server) = self.servers.lock().remove(name) else {
            tracing::debug!(server = name, "no server to remove");
            return None;
        };

        self.disconnect(&server);
        tracing::info!(server = name, "removed server");
        Some(server)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Server> {
        self.servers.lock().get(name).cloned()
    }

    pub fn get_by_connection(&self, id: ConnectionId) -> Option<Server> {
        self.servers
            .lock()
            .values()
            .find(|s| s.connection.as_ref().is_some_and(|c| c.id() == id))
            .cloned()
    }

    /// Every server, sorted by name.
    pub fn list_all(&self) -> Vec<Server> {
        self.servers.lock().values().cloned().collect()
    }

    /// Every server name, sorted.
    pub fn list_names(&self) -> Vec<String> {
        self.servers.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }

    pub fn set_instantiation_complete(&self, name: &str) {
        match self.servers.lock().get_mut(name) {
            Some(server) => server.instantiation_complete = true,
            None => tracing::warn!(server = name, "instantiation complete from unknown server"),
        }
    }

    /// `true` once every server, this host included, reported instantiation complete.
    pub fn all_instantiated(&self) -> bool {
        self.servers.lock().values().all(|s| s.instantiation_complete)
    }

    pub(crate) fn increment_boot_count(&self, name: &str) -> usize {
        let mut servers = self.servers.lock();
        match servers.get_mut(name) {
            Some(server) => {
                server.boot_count += 1;
                server.boot_count
            }
            None => 0,
        }
    }

    /// Marks the connection `id` as gone. Called by the receive loop.
    pub(crate) fn connection_lost(&self, id: ConnectionId) {
        let mut servers = self.servers.lock();
        let Some(server) =
            servers.values_mut().find(|s| s.connection.as_ref().is_some_and(|c| c.id() == id))
        else {
            return;
        };

        server.close();
        server.connection = None;
        tracing::warn!(server = %server.name, "server disconnected");
    }

    /// Closes every connection and drops every server but [`LOCALHOST`], which is
    /// re-seeded.
    pub fn reset(&self) {
        let drained = std::mem::take(&mut *self.servers.lock());
        for server in drained.values() {
            self.disconnect(server);
        }

        self.servers.lock().insert(LOCALHOST.to_owned(), Server::new(LOCALHOST, None, None));
        tracing::debug!(servers = drained.len(), "reset servers");
    }

    /// Stops the receive loop and waits for it to exit.
    pub async fn stop_receive_loop(&self) {
        let handle = self.receive.lock().take();
        if let Some(ReceiveHandle { tx, task }) = handle {
            drop(tx);
            if let Err(e) = task.await {
                tracing::warn!(?e, "receive loop exited with error");
            }
            tracing::debug!("stopped receive loop");
        }
    }

    /// Whether the receive loop task is running.
    pub fn is_receiving(&self) -> bool {
        self.receive.lock().as_ref().is_some_and(|h| !h.task.is_finished())
    }
}
