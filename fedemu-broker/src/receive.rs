use std::sync::{Arc, Weak};

use fedemu_wire::{
    tlv::{event, exec, Tlv},
    Codec, EventType, Message, MessageFlags, MessageType,
};
use futures::StreamExt;
use tokio::{net::tcp::OwnedReadHalf, sync::mpsc};
use tokio_stream::{StreamMap, StreamNotifyClose};
use tokio_util::codec::FramedRead;

use crate::{
    connection::ConnectionId,
    server::{Server, ServerRegistry},
    BrokerState,
};

/// Commands sent from the registry to the receive loop.
#[derive(Debug)]
pub(crate) enum ReceiveCommand {
    /// Start reading from a new connection.
    Register { id: ConnectionId, reader: OwnedReadHalf },
    /// Stop reading from a closed connection.
    Deregister { id: ConnectionId },
}

/// Outcome of receiving one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    /// The message was processed and rebroadcast; carries its size in bytes.
    Processed(usize),
    /// Like [`Received::Processed`], and the sending server no longer hosts any node.
    Drained(usize),
    /// No server owns the connection any more. It is about to be deregistered.
    Orphaned,
    /// The peer closed the connection.
    Disconnected,
    /// The stream could not be decoded.
    Malformed,
}

type ServerStream = StreamNotifyClose<FramedRead<OwnedReadHalf, Codec>>;

/// Reads from every connected server, snoops on the messages and rebroadcasts them to
/// the local observers.
///
/// Exits once the registry drops its command channel.
pub(crate) struct ReceiveLoop {
    registry: Weak<ServerRegistry>,
    state: Arc<BrokerState>,
    /// Command prefix opening a terminal on a remote host.
    remote_shell: String,
    commands: mpsc::UnboundedReceiver<ReceiveCommand>,
    streams: StreamMap<ConnectionId, ServerStream>,
}

impl ReceiveLoop {
    pub(crate) fn new(
        registry: Weak<ServerRegistry>,
        state: Arc<BrokerState>,
        remote_shell: String,
        commands: mpsc::UnboundedReceiver<ReceiveCommand>,
    ) -> Self {
        Self { registry, state, remote_shell, commands, streams: StreamMap::new() }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ReceiveCommand::Register { id, reader }) => {
                        tracing::debug!(%id, "receiving from new connection");
                        let framed = FramedRead::new(reader, Codec::new());
                        self.streams.insert(id, StreamNotifyClose::new(framed));
                    }
                    Some(ReceiveCommand::Deregister { id }) => {
                        if self.streams.remove(&id).is_some() {
                            tracing::debug!(%id, "stopped receiving from connection");
                        }
                    }
                    None => break,
                },
                Some((id, item)) = self.streams.next(), if !self.streams.is_empty() => {
                    let Some(registry) = self.registry.upgrade() else {
                        break;
                    };

                    let received = match item {
                        Some(Ok(msg)) => self.receive(&registry, id, msg),
                        Some(Err(e)) => {
                            tracing::error!(?e, %id, "malformed message from server");
                            Received::Malformed
                        }
                        None => Received::Disconnected,
                    };

                    match received {
                        Received::Processed(size) => tracing::trace!(%id, size, "received message"),
                        Received::Drained(size) => {
                            tracing::debug!(%id, size, "server no longer hosts any node");
                        }
                        Received::Orphaned => tracing::debug!(%id, "dropped message from replaced connection"),
                        Received::Disconnected | Received::Malformed => {
                            self.streams.remove(&id);
                            registry.connection_lost(id);
                        }
                    }
                }
            }
        }

        tracing::debug!(connections = self.streams.len(), "receive loop exited");
    }

    /// Processes one message from connection `id`.
    fn receive(&self, registry: &ServerRegistry, id: ConnectionId, msg: Message) -> Received {
        let Some(server) = registry.get_by_connection(id) else {
            return Received::Orphaned;
        };

        let size = msg.raw().len();
        self.state.stats.increment_rx(size);

        let (msg, drained) = self.snoop(registry, &server, msg);

        let failed = self.state.hooks.broadcast_local(msg.raw());
        if failed > 0 {
            self.state.stats.increment_rebroadcast_failures(failed);
        }

        if drained {
            Received::Drained(size)
        } else {
            Received::Processed(size)
        }
    }

    /// Type specific handling of a message from `server`. Returns the message to
    /// rebroadcast, and whether the server was left without any node.
    fn snoop(&self, registry: &ServerRegistry, server: &Server, msg: Message) -> (Message, bool) {
        let mut drained = false;

        match msg.message_type() {
            Some(MessageType::Execute) if msg.has_flag(MessageFlags::TTY) => {
                return (self.rewrite_tty(server, msg), false);
            }
            Some(MessageType::Node) if msg.has_flag(MessageFlags::DELETE) => {
                for node in msg.node_numbers() {
                    if self.state.placements.remove(node, &server.name) == 0 {
                        drained = true;
                    }
                }
            }
            Some(MessageType::Node) if msg.has_flag(MessageFlags::ADD) => {
                let count = registry.increment_boot_count(&server.name);
                tracing::trace!(server = %server.name, count, "node booted");
            }
            Some(MessageType::Link) => self.state.hooks.visualize(&msg),
            Some(MessageType::Event) => {
                let kind = msg.tlv_u32(event::TYPE).and_then(|t| EventType::try_from(t).ok());
                if kind == Some(EventType::InstantiationComplete) {
                    tracing::info!(server = %server.name, "server instantiation complete");
                    registry.set_instantiation_complete(&server.name);
                    if registry.all_instantiated() {
                        self.state.hooks.check_runtime_readiness();
                    }
                }
            }
            _ => {}
        }

        (msg, drained)
    }

    /// Wraps the terminal command of a TTY response so it opens on the server's host.
    fn rewrite_tty(&self, server: &Server, msg: Message) -> Message {
        let (Some(host), Some(result)) = (server.host.as_deref(), msg.tlv_str(exec::RESULT)) else {
            return msg;
        };

        let command = format!("{} {host} xterm -e {result}", self.remote_shell);
        match msg.with_tlv(Tlv::string(exec::RESULT, &command)) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                tracing::warn!(?e, server = %server.name, "error rewriting terminal command");
                msg
            }
        }
    }
}
