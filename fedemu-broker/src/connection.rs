use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::Instrument;

use crate::{stats::BrokerStats, BrokerError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a connection for its whole lifetime, even after the server entry owning it
/// has been replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The write side of a connection to a remote server.
///
/// Writes are queued to a dedicated task so [`ServerConnection::send`] never blocks the
/// router. Messages sent on one connection are written in order.
#[derive(Clone)]
pub struct ServerConnection {
    id: ConnectionId,
    local: SocketAddr,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    writer: Arc<JoinHandle<()>>,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("live", &self.is_live())
            .finish()
    }
}

impl ServerConnection {
    /// Spawns the writer task for `write`.
    pub(crate) fn spawn(
        id: ConnectionId,
        local: SocketAddr,
        peer: SocketAddr,
        mut write: OwnedWriteHalf,
        stats: Arc<BrokerStats>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let span = tracing::debug_span!("server_writer", %id, %peer);
        let writer = tokio::spawn(
            async move {
                while let Some(buf) = rx.recv().await {
                    if let Err(e) = write.write_all(&buf).await {
                        tracing::warn!(?e, "error writing to server, closing connection");
                        break;
                    }
                    stats.increment_tx(buf.len());
                }

                if let Err(e) = write.shutdown().await {
                    tracing::trace!(?e, "error shutting down write half");
                }
                tracing::debug!("writer closed");
            }
            .instrument(span),
        );

        Self { id, local, peer, tx, writer: Arc::new(writer) }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    pub fn peer_address(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the writer task is still accepting messages.
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queues `raw` for writing.
    pub fn send(&self, raw: Bytes) -> Result<(), BrokerError> {
        self.tx.send(raw).map_err(|_| BrokerError::ConnectionClosed(self.peer))
    }

    /// Stops the writer task. Queued messages that were not written yet are dropped.
    pub fn close(&self) {
        self.writer.abort();
    }
}
