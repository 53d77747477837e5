use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for a broker.
/// These are shared between the router, the connection writers and the receive loop.
#[derive(Debug, Default)]
pub struct BrokerStats {
    /// Total messages handed to remote server connections
    messages_forwarded: AtomicUsize,
    /// Total bytes written to remote servers
    bytes_tx: AtomicUsize,
    /// Total messages received from remote servers
    messages_rx: AtomicUsize,
    /// Total bytes received from remote servers
    bytes_rx: AtomicUsize,
    /// Total failed deliveries to local observers
    rebroadcast_failures: AtomicUsize,
}

impl BrokerStats {
    #[inline]
    pub(crate) fn increment_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_rx(&self, bytes: usize) {
        self.messages_rx.fetch_add(1, Ordering::Relaxed);
        self.bytes_rx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_rebroadcast_failures(&self, count: usize) {
        self.rebroadcast_failures.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn messages_forwarded(&self) -> usize {
        self.messages_forwarded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_tx(&self) -> usize {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn messages_rx(&self) -> usize {
        self.messages_rx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_rx(&self) -> usize {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rebroadcast_failures(&self) -> usize {
        self.rebroadcast_failures.load(Ordering::Relaxed)
    }
}
