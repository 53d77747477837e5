//! Collaborators the broker notifies while routing and receiving.
//!
//! None of these can influence a routing decision: they are handed the message after the
//! decision is made.

use std::{fmt, io, sync::Arc};

use bytes::Bytes;
use fedemu_wire::{Message, NodeId};
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Side channel invoked with every routed message. Observers may keep their own state
/// (e.g. counting interfaces per remote server) but only get a shared reference.
pub trait RouteObserver: Send + Sync + 'static {
    fn observe(&self, msg: &Message);
}

impl<F> RouteObserver for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn observe(&self, msg: &Message) {
        self(msg)
    }
}

/// A locally attached session observer (e.g. a connected GUI) that receives every
/// message coming back from remote servers.
pub trait LocalObserver: Send + Sync + 'static {
    fn deliver(&self, raw: &Bytes) -> io::Result<()>;
}

impl LocalObserver for mpsc::UnboundedSender<Bytes> {
    fn deliver(&self, raw: &Bytes) -> io::Result<()> {
        self.send(raw.clone()).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

/// Receives link messages from remote servers so cross-host links can be displayed.
pub trait VisualizationSink: Send + Sync + 'static {
    fn handle_distributed(&self, msg: &Message);
}

impl<F> VisualizationSink for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn handle_distributed(&self, msg: &Message) {
        self(msg)
    }
}

/// The session owning the broker. Notified when every server reported instantiation
/// complete, so it can re-check whether the runtime transition may happen.
pub trait SessionLifecycle: Send + Sync + 'static {
    fn check_runtime_readiness(&self);
}

/// Mobility hook for physical passthrough nodes: their NODE messages carry positions that
/// must be applied to the real device.
pub trait PhysicalNodeHook: Send + Sync + 'static {
    fn update_position(&self, node: NodeId, msg: &Message);
}

impl<F> PhysicalNodeHook for F
where
    F: Fn(NodeId, &Message) + Send + Sync + 'static,
{
    fn update_position(&self, node: NodeId, msg: &Message) {
        self(node, msg)
    }
}

/// Every registered collaborator, shared between the router and the receive loop.
#[derive(Default)]
pub struct Hooks {
    route_observers: RwLock<Vec<Arc<dyn RouteObserver>>>,
    local_observers: RwLock<Vec<Arc<dyn LocalObserver>>>,
    visualization: RwLock<Option<Arc<dyn VisualizationSink>>>,
    lifecycle: RwLock<Option<Arc<dyn SessionLifecycle>>>,
    physical: RwLock<Option<Arc<dyn PhysicalNodeHook>>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("route_observers", &self.route_observers.read().len())
            .field("local_observers", &self.local_observers.read().len())
            .field("visualization", &self.visualization.read().is_some())
            .field("lifecycle", &self.lifecycle.read().is_some())
            .field("physical", &self.physical.read().is_some())
            .finish()
    }
}

impl Hooks {
    /// Observers are invoked in registration order.
    pub fn add_route_observer(&self, observer: impl RouteObserver) {
        self.route_observers.write().push(Arc::new(observer));
    }

    pub fn add_local_observer(&self, observer: impl LocalObserver) {
        self.local_observers.write().push(Arc::new(observer));
    }

    pub fn set_visualization(&self, sink: impl VisualizationSink) {
        *self.visualization.write() = Some(Arc::new(sink));
    }

    pub fn set_lifecycle(&self, lifecycle: impl SessionLifecycle) {
        *self.lifecycle.write() = Some(Arc::new(lifecycle));
    }

    pub fn set_physical_hook(&self, hook: impl PhysicalNodeHook) {
        *self.physical.write() = Some(Arc::new(hook));
    }

    pub(crate) fn observe(&self, msg: &Message) {
        for observer in self.route_observers.read().iter() {
            observer.observe(msg);
        }
    }

    /// Delivers `raw` to every local observer. Returns the number of failed deliveries.
    pub(crate) fn broadcast_local(&self, raw: &Bytes) -> usize {
        let mut failed = 0;
        for observer in self.local_observers.read().iter() {
            if let Err(e) = observer.deliver(raw) {
                tracing::warn!(?e, "error sending message to local observer");
                failed += 1;
            }
        }

        failed
    }

    pub(crate) fn visualize(&self, msg: &Message) {
        if let Some(sink) = self.visualization.read().as_ref() {
            sink.handle_distributed(msg);
        }
    }

    pub(crate) fn check_runtime_readiness(&self) {
        if let Some(lifecycle) = self.lifecycle.read().as_ref() {
            lifecycle.check_runtime_readiness();
        }
    }

    pub(crate) fn update_physical(&self, node: NodeId, msg: &Message) {
        match self.physical.read().as_ref() {
            Some(hook) => hook.update_position(node, msg),
            None => tracing::debug!(node, "no physical node hook registered"),
        }
    }
}
