//! Serialized, rate limited rebuilds of wireless forwarding rules.
//!
//! ebtables can only be changed safely by one writer at a time, system-wide. One
//! [`LinkRuleScheduler`] is shared by every wireless network of a process: networks mark
//! themselves dirty when their link state changes and a single background task rebuilds
//! the rules of each dirty network at most once per interval.

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use fedemu_net::{
    command,
    ebtables::{AtomicTable, RuleCommand},
    CommandRunner,
};
use fedemu_wire::NodeId;
use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::Instrument;

use crate::network::WirelessNetwork;

/// Default interval between two rebuilds of the same network.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(300);

/// Applies a batch of rule commands atomically.
pub trait RuleEngine: Send + Sync + fmt::Debug + 'static {
    fn commit(&self, commands: &[RuleCommand]) -> command::Result<()>;
}

impl<R: CommandRunner + 'static> RuleEngine for AtomicTable<R> {
    fn commit(&self, commands: &[RuleCommand]) -> command::Result<()> {
        Self::commit(self, commands)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Minimum time between two rebuilds of the same network, also the tick of the loop.
    interval: Duration,
    /// File used by ebtables to stage atomic updates.
    atomic_file: PathBuf,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            atomic_file: std::env::temp_dir().join(format!("fedemu-ebtables-{}", std::process::id())),
        }
    }
}

impl SchedulerOptions {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn atomic_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.atomic_file = path.into();
        self
    }
}

#[derive(Debug, Default)]
struct State {
    /// Attached networks. The scheduler does not keep them alive.
    networks: HashMap<NodeId, Weak<WirelessNetwork>>,
    /// Networks waiting for a rebuild, in the order they were marked.
    dirty: Vec<NodeId>,
    last_rebuild: HashMap<NodeId, Instant>,
    task: Option<JoinHandle<()>>,
}

impl State {
    /// Takes the dirty networks whose last rebuild is at least `interval` old. The others
    /// stay dirty until a later tick.
    fn take_due(&mut self, now: Instant, interval: Duration) -> Vec<Arc<WirelessNetwork>> {
        let mut due = Vec::new();
        let networks = &self.networks;
        let last_rebuild = &self.last_rebuild;

        self.dirty.retain(|id| {
            if last_rebuild.get(id).is_some_and(|last| now.duration_since(*last) < interval) {
                return true;
            }
            due.extend(networks.get(id).and_then(Weak::upgrade));
            false
        });

        due
    }
}

#[derive(Debug)]
struct Shared {
    options: SchedulerOptions,
    engine: Arc<dyn RuleEngine>,
    state: Mutex<State>,
    rebuilds: AtomicUsize,
}

impl Shared {
    async fn rebuild(&self, network: Arc<WirelessNetwork>) {
        let id = network.id();
        let commands = network.rule_commands();
        drop(network);

        let engine = Arc::clone(&self.engine);
        let count = commands.len();
        match tokio::task::spawn_blocking(move || engine.commit(&commands)).await {
            Ok(Ok(())) => {
                self.rebuilds.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(network = id, commands = count, "rebuilt wireless rules");
            }
            Ok(Err(e)) => tracing::error!(?e, network = id, "error committing wireless rules"),
            Err(e) => tracing::error!(?e, network = id, "rule commit task failed"),
        }

        let mut state = self.state.lock();
        if state.networks.contains_key(&id) {
            state.last_rebuild.insert(id, Instant::now());
        }
    }
}

async fn run(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let due = {
            let mut state = shared.state.lock();
            if state.networks.is_empty() {
                state.task = None;
                break;
            }
            state.take_due(Instant::now(), shared.options.interval)
        };

        for network in due {
            shared.rebuild(network).await;
        }
    }

    tracing::debug!("no wireless network left, stopped");
}

/// The process-wide rebuild loop of wireless forwarding rules. Cloning is cheap and
/// yields a handle to the same scheduler.
///
/// The loop starts when the first network is attached and stops on the first tick
/// without any network.
#[derive(Debug, Clone)]
pub struct LinkRuleScheduler {
    shared: Arc<Shared>,
}

impl LinkRuleScheduler {
    pub fn new(engine: impl RuleEngine) -> Self {
        Self::with_options(engine, SchedulerOptions::default())
    }

    pub fn with_options(engine: impl RuleEngine, options: SchedulerOptions) -> Self {
        let shared =
            Shared { options, engine: Arc::new(engine), state: Mutex::default(), rebuilds: AtomicUsize::new(0) };
        Self { shared: Arc::new(shared) }
    }

    /// A scheduler committing through `ebtables` with the atomic file of `options`.
    pub fn ebtables(runner: Arc<dyn CommandRunner>, options: SchedulerOptions) -> Self {
        let table = AtomicTable::new(runner, options.atomic_file.clone());
        Self::with_options(table, options)
    }

    /// Registers `network`, starting the loop if it is not running.
    pub(crate) fn attach(&self, network: &Arc<WirelessNetwork>) {
        let mut state = self.shared.state.lock();
        state.networks.insert(network.id(), Arc::downgrade(network));

        if state.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let span = tracing::info_span!("rule_scheduler");
                state.task = Some(handle.spawn(run(Arc::clone(&self.shared)).instrument(span)));
                tracing::debug!(network = network.id(), "started rule scheduler");
            }
            Err(e) => tracing::warn!(?e, network = network.id(), "no runtime, rules will not be rebuilt"),
        }
    }

    /// Forgets network `id` and any pending rebuild of it.
    pub(crate) fn detach(&self, id: NodeId) {
        let mut state = self.shared.state.lock();
        state.networks.remove(&id);
        state.dirty.retain(|d| *d != id);
        state.last_rebuild.remove(&id);
    }

    /// Queues a rebuild of network `id`. Marking a network that is already queued does
    /// nothing.
    pub fn mark_dirty(&self, id: NodeId) {
        let mut state = self.shared.state.lock();
        if !state.networks.contains_key(&id) {
            tracing::trace!(network = id, "ignoring unattached network");
            return;
        }
        if !state.dirty.contains(&id) {
            state.dirty.push(id);
        }
    }

    /// Whether the rebuild loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Number of attached networks.
    pub fn networks(&self) -> usize {
        self.shared.state.lock().networks.len()
    }

    /// Number of successful rebuilds so far.
    pub fn rebuilds(&self) -> usize {
        self.shared.rebuilds.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) fn dry_run() -> (LinkRuleScheduler, fedemu_net::Recorder) {
    let recorder = fedemu_net::Recorder::new();
    let options = SchedulerOptions::default().atomic_file("/tmp/fedemu-test.ebtables");
    (LinkRuleScheduler::ebtables(Arc::new(recorder.clone()), options), recorder)
}
