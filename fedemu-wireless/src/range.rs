use std::{collections::BTreeMap, fmt, sync::Arc};

use fedemu_net::{bridge, tc, tc::LinkParams, CommandRunner};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{
    config::RangeConfig,
    event::{LinkEvent, LinkEventKind},
    network::{InterfaceId, WirelessNetwork},
    Result,
};

/// Capacity of the link event channel. Slow subscribers miss the oldest events.
const EVENT_CAPACITY: usize = 1024;

/// Canvas position of an interface. An interface without `x` or `y` is not placed yet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), z: None }
    }

    pub fn with_z(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    pub const fn is_placed(&self) -> bool {
        self.x.is_some() && self.y.is_some()
    }

    /// Euclidean distance to `other`, or `None` if either is not placed. The z axis only
    /// counts when both have one.
    pub fn distance(&self, other: &Self) -> Option<f64> {
        let dx = self.x? - other.x?;
        let dy = self.y? - other.y?;
        let dz = match (self.z, other.z) {
            (Some(z1), Some(z2)) => z1 - z2,
            _ => 0.0,
        };
        Some(dx.hypot(dy).hypot(dz))
    }
}

/// Applies link parameters to interfaces and learning settings to bridges.
pub trait LinkShaper: Send + Sync + fmt::Debug {
    fn shape(&self, iface: &InterfaceId, params: &LinkParams) -> Result<()>;

    fn set_learning(&self, bridge: &str, enabled: bool) -> Result<()>;
}

/// Shapes with `tc netem` and toggles learning with `ip link`.
#[derive(Debug, Clone)]
pub struct TcShaper {
    runner: Arc<dyn CommandRunner>,
}

impl TcShaper {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl LinkShaper for TcShaper {
    fn shape(&self, iface: &InterfaceId, params: &LinkParams) -> Result<()> {
        tc::apply(self.runner.as_ref(), &iface.name, params)?;
        Ok(())
    }

    fn set_learning(&self, bridge: &str, enabled: bool) -> Result<()> {
        bridge::set_learning(self.runner.as_ref(), bridge, enabled)?;
        Ok(())
    }
}

/// Links the interfaces of a wireless network that are within range of each other and
/// unlinks the others.
///
/// Every change of link state is returned to the caller and published to the
/// subscribers. Recomputing a pair whose state does not change publishes nothing, so
/// repeated updates without movement are silent.
#[derive(Debug)]
pub struct RangeModel {
    network: Arc<WirelessNetwork>,
    shaper: Arc<dyn LinkShaper>,
    config: Mutex<RangeConfig>,
    positions: Mutex<BTreeMap<InterfaceId, Position>>,
    events: broadcast::Sender<LinkEvent>,
}

impl RangeModel {
    pub fn new(network: Arc<WirelessNetwork>, shaper: Arc<dyn LinkShaper>, config: RangeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { network, shaper, config: Mutex::new(config), positions: Mutex::default(), events }
    }

    pub fn network(&self) -> &Arc<WirelessNetwork> {
        &self.network
    }

    pub fn config(&self) -> RangeConfig {
        *self.config.lock()
    }

    /// Receives every link event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn position(&self, iface: &InterfaceId) -> Option<Position> {
        self.positions.lock().get(iface).copied()
    }

    /// Forgets `iface`. Its pairs are dropped from the network.
    pub fn remove_interface(&self, iface: &InterfaceId) {
        self.positions.lock().remove(iface);
        self.network.remove_interface(iface);
    }

    /// Records the position of `iface` and recomputes its link with every other
    /// interface. Nothing is recomputed while `iface` is not placed.
    pub fn set_position(&self, iface: &InterfaceId, position: Position) -> Vec<LinkEvent> {
        let mut positions = self.positions.lock();
        if positions.insert(iface.clone(), position).is_none() {
            self.network.add_interface(iface.clone());
        }
        if !position.is_placed() {
            return Vec::new();
        }

        positions.keys().filter_map(|other| self.recompute(&positions, iface, other)).collect()
    }

    /// Applies a batch of moves. Every moved interface is compared once with every other
    /// interface: a pair of moved interfaces is recomputed once, with both new
    /// positions.
    pub fn bulk_update(&self, moved: &[(InterfaceId, Position)]) -> Vec<LinkEvent> {
        let mut positions = self.positions.lock();
        let mut events = Vec::new();

        for (i, (iface, position)) in moved.iter().enumerate().rev() {
            match positions.get_mut(iface) {
                Some(current) => *current = *position,
                None => {
                    tracing::debug!(network = self.network.id(), %iface, "ignoring move of unknown interface");
                    continue;
                }
            }

            // pairs with a moved interface still to be processed are computed later
            let pending = &moved[..i];
            events.extend(
                positions
                    .keys()
                    .filter(|other| !pending.iter().any(|(p, _)| p == *other))
                    .filter_map(|other| self.recompute(&positions, iface, other)),
            );
        }

        events
    }

    /// Recomputes the link between `a` and `b`.
    pub fn calc_link(&self, a: &InterfaceId, b: &InterfaceId) -> Option<LinkEvent> {
        let positions = self.positions.lock();
        self.recompute(&positions, a, b)
    }

    fn recompute(
        &self,
        positions: &BTreeMap<InterfaceId, Position>,
        a: &InterfaceId,
        b: &InterfaceId,
    ) -> Option<LinkEvent> {
        if a == b {
            return None;
        }

        let distance = positions.get(a)?.distance(positions.get(b)?)?;
        let (a, b) = if a < b { (a, b) } else { (b, a) };
        let linked = self.network.linked(a, b);
        let range = self.config.lock().range;

        let kind = if distance > range && linked {
            self.network.unlink(a, b);
            LinkEventKind::Unlink
        } else if distance <= range && !linked {
            self.network.link(a, b);
            LinkEventKind::Link
        } else {
            return None;
        };

        tracing::debug!(network = self.network.id(), %a, %b, distance, ?kind, "link changed");
        let event = LinkEvent { kind, network: self.network.id(), a: a.clone(), b: b.clone() };
        // no subscriber is fine
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// A link event for every pair currently linked.
    pub fn all_links(&self) -> Vec<LinkEvent> {
        self.network
            .linked_pairs()
            .into_iter()
            .map(|(a, b)| LinkEvent { kind: LinkEventKind::Link, network: self.network.id(), a, b })
            .collect()
    }

    /// Stores `config` and applies its link parameters to every interface and its
    /// promiscuous setting to the bridge. Links are recomputed on the next move.
    pub fn update_config(&self, config: RangeConfig) -> Result<()> {
        *self.config.lock() = config;

        let params = config.link_params();
        let interfaces: Vec<InterfaceId> = self.positions.lock().keys().cloned().collect();
        for iface in &interfaces {
            self.shaper.shape(iface, &params)?;
        }
        self.shaper.set_learning(self.network.bridge(), !config.promiscuous)?;

        tracing::debug!(network = self.network.id(), interfaces = interfaces.len(), ?config, "updated range config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use fedemu_net::{ebtables::Verdict, Recorder};

    use super::*;
    use crate::scheduler::dry_run;

    fn iface(node: u32) -> InterfaceId {
        InterfaceId::new(node, format!("veth{node}.0"))
    }

    fn model() -> (RangeModel, Recorder) {
        let (scheduler, _) = dry_run();
        let network = WirelessNetwork::new(10, "b.10", Verdict::Drop, scheduler);
        let recorder = Recorder::new();
        let shaper = TcShaper::new(Arc::new(recorder.clone()));
        let config = RangeConfig { range: 100.0, ..Default::default() };

        (RangeModel::new(network, Arc::new(shaper), config), recorder)
    }

    #[test]
    fn distance_ignores_one_sided_z() {
        let a = Position::new(0.0, 0.0).with_z(10.0);
        assert_eq!(a.distance(&Position::new(3.0, 4.0)), Some(5.0));
        assert_eq!(a.distance(&Position::new(0.0, 0.0).with_z(4.0)), Some(6.0));
        assert_eq!(a.distance(&Position { x: Some(1.0), y: None, z: None }), None);
    }

    #[tokio::test]
    async fn repeated_positions_are_silent() {
        let (model, _) = model();
        model.set_position(&iface(1), Position::new(0.0, 0.0));

        let events = model.set_position(&iface(2), Position::new(50.0, 0.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LinkEventKind::Link);
        assert_eq!((events[0].a.node, events[0].b.node), (1, 2));

        assert!(model.set_position(&iface(2), Position::new(50.0, 0.0)).is_empty());
        assert!(model.set_position(&iface(1), Position::new(0.0, 0.0)).is_empty());
        assert!(model.calc_link(&iface(1), &iface(2)).is_none());
    }

    #[tokio::test]
    async fn moving_out_of_range_unlinks_once() {
        let (model, _) = model();
        model.set_position(&iface(1), Position::new(0.0, 0.0));
        model.set_position(&iface(2), Position::new(100.0, 0.0));
        assert!(model.network().linked(&iface(1), &iface(2)), "range is inclusive");

        let events = model.set_position(&iface(2), Position::new(100.5, 0.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LinkEventKind::Unlink);
        assert!(!model.network().linked(&iface(1), &iface(2)));

        assert!(model.set_position(&iface(2), Position::new(200.0, 0.0)).is_empty());
    }

    #[tokio::test]
    async fn unplaced_interfaces_are_skipped() {
        let (model, _) = model();
        model.set_position(&iface(1), Position::new(0.0, 0.0));

        let events = model.set_position(&iface(2), Position { x: Some(1.0), y: None, z: None });
        assert!(events.is_empty());
        assert!(model.calc_link(&iface(1), &iface(2)).is_none());
        assert_eq!(model.network().interfaces().len(), 2);
    }

    #[tokio::test]
    async fn bulk_update_reports_each_pair_once() {
        let (model, _) = model();
        model.set_position(&iface(1), Position::new(0.0, 0.0));
        model.set_position(&iface(2), Position::new(500.0, 0.0));
        model.set_position(&iface(3), Position::new(1000.0, 0.0));

        // 1 and 2 move next to 3
        let events = model.bulk_update(&[
            (iface(1), Position::new(950.0, 0.0)),
            (iface(2), Position::new(1050.0, 0.0)),
        ]);

        let mut pairs: Vec<_> = events.iter().map(|e| (e.a.node, e.b.node)).collect();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(1, 2), (1, 3), (2, 3)]);
        assert!(events.iter().all(|e| e.kind == LinkEventKind::Link));
        assert_eq!(model.all_links().len(), 3);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let (model, _) = model();
        let mut events = model.subscribe();

        model.set_position(&iface(1), Position::new(0.0, 0.0));
        model.set_position(&iface(2), Position::new(10.0, 0.0));

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, LinkEventKind::Link);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn config_update_shapes_every_interface() {
        let (model, recorder) = model();
        model.set_position(&iface(1), Position::new(0.0, 0.0));
        model.set_position(&iface(2), Position::new(10.0, 0.0));

        let config = RangeConfig::from_values("200|1000000|0|2000|5|1").unwrap();
        model.update_config(config).unwrap();
        assert_eq!(model.config().range, 200.0);

        assert_eq!(
            recorder.commands(),
            vec![
                "tc qdisc replace dev veth1.0 root netem delay 2000us loss 5% rate 1000000bit",
                "tc qdisc replace dev veth2.0 root netem delay 2000us loss 5% rate 1000000bit",
                "ip link set dev b.10 type bridge ageing_time 0",
            ]
        );
    }

    #[tokio::test]
    async fn random_walk_keeps_links_consistent() {
        use rand::Rng;

        let (model, _) = model();
        let mut rng = rand::thread_rng();
        let ifaces: Vec<_> = (1..=8).map(iface).collect();

        for _ in 0..200 {
            let moved = &ifaces[rng.gen_range(0..ifaces.len())];
            let position = Position::new(rng.gen_range(0.0..400.0), rng.gen_range(0.0..400.0));
            model.set_position(moved, position);

            // same position again: no change
            assert!(model.set_position(moved, position).is_empty());
        }

        for a in &ifaces {
            for b in ifaces.iter().filter(|b| a < *b) {
                let (Some(pa), Some(pb)) = (model.position(a), model.position(b)) else {
                    continue;
                };
                let in_range = pa.distance(&pb).unwrap() <= 100.0;
                assert_eq!(model.network().linked(a, b), in_range, "{a} - {b}");
            }
        }
    }

    #[tokio::test]
    async fn removed_interface_is_forgotten() {
        let (model, _) = model();
        model.set_position(&iface(1), Position::new(0.0, 0.0));
        model.set_position(&iface(2), Position::new(10.0, 0.0));

        model.remove_interface(&iface(2));
        assert!(model.position(&iface(2)).is_none());
        assert!(model.all_links().is_empty());
    }
}
