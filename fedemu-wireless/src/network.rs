use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use fedemu_net::ebtables::{RuleCommand, Verdict};
use fedemu_wire::NodeId;
use parking_lot::Mutex;

use crate::scheduler::LinkRuleScheduler;

/// An interface attached to a wireless network: the node it belongs to and the name of
/// its host side device, which is what the forwarding rules match on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId {
    pub node: NodeId,
    pub name: String,
}

impl InterfaceId {
    pub fn new(node: NodeId, name: impl Into<String>) -> Self {
        Self { node, name: name.into() }
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.node)
    }
}

/// Orders a pair so that `a < b`.
fn canonical(a: &InterfaceId, b: &InterfaceId) -> (InterfaceId, InterfaceId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Debug, Default)]
struct Links {
    interfaces: BTreeSet<InterfaceId>,
    linked: BTreeMap<(InterfaceId, InterfaceId), bool>,
}

/// A bridged wireless network whose connectivity is expressed as pairwise forwarding
/// rules.
///
/// With a [`Verdict::Drop`] policy nothing is connected until linked, with
/// [`Verdict::Accept`] everything is connected until unlinked. Every change marks the
/// network dirty with the shared [`LinkRuleScheduler`], which rebuilds the rules later.
#[derive(Debug)]
pub struct WirelessNetwork {
    id: NodeId,
    bridge: String,
    policy: Verdict,
    links: Mutex<Links>,
    scheduler: LinkRuleScheduler,
}

impl WirelessNetwork {
    /// Creates the network and registers it with `scheduler`, which keeps its rule
    /// loop running for as long as a network exists. Must be called within a tokio
    /// runtime.
    pub fn new(id: NodeId, bridge: impl Into<String>, policy: Verdict, scheduler: LinkRuleScheduler) -> Arc<Self> {
        let network =
            Arc::new(Self { id, bridge: bridge.into(), policy, links: Mutex::default(), scheduler });
        network.scheduler.attach(&network);
        network
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Name of the bridge, also the name of the rule chain.
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub fn policy(&self) -> Verdict {
        self.policy
    }

    pub fn add_interface(&self, iface: InterfaceId) {
        self.links.lock().interfaces.insert(iface);
    }

    /// Forgets `iface` and every pair it is part of.
    pub fn remove_interface(&self, iface: &InterfaceId) {
        let mut links = self.links.lock();
        links.interfaces.remove(iface);
        links.linked.retain(|(a, b), _| a != iface && b != iface);
        drop(links);

        self.scheduler.mark_dirty(self.id);
    }

    pub fn interfaces(&self) -> Vec<InterfaceId> {
        self.links.lock().interfaces.iter().cloned().collect()
    }

    /// Whether `a` and `b` can reach each other. A pair never seen before takes the
    /// policy's default, which is remembered.
    pub fn linked(&self, a: &InterfaceId, b: &InterfaceId) -> bool {
        let default = self.policy == Verdict::Accept;
        *self.links.lock().linked.entry(canonical(a, b)).or_insert(default)
    }

    pub fn link(&self, a: &InterfaceId, b: &InterfaceId) {
        self.set_linked(a, b, true);
    }

    pub fn unlink(&self, a: &InterfaceId, b: &InterfaceId) {
        self.set_linked(a, b, false);
    }

    fn set_linked(&self, a: &InterfaceId, b: &InterfaceId, linked: bool) {
        self.links.lock().linked.insert(canonical(a, b), linked);
        tracing::trace!(network = self.id, %a, %b, linked, "link state changed");
        self.scheduler.mark_dirty(self.id);
    }

    /// Every pair currently linked, `a < b`.
    pub fn linked_pairs(&self) -> Vec<(InterfaceId, InterfaceId)> {
        let links = self.links.lock();
        links.linked.iter().filter(|(_, linked)| **linked).map(|(pair, _)| pair.clone()).collect()
    }

    /// The commands rebuilding this network's chain from scratch: a flush, then a rule
    /// pair for every pair that deviates from the policy.
    pub fn rule_commands(&self) -> Vec<RuleCommand> {
        let links = self.links.lock();
        let mut commands = vec![RuleCommand::flush(&self.bridge)];

        for ((a, b), linked) in &links.linked {
            let verdict = match (self.policy, *linked) {
                (Verdict::Drop, true) => Verdict::Accept,
                (Verdict::Accept, false) => Verdict::Drop,
                _ => continue,
            };
            commands.extend(RuleCommand::append_pair(&self.bridge, &a.name, &b.name, verdict));
        }

        commands
    }
}

impl Drop for WirelessNetwork {
    fn drop(&mut self) {
        self.scheduler.detach(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::dry_run;

    fn iface(node: NodeId) -> InterfaceId {
        InterfaceId::new(node, format!("veth{node}.0"))
    }

    #[tokio::test]
    async fn unknown_pairs_follow_the_policy() {
        let (scheduler, _) = dry_run();

        let closed = WirelessNetwork::new(1, "b.1", Verdict::Drop, scheduler.clone());
        assert!(!closed.linked(&iface(1), &iface(2)));

        let accept = WirelessNetwork::new(2, "b.2", Verdict::Accept, scheduler);
        assert!(accept.linked(&iface(1), &iface(2)));
        assert_eq!(accept.linked_pairs(), vec![(iface(1), iface(2))]);
    }

    #[tokio::test]
    async fn pairs_are_unordered() {
        let (scheduler, _) = dry_run();
        let network = WirelessNetwork::new(1, "b.1", Verdict::Drop, scheduler);

        network.link(&iface(3), &iface(2));
        assert!(network.linked(&iface(2), &iface(3)));
        assert_eq!(network.linked_pairs(), vec![(iface(2), iface(3))]);

        network.unlink(&iface(2), &iface(3));
        assert!(!network.linked(&iface(3), &iface(2)));
    }

    #[tokio::test]
    async fn rules_only_cover_exceptions_to_the_policy() {
        let (scheduler, _) = dry_run();

        let network = WirelessNetwork::new(1, "b.1", Verdict::Drop, scheduler.clone());
        network.link(&iface(1), &iface(2));
        network.unlink(&iface(1), &iface(3));

        let rules: Vec<String> = network.rule_commands().iter().map(ToString::to_string).collect();
        assert_eq!(
            rules,
            vec![
                "-F b.1",
                "-A b.1 -i veth1.0 -o veth2.0 -j ACCEPT",
                "-A b.1 -i veth2.0 -o veth1.0 -j ACCEPT",
            ]
        );

        let open = WirelessNetwork::new(2, "b.2", Verdict::Accept, scheduler);
        open.unlink(&iface(1), &iface(2));
        let rules: Vec<String> = open.rule_commands().iter().map(ToString::to_string).collect();
        assert_eq!(
            rules,
            vec!["-F b.2", "-A b.2 -i veth1.0 -o veth2.0 -j DROP", "-A b.2 -i veth2.0 -o veth1.0 -j DROP"]
        );
    }

    #[tokio::test]
    async fn removed_interface_leaves_no_pair() {
        let (scheduler, _) = dry_run();
        let network = WirelessNetwork::new(1, "b.1", Verdict::Drop, scheduler);
        network.add_interface(iface(1));
        network.add_interface(iface(2));
        network.link(&iface(1), &iface(2));

        network.remove_interface(&iface(2));
        assert_eq!(network.interfaces(), vec![iface(1)]);
        assert!(network.linked_pairs().is_empty());
    }
}
