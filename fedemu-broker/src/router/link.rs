use std::{
    collections::BTreeSet,
    net::{IpAddr, ToSocketAddrs},
};

use fedemu_wire::{
    tlv::{link, Tlv},
    Message, MessageFlags, NodeId,
};

use super::{Handled, MessageRouter};
use crate::tunnel::{tunnel_key, Attachment, TunnelRequest};

/// One end of a link message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    N1,
    N2,
}

/// Which end of a link between nodes on different placements lives on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalEnd {
    /// One of the servers hosting this end is this host.
    Resolved(Side),
    /// No server of the link is this host, but this end is not placed on any server;
    /// it is taken to be local.
    InferredFromUnplaced(Side),
    /// Neither end is on this host.
    Unknown,
}

impl LocalEnd {
    pub(crate) const fn side(self) -> Option<Side> {
        match self {
            Self::Resolved(side) | Self::InferredFromUnplaced(side) => Some(side),
            Self::Unknown => None,
        }
    }
}

/// Finds the local end of a link between nodes placed on `servers1` and `servers2`.
/// `is_local` tells whether a server name stands for this host.
pub(crate) fn local_end(
    servers1: &BTreeSet<String>,
    servers2: &BTreeSet<String>,
    is_local: impl Fn(&str) -> bool,
) -> LocalEnd {
    let resolved = servers1.union(servers2).filter(|name| is_local(name.as_str())).last().map(|name| {
        if servers1.contains(name) {
            Side::N1
        } else {
            Side::N2
        }
    });
    if let Some(side) = resolved {
        return LocalEnd::Resolved(side);
    }

    // Both sets empty means both are equal, which never reaches this point.
    if servers1.is_empty() {
        LocalEnd::InferredFromUnplaced(Side::N1)
    } else if servers2.is_empty() {
        LocalEnd::InferredFromUnplaced(Side::N2)
    } else {
        LocalEnd::Unknown
    }
}

/// Splits a link endpoint attribute `"<n1 host>:<n2 host>"` and returns the host of the
/// end that is not `local`.
fn opaque_endpoint(opaque: &str, local: Side) -> Option<&str> {
    let (host1, host2) = opaque.split_once(':')?;
    let host = match local {
        Side::N1 => host2,
        Side::N2 => host1,
    };
    (!host.is_empty()).then_some(host)
}

/// Resolves a host name or address.
pub(crate) fn resolve_host(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Some(ip);
    }

    match (host, 0).to_socket_addrs() {
        Ok(mut addrs) => addrs.next().map(|a| a.ip()),
        Err(e) => {
            tracing::warn!(?e, host, "error resolving host");
            None
        }
    }
}

impl MessageRouter {
    /// Links are decided on the placement of their two nodes. Links between nodes on
    /// different placements get a tunnel when one end lives here.
    pub(super) fn handle_link_message(&self, msg: &Message) -> Handled {
        let mut handled = Handled::default();
        let (Some(n1), Some(n2)) = (msg.tlv_u32(link::N1_NUMBER), msg.tlv_u32(link::N2_NUMBER)) else {
            tracing::debug!("link message without node numbers");
            return handled;
        };

        let sets = &self.state.sets;
        match (sets.is_network(n1), sets.is_network(n2)) {
            // two networks linked together: no tunnel, or tunnels would loop
            (true, true) => handled.handle_locally = true,
            (true, false) => handled.targets = self.state.placements.servers(n2),
            (false, true) => handled.targets = self.state.placements.servers(n1),
            (false, false) => {
                let servers1 = self.state.placements.servers(n1);
                let servers2 = self.state.placements.servers(n2);
                if servers1 == servers2 {
                    handled.targets = servers1;
                    return handled;
                }

                handled.targets = servers1.union(&servers2).cloned().collect();

                let end = local_end(&servers1, &servers2, |name| {
                    self.servers.get_by_name(name).is_some_and(|s| s.is_local())
                });
                handled.handle_locally =
                    servers1.is_empty() || servers2.is_empty() || matches!(end, LocalEnd::Resolved(_));

                let Some(local) = end.side() else {
                    tracing::debug!(n1, n2, "no local end, embedding link endpoints");
                    handled.rewritten = self.add_link_endpoints(msg, &servers1, &servers2);
                    return handled;
                };
                if let LocalEnd::InferredFromUnplaced(_) = end {
                    tracing::debug!(n1, n2, ?local, "local end inferred from unplaced node");
                }

                if msg.has_flag(MessageFlags::ADD) {
                    let remote = self.remote_endpoint(msg, &handled.targets, local);
                    self.add_link_tunnel(n1, n2, local, remote);
                } else if msg.has_flag(MessageFlags::DELETE) {
                    self.remove_link_tunnel(n1, n2);
                    // remote servers tear down their end too
                    handled.handle_locally = false;
                }
            }
        }

        handled
    }

    /// Address of the remote end of a tunnel: the first remote server of the link, the
    /// endpoints embedded in the message, or the session master.
    fn remote_endpoint(&self, msg: &Message, targets: &BTreeSet<String>, local: Side) -> Option<IpAddr> {
        let host = targets.iter().filter_map(|name| self.servers.get_by_name(name)).find_map(|s| s.host);
        if let Some(ip) = host.as_deref().and_then(resolve_host) {
            return Some(ip);
        }

        if let Some(host) = msg.tlv_str(link::OPAQUE).and_then(|o| opaque_endpoint(o, local)) {
            if let Some(ip) = resolve_host(host) {
                return Some(ip);
            }
        }

        self.identity.read().master_address
    }

    fn add_link_tunnel(&self, n1: NodeId, n2: NodeId, local: Side, remote: Option<IpAddr>) {
        let (local_num, remote_num) = match local {
            Side::N1 => (n1, n2),
            Side::N2 => (n2, n1),
        };
        let Some(remote) = remote else {
            tracing::warn!(n1, n2, "no remote endpoint for tunnel");
            return;
        };

        let key = tunnel_key(self.identity.read().session_id, &n1.into(), &n2.into());
        let attach = if self.state.sets.is_physical(local_num) {
            Attachment::Node(local_num)
        } else {
            Attachment::Bridge
        };

        let request = TunnelRequest { key, remote, attach };
        if let Err(e) = self.tunnels.add(request, local_num.into(), remote_num.into()) {
            tracing::error!(?e, key, n1, n2, "error adding tunnel");
        }
    }

    fn remove_link_tunnel(&self, n1: NodeId, n2: NodeId) {
        let key = tunnel_key(self.identity.read().session_id, &n1.into(), &n2.into());
        if let Err(e) = self.tunnels.remove(key) {
            tracing::error!(?e, key, n1, n2, "error removing tunnel");
        }
    }

    /// Embeds the hosts of both ends as `"<n1 host>:<n2 host>"`, so whichever server ends
    /// up handling the link can build its own tunnel.
    fn add_link_endpoints(
        &self,
        msg: &Message,
        servers1: &BTreeSet<String>,
        servers2: &BTreeSet<String>,
    ) -> Option<Message> {
        let first_host = |servers: &BTreeSet<String>| {
            servers
                .iter()
                .filter_map(|name| self.servers.get_by_name(name))
                .find_map(|s| s.host)
                .unwrap_or_default()
        };

        let endpoints = format!("{}:{}", first_host(servers1), first_host(servers2));
        match msg.with_tlv(Tlv::string(link::OPAQUE, &endpoints)) {
            Ok(rewritten) => Some(rewritten),
            Err(e) => {
                tracing::warn!(?e, "error embedding link endpoints");
                None
            }
        }
    }
}
