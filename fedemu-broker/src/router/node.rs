use fedemu_wire::{tlv::node, Message, NodeType};

use super::{Handled, MessageRouter};
use crate::{
    node::{classify, NodeClass, Unresolved},
    persist::{self, NodeDescriptor},
};

impl MessageRouter {
    /// Network nodes are replicated on every server. Other nodes go to the server named
    /// by their emulation server attribute, if any.
    pub(super) fn handle_node_message(&self, msg: &Message) -> Handled {
        let mut handled = Handled::default();
        let Some(id) = msg.tlv_u32(node::NUMBER) else {
            tracing::debug!("node message without node number");
            return handled;
        };

        let mut descriptor = None;
        if let Some(code) = msg.tlv_u32(node::TYPE) {
            match classify(code) {
                Err(Unresolved::Unknown(code)) => {
                    tracing::warn!(node = id, code, "invalid node type");
                    return handled;
                }
                Err(Unresolved::Unimplemented(node_type)) => {
                    tracing::warn!(node = id, ?node_type, "unimplemented node type");
                    return handled;
                }
                // WLANs are not replicated: their ebtables rules only work on one host
                Ok(NodeClass::Network) if code != NodeType::WirelessLan as u32 => {
                    let targets = self.all_servers();
                    self.state.sets.add_network(id);
                    for server in &targets {
                        self.state.placements.add(id, server);
                    }

                    tracing::debug!(node = id, servers = targets.len(), "replicating network node");
                    return Handled { handle_locally: true, targets, rewritten: None };
                }
                Ok(NodeClass::Network) => {}
                Ok(class) => {
                    if let (Some(name), Ok(node_type)) = (msg.tlv_str(node::NAME), NodeType::try_from(code)) {
                        descriptor = Some(NodeDescriptor { id, name: name.to_owned(), node_type });
                    }
                    if class == NodeClass::Physical {
                        self.state.sets.add_physical(id);
                    }
                }
            }
        }

        if let Some(name) = msg.tlv_str(node::EMULATION_SERVER) {
            match self.servers.get_by_name(name) {
                Some(server) => {
                    self.state.placements.add(id, &server.name);
                    handled.targets.insert(server.name.clone());

                    let master = self.identity.read().master;
                    if let (true, Some(dir), Some(descriptor)) = (master, &self.session_dir, &descriptor) {
                        if let Err(e) = persist::write_node_server(dir, descriptor, &server) {
                            tracing::warn!(?e, node = id, "error writing node server file");
                        }
                    }
                }
                None => tracing::warn!(node = id, server = name, "unknown emulation server"),
            }
        }

        if self.state.sets.is_physical(id) {
            self.state.hooks.update_physical(id, msg);
        }

        handled
    }
}
