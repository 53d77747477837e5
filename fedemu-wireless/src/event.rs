use fedemu_wire::{tlv::link, Message, MessageBuilder, MessageFlags, MessageType, NodeId};

use crate::network::InterfaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventKind {
    Link,
    Unlink,
}

/// A change of connectivity between two interfaces of a wireless network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub kind: LinkEventKind,
    pub network: NodeId,
    pub a: InterfaceId,
    pub b: InterfaceId,
}

impl LinkEvent {
    /// The wireless LINK message announcing this change: ADD for a link, DELETE for an
    /// unlink.
    pub fn to_message(&self) -> Result<Message, fedemu_wire::Error> {
        let flags = match self.kind {
            LinkEventKind::Link => MessageFlags::ADD,
            LinkEventKind::Unlink => MessageFlags::DELETE,
        };

        MessageBuilder::new(MessageType::Link)
            .flags(flags)
            .u32(link::N1_NUMBER, self.a.node)
            .u32(link::N2_NUMBER, self.b.node)
            .u32(link::NETWORK_ID, self.network)
            .u32(link::TYPE, link::TYPE_WIRELESS)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlink_is_a_wireless_link_delete() {
        let event = LinkEvent {
            kind: LinkEventKind::Unlink,
            network: 10,
            a: InterfaceId::new(1, "veth1.0"),
            b: InterfaceId::new(2, "veth2.0"),
        };

        let msg = event.to_message().unwrap();
        assert_eq!(msg.message_type(), Some(MessageType::Link));
        assert!(msg.has_flag(MessageFlags::DELETE));
        assert_eq!(msg.node_numbers(), vec![1, 2]);
        assert_eq!(msg.tlv_u32(link::NETWORK_ID), Some(10));
        assert_eq!(msg.tlv_u32(link::TYPE), Some(link::TYPE_WIRELESS));
    }
}
