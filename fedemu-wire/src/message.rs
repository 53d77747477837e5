use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    tlv::{self, Tlv},
    Error, MessageFlags, MessageType, NodeId,
};

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// The raw message type. Unknown types are preserved so they can still be relayed.
    pub(crate) kind: u8,
    pub(crate) flags: MessageFlags,
    /// Length of the attribute payload. Max 64KiB.
    pub(crate) size: u16,
}

impl Header {
    /// Returns the length of the header in bytes.
    #[inline]
    pub const fn len() -> usize {
        4
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        self.size as usize
    }

    pub fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < Self::len() {
            return None;
        }

        Some(Self {
            kind: src[0],
            flags: MessageFlags::from_bits(src[1]),
            size: u16::from_be_bytes([src[2], src[3]]),
        })
    }
}

/// A decoded control message.
///
/// The raw encoding is kept alongside the decoded attributes so a message can be relayed
/// byte-for-byte without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    tlvs: Vec<Tlv>,
    raw: Bytes,
}

impl Message {
    /// Decodes a message from a header and its attribute payload.
    pub fn decode(header: Header, payload: Bytes) -> Result<Self, Error> {
        let mut raw = BytesMut::with_capacity(Header::len() + payload.len());
        raw.put_u8(header.kind);
        raw.put_u8(header.flags.bits());
        raw.put_u16(header.size);
        raw.put_slice(&payload);

        let tlvs = tlv::decode_all(payload)?;
        Ok(Self { header, tlvs, raw: raw.freeze() })
    }

    /// Encodes a message from its parts.
    pub fn from_parts(kind: u8, flags: MessageFlags, tlvs: Vec<Tlv>) -> Result<Self, Error> {
        let size: usize = tlvs.iter().map(Tlv::encoded_len).sum();
        let size16 = u16::try_from(size).map_err(|_| Error::TooLarge(size))?;

        let mut raw = BytesMut::with_capacity(Header::len() + size);
        raw.put_u8(kind);
        raw.put_u8(flags.bits());
        raw.put_u16(size16);
        for tlv in &tlvs {
            tlv.encode(&mut raw);
        }

        Ok(Self { header: Header { kind, flags, size: size16 }, tlvs, raw: raw.freeze() })
    }

    #[inline]
    pub fn header(&self) -> Header {
        self.header
    }

    /// The message type, or `None` if the type code is unknown.
    #[inline]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.header.kind).ok()
    }

    #[inline]
    pub fn raw_type(&self) -> u8 {
        self.header.kind
    }

    #[inline]
    pub fn flags(&self) -> MessageFlags {
        self.header.flags
    }

    #[inline]
    pub fn has_flag(&self, flag: MessageFlags) -> bool {
        self.header.flags.contains(flag)
    }

    /// The encoded message, header included.
    #[inline]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    #[inline]
    pub fn tlvs(&self) -> &[Tlv] {
        &self.tlvs
    }

    /// Returns the first attribute of the given kind.
    pub fn tlv(&self, kind: u8) -> Option<&Tlv> {
        self.tlvs.iter().find(|t| t.kind == kind)
    }

    pub fn tlv_u32(&self, kind: u8) -> Option<u32> {
        self.tlv(kind).and_then(Tlv::as_u64).and_then(|v| u32::try_from(v).ok())
    }

    pub fn tlv_u64(&self, kind: u8) -> Option<u64> {
        self.tlv(kind).and_then(Tlv::as_u64)
    }

    pub fn tlv_str(&self, kind: u8) -> Option<&str> {
        self.tlv(kind).and_then(Tlv::as_str)
    }

    /// Node numbers referenced by this message, in attribute order.
    pub fn node_numbers(&self) -> Vec<NodeId> {
        let keys: &[u8] = match self.message_type() {
            Some(MessageType::Node) => &[tlv::node::NUMBER],
            Some(MessageType::Link) => &[tlv::link::N1_NUMBER, tlv::link::N2_NUMBER],
            Some(MessageType::Execute) => &[tlv::exec::NODE],
            Some(MessageType::Config) => &[tlv::config::NODE],
            Some(MessageType::File) => &[tlv::file::NODE],
            Some(MessageType::Interface) => &[tlv::iface::NODE],
            Some(MessageType::Event) => &[tlv::event::NODE],
            _ => &[],
        };

        keys.iter().filter_map(|k| self.tlv_u32(*k)).collect()
    }

    /// Returns a copy of this message with the attribute of kind `tlv.kind` replaced, or
    /// appended if the message does not carry one yet.
    pub fn with_tlv(&self, tlv: Tlv) -> Result<Self, Error> {
        let mut tlvs = self.tlvs.clone();
        match tlvs.iter_mut().find(|t| t.kind == tlv.kind) {
            Some(existing) => *existing = tlv,
            None => tlvs.push(tlv),
        }

        Self::from_parts(self.header.kind, self.header.flags, tlvs)
    }
}

/// Builder for outgoing messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    kind: u8,
    flags: MessageFlags,
    tlvs: Vec<Tlv>,
}

impl MessageBuilder {
    pub fn new(kind: MessageType) -> Self {
        Self { kind: kind as u8, flags: MessageFlags::NONE, tlvs: Vec::new() }
    }

    pub fn flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn tlv(mut self, tlv: Tlv) -> Self {
        self.tlvs.push(tlv);
        self
    }

    pub fn u32(self, kind: u8, value: u32) -> Self {
        self.tlv(Tlv::u32(kind, value))
    }

    pub fn u64(self, kind: u8, value: u64) -> Self {
        self.tlv(Tlv::u64(kind, value))
    }

    pub fn string(self, kind: u8, value: &str) -> Self {
        self.tlv(Tlv::string(kind, value))
    }

    pub fn build(self) -> Result<Message, Error> {
        Message::from_parts(self.kind, self.flags, self.tlvs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::{link, node};

    #[test]
    fn node_numbers_follow_message_type() {
        let msg = MessageBuilder::new(MessageType::Link)
            .u32(link::N1_NUMBER, 3)
            .u32(link::N2_NUMBER, 9)
            .build()
            .unwrap();
        assert_eq!(msg.node_numbers(), vec![3, 9]);

        let msg = MessageBuilder::new(MessageType::Node).string(node::NAME, "n1").build().unwrap();
        assert!(msg.node_numbers().is_empty());

        let msg = MessageBuilder::new(MessageType::Session).build().unwrap();
        assert!(msg.node_numbers().is_empty());
    }

    #[test]
    fn raw_matches_header_and_attributes() {
        let msg = MessageBuilder::new(MessageType::Node)
            .flags(MessageFlags::ADD)
            .u32(node::NUMBER, 1)
            .string(node::NAME, "n1")
            .build()
            .unwrap();

        let raw = msg.raw();
        assert_eq!(raw[0], MessageType::Node as u8);
        assert_eq!(raw[1], MessageFlags::ADD.bits());
        assert_eq!(u16::from_be_bytes([raw[2], raw[3]]) as usize, raw.len() - Header::len());

        let header = Header::decode(raw).unwrap();
        let decoded = Message::decode(header, raw.slice(Header::len()..)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn with_tlv_replaces_or_appends() {
        let msg = MessageBuilder::new(MessageType::Link)
            .u32(link::N1_NUMBER, 1)
            .u32(link::N2_NUMBER, 2)
            .build()
            .unwrap();

        let appended = msg.with_tlv(Tlv::string(link::OPAQUE, "10.0.0.1:")).unwrap();
        assert_eq!(appended.tlv_str(link::OPAQUE), Some("10.0.0.1:"));
        assert_eq!(appended.node_numbers(), vec![1, 2]);

        let replaced = appended.with_tlv(Tlv::string(link::OPAQUE, ":10.0.0.2")).unwrap();
        assert_eq!(replaced.tlvs().len(), 3);
        assert_eq!(replaced.tlv_str(link::OPAQUE), Some(":10.0.0.2"));
        assert!(replaced.raw().len() > msg.raw().len());
    }
}
