//! Type-length-value attributes.
//!
//! Short values (< 256 bytes) use a 2 byte attribute header `(kind, len)`; longer values
//! set `len` to 0 and follow it with a big-endian u16 length. Every attribute is
//! zero-padded so that the next one starts on a 4 byte boundary.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Error;

/// A single attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: u8,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(kind: u8, value: impl Into<Bytes>) -> Self {
        Self { kind, value: value.into() }
    }

    pub fn u32(kind: u8, value: u32) -> Self {
        Self::new(kind, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn u64(kind: u8, value: u64) -> Self {
        Self::new(kind, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn string(kind: u8, value: &str) -> Self {
        Self::new(kind, Bytes::copy_from_slice(value.as_bytes()))
    }

    /// Interprets the value as a big-endian unsigned integer of 1, 2, 4 or 8 bytes.
    pub fn as_u64(&self) -> Option<u64> {
        let v = &self.value[..];
        match v.len() {
            1 => Some(v[0] as u64),
            2 => Some(u16::from_be_bytes([v[0], v[1]]) as u64),
            4 => Some(u32::from_be_bytes([v[0], v[1], v[2], v[3]]) as u64),
            8 => Some(u64::from_be_bytes(v.try_into().ok()?)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Size of the encoded attribute, padding included.
    pub fn encoded_len(&self) -> usize {
        let raw = header_len(self.value.len()) + self.value.len();
        raw + padding(raw)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.value.len();
        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind);
        if len < 256 {
            dst.put_u8(len as u8);
        } else {
            dst.put_u8(0);
            dst.put_u16(len as u16);
        }
        dst.put_slice(&self.value);
        dst.put_bytes(0, padding(header_len(len) + len));
    }
}

#[inline]
const fn header_len(value_len: usize) -> usize {
    if value_len < 256 {
        2
    } else {
        4
    }
}

#[inline]
const fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Decodes every attribute in `src`. Trailing bytes too short to hold an attribute header
/// are ignored.
pub fn decode_all(mut src: Bytes) -> Result<Vec<Tlv>, Error> {
    let mut tlvs = Vec::new();

    while src.remaining() >= 2 {
        let kind = src.get_u8();
        let mut len = src.get_u8() as usize;
        let mut hdr = 2;

        if len == 0 && src.remaining() >= 2 {
            // A zero short length is either an empty value or the long form marker.
            let long = u16::from_be_bytes([src[0], src[1]]) as usize;
            if long >= 256 {
                src.advance(2);
                len = long;
                hdr = 4;
            }
        }

        if src.remaining() < len {
            return Err(Error::Truncated { kind, need: len, have: src.remaining() });
        }

        let value = src.split_to(len);
        let pad = padding(hdr + len).min(src.remaining());
        src.advance(pad);

        tlvs.push(Tlv { kind, value });
    }

    Ok(tlvs)
}

/// Node message attributes.
pub mod node {
    pub const NUMBER: u8 = 0x01;
    pub const TYPE: u8 = 0x02;
    pub const NAME: u8 = 0x03;
    pub const IP_ADDRESS: u8 = 0x04;
    pub const MAC_ADDRESS: u8 = 0x05;
    pub const MODEL: u8 = 0x07;
    pub const EMULATION_SERVER: u8 = 0x08;
    pub const SESSION: u8 = 0x0A;
    pub const X_POSITION: u8 = 0x20;
    pub const Y_POSITION: u8 = 0x21;
    pub const CANVAS: u8 = 0x22;
    pub const EMULATION_ID: u8 = 0x23;
    pub const NETWORK_ID: u8 = 0x24;
    pub const SERVICES: u8 = 0x25;
    pub const LATITUDE: u8 = 0x30;
    pub const LONGITUDE: u8 = 0x31;
    pub const ALTITUDE: u8 = 0x32;
    pub const ICON: u8 = 0x42;
    pub const OPAQUE: u8 = 0x50;
}

/// Link message attributes.
pub mod link {
    pub const N1_NUMBER: u8 = 0x01;
    pub const N2_NUMBER: u8 = 0x02;
    pub const DELAY: u8 = 0x03;
    pub const BANDWIDTH: u8 = 0x04;
    pub const PER: u8 = 0x05;
    pub const DUP: u8 = 0x06;
    pub const JITTER: u8 = 0x07;
    pub const SESSION: u8 = 0x0A;
    pub const TYPE: u8 = 0x20;
    pub const EMULATION_ID: u8 = 0x23;
    pub const NETWORK_ID: u8 = 0x24;
    pub const KEY: u8 = 0x25;
    pub const INTERFACE1_NUMBER: u8 = 0x30;
    pub const INTERFACE2_NUMBER: u8 = 0x36;
    pub const OPAQUE: u8 = 0x50;

    /// Link type attribute value of a wireless link.
    pub const TYPE_WIRELESS: u32 = 0;
    /// Link type attribute value of a wired link.
    pub const TYPE_WIRED: u32 = 1;
}

/// Execute message attributes.
pub mod exec {
    pub const NODE: u8 = 0x01;
    pub const NUMBER: u8 = 0x02;
    pub const TIME: u8 = 0x03;
    pub const COMMAND: u8 = 0x04;
    pub const RESULT: u8 = 0x05;
    pub const STATUS: u8 = 0x06;
    pub const SESSION: u8 = 0x0A;
}

/// Configuration message attributes.
pub mod config {
    pub const NODE: u8 = 0x01;
    pub const OBJECT: u8 = 0x02;
    pub const TYPE: u8 = 0x03;
    pub const DATA_TYPES: u8 = 0x04;
    pub const VALUES: u8 = 0x05;
    pub const SESSION: u8 = 0x0A;
    pub const INTERFACE_NUMBER: u8 = 0x0B;
    pub const NETWORK_ID: u8 = 0x24;
    pub const OPAQUE: u8 = 0x50;
}

/// File message attributes.
pub mod file {
    pub const NODE: u8 = 0x01;
    pub const NAME: u8 = 0x02;
    pub const MODE: u8 = 0x03;
    pub const NUMBER: u8 = 0x04;
    pub const TYPE: u8 = 0x05;
    pub const SOURCE_NAME: u8 = 0x06;
    pub const SESSION: u8 = 0x0A;
    pub const DATA: u8 = 0x10;
    pub const COMPRESSED_DATA: u8 = 0x11;
}

/// Interface message attributes.
pub mod iface {
    pub const NODE: u8 = 0x01;
    pub const NUMBER: u8 = 0x02;
    pub const NAME: u8 = 0x03;
}

/// Event message attributes.
pub mod event {
    pub const NODE: u8 = 0x01;
    pub const TYPE: u8 = 0x02;
    pub const NAME: u8 = 0x03;
    pub const DATA: u8 = 0x04;
    pub const TIME: u8 = 0x05;
    pub const SESSION: u8 = 0x0A;
}
