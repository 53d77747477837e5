#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Framing of the emulation control protocol.
//!
//! Every message starts with a 4 byte header (type, flags, big-endian payload length)
//! followed by a list of type-length-value attributes. The broker only needs a handful of
//! accessors on top of that; the semantic of each attribute belongs to the modules that
//! consume it.

pub mod codec;
pub mod message;
pub mod tlv;
pub mod types;

pub use codec::Codec;
pub use message::{Header, Message, MessageBuilder};
pub use types::{EventType, MessageFlags, MessageType, NodeType};

use thiserror::Error;

/// Identifier of a logical node in an emulation session.
pub type NodeId = u32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("payload too large: {0} bytes")]
    TooLarge(usize),
    #[error("truncated attribute {kind:#04x}: need {need} bytes, have {have}")]
    Truncated { kind: u8, need: usize, have: usize },
}
