use std::{fmt, ops::BitOr};

/// The type of a control message, carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Node = 0x01,
    Link = 0x02,
    Execute = 0x03,
    Register = 0x04,
    Config = 0x05,
    File = 0x06,
    Interface = 0x07,
    Event = 0x08,
    Session = 0x09,
    Exception = 0x0A,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Node,
            0x02 => Self::Link,
            0x03 => Self::Execute,
            0x04 => Self::Register,
            0x05 => Self::Config,
            0x06 => Self::File,
            0x07 => Self::Interface,
            0x08 => Self::Event,
            0x09 => Self::Session,
            0x0A => Self::Exception,
            other => return Err(other),
        })
    }
}

/// Message flags, carried in the second header byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: Self = Self(0x00);
    pub const ADD: Self = Self(0x01);
    pub const DELETE: Self = Self(0x02);
    pub const CRI: Self = Self(0x04);
    pub const LOCAL: Self = Self(0x08);
    pub const STRING: Self = Self(0x10);
    pub const TEXT: Self = Self(0x20);
    pub const TTY: Self = Self(0x40);

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MessageFlags, &str); 7] = [
            (MessageFlags::ADD, "ADD"),
            (MessageFlags::DELETE, "DELETE"),
            (MessageFlags::CRI, "CRI"),
            (MessageFlags::LOCAL, "LOCAL"),
            (MessageFlags::STRING, "STRING"),
            (MessageFlags::TEXT, "TEXT"),
            (MessageFlags::TTY, "TTY"),
        ];

        let set: Vec<_> =
            NAMES.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, n)| *n).collect();
        if set.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// Node type codes carried by the node type attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NodeType {
    Default = 0,
    Physical = 1,
    Xen = 2,
    Tbd = 3,
    Switch = 4,
    Hub = 5,
    WirelessLan = 6,
    Rj45 = 7,
    Tunnel = 8,
    Ktunnel = 9,
    Emane = 10,
    TapBridge = 11,
    PeerToPeer = 12,
    ControlNet = 13,
    EmaneNet = 14,
}

impl TryFrom<u32> for NodeType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Default,
            1 => Self::Physical,
            2 => Self::Xen,
            3 => Self::Tbd,
            4 => Self::Switch,
            5 => Self::Hub,
            6 => Self::WirelessLan,
            7 => Self::Rj45,
            8 => Self::Tunnel,
            9 => Self::Ktunnel,
            10 => Self::Emane,
            11 => Self::TapBridge,
            12 => Self::PeerToPeer,
            13 => Self::ControlNet,
            14 => Self::EmaneNet,
            other => return Err(other),
        })
    }
}

/// Event type codes carried by the event type attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventType {
    None = 0,
    DefinitionState = 1,
    ConfigurationState = 2,
    InstantiationState = 3,
    RuntimeState = 4,
    DatacollectState = 5,
    ShutdownState = 6,
    Start = 7,
    Stop = 8,
    Pause = 9,
    Restart = 10,
    FileOpen = 11,
    FileSave = 12,
    Scheduled = 13,
    Reconfigure = 14,
    InstantiationComplete = 15,
}

impl TryFrom<u32> for EventType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::None,
            1 => Self::DefinitionState,
            2 => Self::ConfigurationState,
            3 => Self::InstantiationState,
            4 => Self::RuntimeState,
            5 => Self::DatacollectState,
            6 => Self::ShutdownState,
            7 => Self::Start,
            8 => Self::Stop,
            9 => Self::Pause,
            10 => Self::Restart,
            11 => Self::FileOpen,
            12 => Self::FileSave,
            13 => Self::Scheduled,
            14 => Self::Reconfigure,
            15 => Self::InstantiationComplete,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_contains_and_debug() {
        let flags = MessageFlags::ADD | MessageFlags::TTY;
        assert!(flags.contains(MessageFlags::ADD));
        assert!(flags.contains(MessageFlags::TTY));
        assert!(!flags.contains(MessageFlags::DELETE));
        assert!(!MessageFlags::NONE.contains(MessageFlags::NONE));
        assert_eq!(format!("{flags:?}"), "ADD|TTY");
        assert_eq!(format!("{:?}", MessageFlags::NONE), "NONE");
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert_eq!(MessageType::try_from(0x0B), Err(0x0B));
        assert_eq!(NodeType::try_from(99), Err(99));
        assert_eq!(EventType::try_from(15), Ok(EventType::InstantiationComplete));
    }
}
