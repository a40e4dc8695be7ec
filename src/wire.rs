//! On-wire constants for the FB BUS protocol (spec §6).
//!
//! Byte values here are bit-exact with the protocol documented by the
//! original FastyBird connector; nothing in this module is free to change.

use std::convert::TryFrom;

/// Frame terminator byte (`$`).
pub const TERMINATOR: u8 = 0x24;

/// Broadcast bus address.
pub const BROADCAST_ADDR: u8 = 0;

/// Default gateway (master) bus address.
pub const DEFAULT_MASTER_ADDRESS: u8 = 254;

/// "Unassigned" device address.
pub const UNASSIGNED_ADDRESS: u8 = 255;

/// Lowest / highest assignable bus address.
pub const MIN_ASSIGNABLE_ADDRESS: u8 = 1;
pub const MAX_ASSIGNABLE_ADDRESS: u8 = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1,
}

impl ProtocolVersion {
    pub const fn byte(self) -> u8 {
        match self {
            Self::V1 => 0x01,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::V1),
            other => Err(other),
        }
    }
}

/// Packet kind, payload byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Ping,
    Pong,
    Exception,
    Discover,
    ReadSingleRegister,
    ReadMultipleRegisters,
    WriteSingleRegister,
    ReportSingleRegister,
    PubSub(u8),
}

impl PacketKind {
    pub const fn byte(self) -> u8 {
        match self {
            Self::Ping => 0x01,
            Self::Pong => 0x02,
            Self::Exception => 0x03,
            Self::Discover => 0x04,
            Self::ReadSingleRegister => 0x21,
            Self::ReadMultipleRegisters => 0x22,
            Self::WriteSingleRegister => 0x31,
            Self::ReportSingleRegister => 0x41,
            Self::PubSub(n) => n,
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            0x03 => Ok(Self::Exception),
            0x04 => Ok(Self::Discover),
            0x21 => Ok(Self::ReadSingleRegister),
            0x22 => Ok(Self::ReadMultipleRegisters),
            0x31 => Ok(Self::WriteSingleRegister),
            0x41 => Ok(Self::ReportSingleRegister),
            n @ 0x51..=0x5F => Ok(Self::PubSub(n)),
            other => Err(other),
        }
    }
}

/// `DISCOVER` sub-command, payload byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoverCommand {
    Search,
    WriteAddress,
    ProvideRegisterStructure,
    PairingFinished,
}

impl DiscoverCommand {
    pub const fn byte(self) -> u8 {
        match self {
            Self::Search => 0x01,
            Self::WriteAddress => 0x02,
            Self::ProvideRegisterStructure => 0x03,
            Self::PairingFinished => 0x04,
        }
    }

    /// The response code a device sends back for this command (`0x50 + command`).
    pub const fn response_byte(self) -> u8 {
        0x50 + self.byte()
    }

    /// Ordered enrollment sequence (spec §4.6, phase 2).
    pub const SEQUENCE: [DiscoverCommand; 3] = [
        DiscoverCommand::WriteAddress,
        DiscoverCommand::ProvideRegisterStructure,
        DiscoverCommand::PairingFinished,
    ];

    pub fn next(self) -> Option<Self> {
        let pos = Self::SEQUENCE.iter().position(|c| *c == self)?;
        Self::SEQUENCE.get(pos + 1).copied()
    }

    /// Reverse of `response_byte` — decode a device's reply sub-command.
    pub fn from_response_byte(value: u8) -> Option<Self> {
        value.checked_sub(0x50).and_then(|b| Self::try_from(b).ok())
    }
}

impl TryFrom<u8> for DiscoverCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Search),
            0x02 => Ok(Self::WriteAddress),
            0x03 => Ok(Self::ProvideRegisterStructure),
            0x04 => Ok(Self::PairingFinished),
            other => Err(other),
        }
    }
}

/// Register kind, as encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Input,
    Output,
    Attribute,
    Setting,
}

impl RegisterKind {
    pub const fn byte(self) -> u8 {
        match self {
            Self::Input => 0x01,
            Self::Output => 0x02,
            Self::Attribute => 0x03,
            Self::Setting => 0x04,
        }
    }

    /// Enumeration order used while walking `UNKNOWN` registers during pairing
    /// (spec §4.6, command 2): INPUT, OUTPUT, ATTRIBUTE, SETTING.
    pub const ENUMERATION_ORDER: [RegisterKind; 4] = [
        Self::Input,
        Self::Output,
        Self::Attribute,
        Self::Setting,
    ];
}

impl TryFrom<u8> for RegisterKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Input),
            0x02 => Ok(Self::Output),
            0x03 => Ok(Self::Attribute),
            0x04 => Ok(Self::Setting),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_kind_roundtrip() {
        for kind in [
            PacketKind::Ping,
            PacketKind::Pong,
            PacketKind::Exception,
            PacketKind::Discover,
            PacketKind::ReadSingleRegister,
            PacketKind::ReadMultipleRegisters,
            PacketKind::WriteSingleRegister,
            PacketKind::ReportSingleRegister,
        ] {
            assert_eq!(PacketKind::try_from(kind.byte()), Ok(kind));
        }
    }

    #[test]
    fn discover_sequence_order() {
        assert_eq!(
            DiscoverCommand::WriteAddress.next(),
            Some(DiscoverCommand::ProvideRegisterStructure)
        );
        assert_eq!(
            DiscoverCommand::ProvideRegisterStructure.next(),
            Some(DiscoverCommand::PairingFinished)
        );
        assert_eq!(DiscoverCommand::PairingFinished.next(), None);
    }

    #[test]
    fn response_byte_offset() {
        assert_eq!(DiscoverCommand::Search.response_byte(), 0x51);
        assert_eq!(DiscoverCommand::PairingFinished.response_byte(), 0x54);
    }

    #[test]
    fn response_byte_roundtrip() {
        for cmd in [
            DiscoverCommand::Search,
            DiscoverCommand::WriteAddress,
            DiscoverCommand::ProvideRegisterStructure,
            DiscoverCommand::PairingFinished,
        ] {
            assert_eq!(DiscoverCommand::from_response_byte(cmd.response_byte()), Some(cmd));
        }
        assert_eq!(DiscoverCommand::from_response_byte(0x10), None);
    }
}
