//! Packet kinds and the small enums carried inside packet bodies.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WireError};

/// Packet kind, the first byte of the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    ConnectRequest = 1,
    ConnectAccept = 2,
    ConnectReject = 3,
    Message = 4,
    Rma = 5,
    ConnectionClosed = 6,
}

impl PacketKind {
    /// Size of the kind-specific body that follows the common header.
    pub const fn body_len(self) -> usize {
        match self {
            PacketKind::ConnectRequest => 16,
            PacketKind::ConnectAccept => 12,
            PacketKind::ConnectReject => 4,
            PacketKind::Message => 8,
            PacketKind::Rma => 28,
            PacketKind::ConnectionClosed => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            PacketKind::ConnectRequest => "CONNECT_REQUEST",
            PacketKind::ConnectAccept => "CONNECT_ACCEPT",
            PacketKind::ConnectReject => "CONNECT_REJECT",
            PacketKind::Message => "MESSAGE",
            PacketKind::Rma => "RMA",
            PacketKind::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketKind::ConnectRequest),
            2 => Ok(PacketKind::ConnectAccept),
            3 => Ok(PacketKind::ConnectReject),
            4 => Ok(PacketKind::Message),
            5 => Ok(PacketKind::Rma),
            6 => Ok(PacketKind::ConnectionClosed),
            _ => Err(WireError::UnknownKind(value)),
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Delivery semantics requested for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnAttribute {
    #[default]
    ReliableOrdered = 0,
    ReliableUnordered = 1,
    UnreliableUnordered = 2,
}

impl ConnAttribute {
    /// Whether data messages on this connection carry the reliable flag.
    pub const fn is_reliable(self) -> bool {
        !matches!(self, ConnAttribute::UnreliableUnordered)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ConnAttribute::ReliableOrdered => "reliable-ordered",
            ConnAttribute::ReliableUnordered => "reliable-unordered",
            ConnAttribute::UnreliableUnordered => "unreliable-unordered",
        }
    }
}

impl TryFrom<u8> for ConnAttribute {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ConnAttribute::ReliableOrdered),
            1 => Ok(ConnAttribute::ReliableUnordered),
            2 => Ok(ConnAttribute::UnreliableUnordered),
            _ => Err(WireError::UnknownAttribute(value)),
        }
    }
}

impl fmt::Display for ConnAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnAttribute {
    type Err = String;

    /// Accepts the long names and the short `ro`/`ru`/`uu` forms.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reliable-ordered" | "ro" => Ok(ConnAttribute::ReliableOrdered),
            "reliable-unordered" | "ru" => Ok(ConnAttribute::ReliableUnordered),
            "unreliable-unordered" | "uu" => Ok(ConnAttribute::UnreliableUnordered),
            other => Err(format!("unknown connection attribute: {other}")),
        }
    }
}

/// One-sided operation carried by an RMA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RmaOp {
    Read = 0,
    Write = 1,
}

impl TryFrom<u8> for RmaOp {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RmaOp::Read),
            1 => Ok(RmaOp::Write),
            _ => Err(WireError::UnknownRmaOp(value)),
        }
    }
}
