//! Datagram prefix and content packet types

use crate::{CoreError, RelayId, Result};

/// `SourceRelayId(4) | DestinationRelayId(4)` prefix carried by every datagram
pub const RELAY_ID_PREFIX_SIZE: usize = 8;

/// Largest datagram a relay forwards; anything bigger is dropped
pub const MAX_DATAGRAM_SIZE: usize = 1432;

/// Read the `(source, destination)` relay ids from a datagram
pub fn read_relay_ids(datagram: &[u8]) -> Result<(RelayId, RelayId)> {
    if datagram.len() < RELAY_ID_PREFIX_SIZE {
        return Err(CoreError::TooShort {
            required: RELAY_ID_PREFIX_SIZE,
            actual: datagram.len(),
        });
    }

    let source = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    let destination = u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
    Ok((source, destination))
}

/// Overwrite the relay id prefix of a datagram
pub fn write_relay_ids(datagram: &mut [u8], source: RelayId, destination: RelayId) -> Result<()> {
    if datagram.len() < RELAY_ID_PREFIX_SIZE {
        return Err(CoreError::TooShort {
            required: RELAY_ID_PREFIX_SIZE,
            actual: datagram.len(),
        });
    }

    datagram[0..4].copy_from_slice(&source.to_le_bytes());
    datagram[4..8].copy_from_slice(&destination.to_le_bytes());
    Ok(())
}

/// Content packet type, the first two bytes (u16 LE) of a relayed content
/// packet. Only the types that matter for relay admission are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Connection establishment; unrestricts the destination endpoint
    Connect,
    Ping,
    /// Bypass type a relay exit may accept from restricted endpoints
    OpenSesami,
    Data,
    Close,
    Other(u16),
}

impl PacketType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::Connect,
            2 => Self::Ping,
            3 => Self::OpenSesami,
            4 => Self::Data,
            5 => Self::Close,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Connect => 1,
            Self::Ping => 2,
            Self::OpenSesami => 3,
            Self::Data => 4,
            Self::Close => 5,
            Self::Other(other) => *other,
        }
    }

    /// Peek the type of a content packet
    pub fn of_content(content: &[u8]) -> Option<Self> {
        if content.len() < 2 {
            return None;
        }
        Some(Self::from_u16(u16::from_le_bytes([content[0], content[1]])))
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect)
    }
}
