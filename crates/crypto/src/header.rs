//! Relay header
//!
//! `Salt(4) | Zero(4) | NetAddress(24)`. The salt stays in the clear and feeds
//! every layer's nonce; `Zero` and the address are covered by the onion
//! layers. A layer whose `Zero` decrypts to exactly 0 is the terminal one.

use relaycraft_core::{NetAddress, NET_ADDRESS_SIZE};

pub const RELAY_HEADER_SIZE: usize = 32;

/// Bytes of the header left in the clear
pub const RELAY_SALT_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHeader {
    pub salt: u32,
    pub zero: u32,
    pub net_address: NetAddress,
}

impl RelayHeader {
    /// Terminal header addressed to `net_address`
    pub fn new(salt: u32, net_address: NetAddress) -> Self {
        Self {
            salt,
            zero: 0,
            net_address,
        }
    }

    pub fn to_bytes(&self) -> [u8; RELAY_HEADER_SIZE] {
        let mut bytes = [0u8; RELAY_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.salt.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.zero.to_le_bytes());
        bytes[8..8 + NET_ADDRESS_SIZE].copy_from_slice(&self.net_address.to_bytes());
        bytes
    }

    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RELAY_HEADER_SIZE {
            return None;
        }

        Some(Self {
            salt: Self::read_salt(packet)?,
            zero: u32::from_le_bytes(packet[4..8].try_into().ok()?),
            net_address: NetAddress::from_bytes(&packet[8..RELAY_HEADER_SIZE])?,
        })
    }

    pub fn read_salt(packet: &[u8]) -> Option<u32> {
        let salt: [u8; RELAY_SALT_SIZE] = packet.get(..RELAY_SALT_SIZE)?.try_into().ok()?;
        Some(u32::from_le_bytes(salt))
    }

    /// Whether the (decrypted) packet carries a terminal header
    pub fn is_terminal(packet: &[u8]) -> bool {
        packet.len() >= RELAY_HEADER_SIZE && packet[4..8] == [0, 0, 0, 0]
    }
}
