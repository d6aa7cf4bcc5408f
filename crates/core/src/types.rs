use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// 32-bit relay identifier. Zero means "not relayed".
pub type RelayId = u32;

/// Encoded size of a [`NetAddress`]
pub const NET_ADDRESS_SIZE: usize = 24;

/// Size of [`KeyAndNonce`] material
pub const KEY_AND_NONCE_SIZE: usize = 32;

/// Logical address of a node.
///
/// A non-zero `relay_id` means the node is itself reachable only through the
/// relay listening at `ip:port`. The all-zero address is the [`NetAddress::RELAY`]
/// sentinel ("deliver to the relay node itself").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    pub relay_id: RelayId,
    pub port: u16,
    /// IPv6, or IPv4-mapped IPv6
    pub ip: Ipv6Addr,
}

impl NetAddress {
    /// "Deliver locally" sentinel carried in a terminal relay header
    pub const RELAY: NetAddress = NetAddress {
        relay_id: 0,
        port: 0,
        ip: Ipv6Addr::UNSPECIFIED,
    };

    pub fn new(relay_id: RelayId, addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            relay_id,
            port: addr.port(),
            ip,
        }
    }

    /// Address of the node sitting behind `endpoint`
    pub fn from_endpoint(endpoint: &NetEndpoint) -> Self {
        Self::new(endpoint.relay_id, endpoint.addr)
    }

    pub fn is_relay(&self) -> bool {
        *self == Self::RELAY
    }

    /// Transport address (IPv4-mapped addresses are unmapped)
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        };
        SocketAddr::new(ip, self.port)
    }

    /// `relay_id u32 LE | port u16 LE | reserved u16 | ip [16]`
    pub fn to_bytes(&self) -> [u8; NET_ADDRESS_SIZE] {
        let mut bytes = [0u8; NET_ADDRESS_SIZE];
        bytes[0..4].copy_from_slice(&self.relay_id.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.port.to_le_bytes());
        bytes[8..24].copy_from_slice(&self.ip.octets());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NET_ADDRESS_SIZE {
            return None;
        }

        let relay_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let port = u16::from_le_bytes(bytes[4..6].try_into().ok()?);
        let octets: [u8; 16] = bytes[8..24].try_into().ok()?;
        Some(Self {
            relay_id,
            port,
            ip: Ipv6Addr::from(octets),
        })
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_relay() {
            return write!(f, "relay");
        }
        if self.relay_id == 0 {
            write!(f, "{}", self.socket_addr())
        } else {
            write!(f, "{}@{}", self.relay_id, self.socket_addr())
        }
    }
}

/// Transport endpoint: the relay id to put in the destination field plus the
/// UDP address to send to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetEndpoint {
    pub relay_id: RelayId,
    pub addr: SocketAddr,
}

impl NetEndpoint {
    pub fn new(relay_id: RelayId, addr: SocketAddr) -> Self {
        Self { relay_id, addr }
    }
}

impl fmt::Display for NetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.relay_id, self.addr)
    }
}

/// Tag-layer key material: 16-byte AES-128 key followed by 16 bytes of nonce
/// material (the first 12 are used).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAndNonce(pub [u8; KEY_AND_NONCE_SIZE]);

impl KeyAndNonce {
    pub fn from_bytes(bytes: [u8; KEY_AND_NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn key(&self) -> &[u8] {
        &self.0[..16]
    }

    pub fn nonce_material(&self) -> &[u8] {
        &self.0[16..]
    }
}

impl fmt::Debug for KeyAndNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key bytes
        write!(f, "KeyAndNonce({}..)", hex::encode(&self.0[..2]))
    }
}

/// Per-connection symmetric material derived by the connection handshake.
///
/// Both ends of a connection hold identical material, so a relay hop and the
/// client that negotiated it can each apply or remove the same onion layer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EmbryoMaterial {
    pub key: [u8; 32],
    pub salt: u64,
    pub secret: [u8; 16],
}

impl fmt::Debug for EmbryoMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbryoMaterial")
            .field("salt", &self.salt)
            .finish_non_exhaustive()
    }
}
