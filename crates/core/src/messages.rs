//! Relay control-plane messages
//!
//! Carried over an established connection by the RPC layer. The bincode
//! encoding here is a convenience for that layer; the relay logic only
//! works with the typed values.

use serde::{Deserialize, Serialize};

use crate::{KeyAndNonce, Mics, NetAddress, NetEndpoint, RelayId, RelayResult, Result};

/// First phase of hop negotiation, client -> relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRelayBlock {
    /// Tag-layer key shared between the client side and this hop
    pub inner_key_and_nonce: KeyAndNonce,
    pub allow_open_sesami: bool,
    pub allow_unknown_incoming: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRelayResponse {
    pub result: RelayResult,
    pub inner_relay_id: RelayId,
    pub outer_relay_id: RelayId,
    /// Address the relay wants to be reached at, when it differs from the
    /// connection's destination
    pub relay_address: Option<NetAddress>,
    pub relay_retention_mics: Mics,
}

impl AssignRelayResponse {
    pub fn rejected(result: RelayResult) -> Self {
        Self {
            result,
            inner_relay_id: 0,
            outer_relay_id: 0,
            relay_address: None,
            relay_retention_mics: 0,
        }
    }
}

/// Second phase, client -> previous hop: how to reach the new outermost hop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupRelayBlock {
    pub inner_relay_id: RelayId,
    pub outer_endpoint: NetEndpoint,
    pub outer_key_and_nonce: KeyAndNonce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupRelayResponse {
    pub result: RelayResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRelayPacket {
    pub inner_relay_id: RelayId,
}

/// Diagnostics answer to [`PingRelayPacket`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRelayResponse {
    pub relay_point: i64,
    pub outer_endpoint: Option<NetEndpoint>,
    pub relay_retention_mics: Mics,
}

macro_rules! impl_bincode {
    ($($ty:ty),*) => {
        $(
            impl $ty {
                pub fn to_bytes(&self) -> Result<Vec<u8>> {
                    Ok(bincode::serialize(self)?)
                }

                pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                    Ok(bincode::deserialize(bytes)?)
                }
            }
        )*
    };
}

impl_bincode!(
    AssignRelayBlock,
    AssignRelayResponse,
    SetupRelayBlock,
    SetupRelayResponse,
    PingRelayPacket,
    PingRelayResponse
);
