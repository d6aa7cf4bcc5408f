//! One negotiated hop of a client circuit

use std::sync::Arc;

use relaycraft_core::{
    AssignRelayBlock, AssignRelayResponse, ClientConnection, EmbryoMaterial, KeyAndNonce, Mics,
    NetAddress, NetEndpoint, RelayId,
};

/// Client-side record of a relay hop
#[derive(Clone)]
pub struct RelayNode {
    /// Inner relay id + transport address, as the previous hop sends to it
    endpoint: NetEndpoint,
    /// Logical address of the relay node
    address: NetAddress,
    inner_key_and_nonce: KeyAndNonce,
    outer_relay_id: RelayId,
    relay_retention_mics: Mics,
    connection: Arc<dyn ClientConnection>,
}

impl RelayNode {
    /// Build the hop from a successful `AssignRelay` exchange. The relay's
    /// advertised address wins over the connection's destination.
    pub fn new(
        block: &AssignRelayBlock,
        response: &AssignRelayResponse,
        connection: Arc<dyn ClientConnection>,
    ) -> Self {
        let address = Self::resolve_address(response, connection.as_ref());
        Self {
            endpoint: NetEndpoint::new(response.inner_relay_id, address.socket_addr()),
            address,
            inner_key_and_nonce: block.inner_key_and_nonce,
            outer_relay_id: response.outer_relay_id,
            relay_retention_mics: response.relay_retention_mics,
            connection,
        }
    }

    pub(crate) fn resolve_address(
        response: &AssignRelayResponse,
        connection: &dyn ClientConnection,
    ) -> NetAddress {
        response
            .relay_address
            .unwrap_or_else(|| connection.destination_address())
    }

    pub fn endpoint(&self) -> NetEndpoint {
        self.endpoint
    }

    pub fn inner_relay_id(&self) -> RelayId {
        self.endpoint.relay_id
    }

    pub fn outer_relay_id(&self) -> RelayId {
        self.outer_relay_id
    }

    pub fn address(&self) -> NetAddress {
        self.address
    }

    /// Address under which the far side of this hop is reachable
    pub fn outer_address(&self) -> NetAddress {
        NetAddress::new(self.outer_relay_id, self.address.socket_addr())
    }

    pub fn inner_key_and_nonce(&self) -> &KeyAndNonce {
        &self.inner_key_and_nonce
    }

    pub fn relay_retention_mics(&self) -> Mics {
        self.relay_retention_mics
    }

    pub fn connection(&self) -> &Arc<dyn ClientConnection> {
        &self.connection
    }

    pub fn embryo(&self) -> EmbryoMaterial {
        self.connection.embryo()
    }

    pub fn is_alive(&self) -> bool {
        !self.connection.is_closed()
    }
}

impl std::fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNode")
            .field("endpoint", &self.endpoint)
            .field("address", &self.address)
            .field("outer_relay_id", &self.outer_relay_id)
            .finish_non_exhaustive()
    }
}
