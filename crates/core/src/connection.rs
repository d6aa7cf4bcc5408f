//! Collaborator interfaces
//!
//! The secure-connection handshake, the RPC layer, address resolution and the
//! UDP socket live outside the relay subsystem. These traits are the seams the
//! relay agent and the client circuit talk through.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::{
    EmbryoMaterial, NetAddress, NetEndpoint, PingRelayPacket, PingRelayResponse,
    SetupRelayBlock, SetupRelayResponse,
};

/// Server end of a secure connection, held by a relay exchange.
///
/// The exchange and its connection share a lifetime: removing the exchange
/// closes the connection, and a closed connection gets its exchanges swept.
pub trait ServerConnection: Send + Sync {
    /// Unique per process
    fn connection_id(&self) -> u64;

    /// Endpoint the peer's packets arrive from (relay id + address)
    fn destination_endpoint(&self) -> NetEndpoint;

    fn embryo(&self) -> EmbryoMaterial;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// Client end of a secure connection to a relay hop
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Logical address of the peer (possibly itself relayed)
    fn destination_address(&self) -> NetAddress;

    fn embryo(&self) -> EmbryoMaterial;

    fn is_closed(&self) -> bool;

    fn close(&self);

    /// `SetupRelay` RPC. `None` when the call could not be delivered.
    async fn setup_relay(&self, block: SetupRelayBlock) -> Option<SetupRelayResponse>;

    /// `PingRelay` RPC. `None` when the call could not be delivered.
    async fn ping_relay(&self, packet: PingRelayPacket) -> Option<PingRelayResponse>;
}

/// Logical address -> transport endpoint
pub trait EndpointResolver: Send + Sync {
    fn try_create_endpoint(&self, address: &NetAddress) -> Option<NetEndpoint>;
}

/// Raw datagram sink (the shared UDP sender)
pub trait PacketSender: Send + Sync {
    fn send(&self, addr: &SocketAddr, datagram: &[u8]);
}

/// Direction of a client circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitKind {
    /// Hides where our traffic goes to
    Outgoing,
    /// Gives us a reachable address behind a relay
    Incoming,
}

/// Connection-layer hook used when a circuit is torn down
pub trait RelayedConnectionCloser: Send + Sync {
    /// Close every connection that was routed through the circuit of `kind`
    fn close_relayed_connections(&self, kind: CircuitKind);
}
