//! Circuit encryption snapshot
//!
//! A `RelayKey` captures everything needed to layer-encrypt and decrypt for
//! one version of a circuit's node chain. It is never mutated: the circuit
//! builds a new one whenever the chain changes and readers keep using
//! whichever snapshot they cloned.

use relaycraft_core::{CircuitKind, EmbryoMaterial, KeyAndNonce, NetAddress, NetEndpoint};
use relaycraft_crypto::{
    decrypt_tag_layer, encrypt_tag_layer, open_relay_packet, seal_relay_packet, EncryptError,
};

use crate::{ClientError, RelayNode, Result};

/// An inbound packet with every layer removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPacket {
    /// Logical address the packet originated from
    pub address: NetAddress,
    /// Number of layers removed; negative on incoming circuits
    pub depth: i32,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RelayKey {
    kind: CircuitKind,
    /// First hop's endpoint and tag key
    first: Option<(NetEndpoint, KeyAndNonce)>,
    /// Connection material per hop, innermost first
    layers: Vec<EmbryoMaterial>,
}

impl RelayKey {
    pub fn empty(kind: CircuitKind) -> Self {
        Self {
            kind,
            first: None,
            layers: Vec::new(),
        }
    }

    pub fn new(kind: CircuitKind, nodes: &[RelayNode]) -> Self {
        Self {
            kind,
            first: nodes
                .first()
                .map(|node| (node.endpoint(), *node.inner_key_and_nonce())),
            layers: nodes.iter().map(RelayNode::embryo).collect(),
        }
    }

    pub fn kind(&self) -> CircuitKind {
        self.kind
    }

    /// Number of hops covered
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Where encrypted datagrams go, and where decryptable ones come from
    pub fn first_endpoint(&self) -> Option<NetEndpoint> {
        self.first.map(|(endpoint, _)| endpoint)
    }

    /// Remove all layers of a datagram received from `endpoint`.
    ///
    /// Only datagrams from the first hop can be decrypted. Layers are peeled
    /// innermost first until one reveals a terminal header; the depth it was
    /// found at is returned, signed by circuit direction.
    pub fn try_decrypt(&self, endpoint: &NetEndpoint, datagram: &[u8]) -> Option<DecryptedPacket> {
        let (first_endpoint, first_key) = self.first.as_ref()?;
        if first_endpoint != endpoint {
            return None;
        }

        let body = decrypt_tag_layer(first_key, datagram).ok()?;
        let opened = open_relay_packet(&self.layers, body).ok()?;
        let depth = i32::try_from(opened.depth).ok()?;

        Some(DecryptedPacket {
            address: opened.header.net_address,
            depth: match self.kind {
                CircuitKind::Outgoing => depth,
                CircuitKind::Incoming => -depth,
            },
            content: opened.content,
        })
    }

    /// Encrypt `content` for `destination`.
    ///
    /// A negative `relay_number` addresses exactly that many hops (the hop at
    /// that depth unwraps it); a positive one asks for at least that many and
    /// uses the whole chain.
    pub fn try_encrypt(
        &self,
        relay_number: i32,
        destination: NetAddress,
        content: &[u8],
    ) -> Result<Vec<u8>> {
        let (first_endpoint, first_key) = self.first.as_ref().ok_or(ClientError::NoRelays)?;
        let requested = relay_number.unsigned_abs() as usize;

        let hops = match relay_number {
            0 => return Err(ClientError::InvalidRelayNumber(relay_number)),
            n if n < 0 => requested,
            _ => self.layers.len(),
        };
        if requested > self.layers.len() {
            return Err(EncryptError::InsufficientRelays(relay_number).into());
        }

        let packet = seal_relay_packet(&self.layers[..hops], destination, content)?;
        Ok(encrypt_tag_layer(
            first_key,
            0,
            first_endpoint.relay_id,
            &packet,
        )?)
    }
}
