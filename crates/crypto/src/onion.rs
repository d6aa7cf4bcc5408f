//! Onion layers keyed by connection material
//!
//! Each relay hop removes (outward) or adds (inward) exactly one
//! ChaCha20-Poly1305 layer keyed by the embryo material of the connection the
//! client negotiated with that hop. All layers of a packet share the relay
//! header's clear salt; a layer encrypts everything after the salt in place
//! and appends its tag, so `n` layers cost `n * 16` bytes.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use relaycraft_core::{EmbryoMaterial, NetAddress};

use crate::encrypt::{EncryptError, AEAD_TAG_SIZE};
use crate::header::{RelayHeader, RELAY_HEADER_SIZE, RELAY_SALT_SIZE};
use crate::keys::random_salt;

/// `salt(4) | embryo_salt(8)`
fn layer_nonce(material: &EmbryoMaterial, salt: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&salt.to_le_bytes());
    nonce[4..].copy_from_slice(&material.salt.to_le_bytes());
    nonce
}

/// Add one onion layer to a relay packet (header + payload) in place
pub fn encrypt_layer(material: &EmbryoMaterial, packet: &mut Vec<u8>) -> Result<(), EncryptError> {
    if packet.len() < RELAY_HEADER_SIZE {
        return Err(EncryptError::CiphertextTooShort);
    }
    let salt = RelayHeader::read_salt(packet).ok_or(EncryptError::CiphertextTooShort)?;

    let cipher =
        ChaCha20Poly1305::new_from_slice(&material.key).map_err(|_| EncryptError::InvalidKey)?;
    let nonce = layer_nonce(material, salt);
    let tag = cipher
        .encrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            &material.secret,
            &mut packet[RELAY_SALT_SIZE..],
        )
        .map_err(|_| EncryptError::EncryptionFailed)?;

    packet.extend_from_slice(&tag);
    Ok(())
}

/// Remove one onion layer from a relay packet in place
pub fn decrypt_layer(material: &EmbryoMaterial, packet: &mut Vec<u8>) -> Result<(), EncryptError> {
    if packet.len() < RELAY_HEADER_SIZE + AEAD_TAG_SIZE {
        return Err(EncryptError::CiphertextTooShort);
    }
    let salt = RelayHeader::read_salt(packet).ok_or(EncryptError::CiphertextTooShort)?;

    let cipher =
        ChaCha20Poly1305::new_from_slice(&material.key).map_err(|_| EncryptError::InvalidKey)?;
    let nonce = layer_nonce(material, salt);
    let tag_start = packet.len() - AEAD_TAG_SIZE;
    let mut tag = [0u8; AEAD_TAG_SIZE];
    tag.copy_from_slice(&packet[tag_start..]);

    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            &material.secret,
            &mut packet[RELAY_SALT_SIZE..tag_start],
            GenericArray::from_slice(&tag),
        )
        .map_err(|_| EncryptError::DecryptionFailed)?;

    packet.truncate(tag_start);
    Ok(())
}

/// Build a terminal relay packet for `destination` and seal it.
///
/// `layers` is ordered innermost first: `layers[0]` is peeled first, the last
/// element is peeled last, so layers are applied in reverse.
pub fn seal_relay_packet(
    layers: &[EmbryoMaterial],
    destination: NetAddress,
    content: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let header = RelayHeader::new(random_salt(), destination);
    let mut packet =
        Vec::with_capacity(RELAY_HEADER_SIZE + content.len() + layers.len() * AEAD_TAG_SIZE);
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(content);

    for material in layers.iter().rev() {
        encrypt_layer(material, &mut packet)?;
    }
    Ok(packet)
}

/// A relay packet with all layers down to its terminal header removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRelayPacket {
    pub header: RelayHeader,
    pub content: Vec<u8>,
    /// Number of layers removed (1-based)
    pub depth: usize,
}

/// Peel layers in order until one reveals a terminal header
pub fn open_relay_packet(
    layers: &[EmbryoMaterial],
    mut packet: Vec<u8>,
) -> Result<OpenedRelayPacket, EncryptError> {
    for (index, material) in layers.iter().enumerate() {
        decrypt_layer(material, &mut packet)?;

        if RelayHeader::is_terminal(&packet) {
            let header = RelayHeader::parse(&packet).ok_or(EncryptError::CiphertextTooShort)?;
            let content = packet.split_off(RELAY_HEADER_SIZE);
            return Ok(OpenedRelayPacket {
                header,
                content,
                depth: index + 1,
            });
        }
    }

    Err(EncryptError::DecryptionFailed)
}
