//! Tag layer
//!
//! The per-hop AEAD wrapping of a relay datagram:
//! `src(4) | dst(4) | salt(4) | AES-128-GCM(rest of packet) | tag(16)`.
//! The body is a relay packet whose header salt stays in the clear. The relay
//! id prefix is authenticated as associated data and the nonce is the hop's
//! fixed nonce material with its first four bytes XORed with that salt, so no
//! per-packet nonce exchange is needed.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes128Gcm;
use relaycraft_core::{read_relay_ids, KeyAndNonce, RelayId, RELAY_ID_PREFIX_SIZE};
use thiserror::Error;

use crate::header::{RelayHeader, RELAY_SALT_SIZE};

/// AEAD authentication tag size, shared by both layer kinds
pub const AEAD_TAG_SIZE: usize = 16;

/// Bytes a tag layer adds on top of the relay id prefix and body
pub const TAG_LAYER_OVERHEAD: usize = AEAD_TAG_SIZE;

const NONCE_SIZE: usize = 12;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncryptError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Ciphertext too short")]
    CiphertextTooShort,
    #[error("Not enough relays for depth {0}")]
    InsufficientRelays(i32),
}

fn tag_nonce(key: &KeyAndNonce, salt: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&key.nonce_material()[..NONCE_SIZE]);
    for (n, s) in nonce.iter_mut().zip(salt.to_le_bytes()) {
        *n ^= s;
    }
    nonce
}

/// Wrap the relay packet `body` in a tag layer addressed
/// `source -> destination`
pub fn encrypt_tag_layer(
    key: &KeyAndNonce,
    source: RelayId,
    destination: RelayId,
    body: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let salt = RelayHeader::read_salt(body).ok_or(EncryptError::CiphertextTooShort)?;
    let cipher = Aes128Gcm::new_from_slice(key.key()).map_err(|_| EncryptError::InvalidKey)?;

    let mut datagram =
        Vec::with_capacity(RELAY_ID_PREFIX_SIZE + body.len() + TAG_LAYER_OVERHEAD);
    datagram.extend_from_slice(&source.to_le_bytes());
    datagram.extend_from_slice(&destination.to_le_bytes());
    datagram.extend_from_slice(body);

    let (prefix, rest) = datagram.split_at_mut(RELAY_ID_PREFIX_SIZE);
    let nonce = tag_nonce(key, salt);
    let tag = cipher
        .encrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            prefix,
            &mut rest[RELAY_SALT_SIZE..],
        )
        .map_err(|_| EncryptError::EncryptionFailed)?;

    datagram.extend_from_slice(&tag);
    Ok(datagram)
}

/// Remove the tag layer of a datagram and return its body, salt included
pub fn decrypt_tag_layer(key: &KeyAndNonce, datagram: &[u8]) -> Result<Vec<u8>, EncryptError> {
    if datagram.len() < RELAY_ID_PREFIX_SIZE + RELAY_SALT_SIZE + TAG_LAYER_OVERHEAD {
        return Err(EncryptError::CiphertextTooShort);
    }
    read_relay_ids(datagram).map_err(|_| EncryptError::CiphertextTooShort)?;

    let cipher = Aes128Gcm::new_from_slice(key.key()).map_err(|_| EncryptError::InvalidKey)?;
    let prefix = &datagram[..RELAY_ID_PREFIX_SIZE];
    let tag_start = datagram.len() - AEAD_TAG_SIZE;
    let mut body = datagram[RELAY_ID_PREFIX_SIZE..tag_start].to_vec();
    let salt = RelayHeader::read_salt(&body).ok_or(EncryptError::CiphertextTooShort)?;

    let nonce = tag_nonce(key, salt);
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            prefix,
            &mut body[RELAY_SALT_SIZE..],
            GenericArray::from_slice(&datagram[tag_start..]),
        )
        .map_err(|_| EncryptError::DecryptionFailed)?;

    Ok(body)
}
