use rand::rngs::OsRng;
use rand::RngCore;
use relaycraft_core::{KeyAndNonce, RelayId, KEY_AND_NONCE_SIZE};

/// Generate fresh tag-layer key material
pub fn generate_key_and_nonce() -> KeyAndNonce {
    let mut bytes = [0u8; KEY_AND_NONCE_SIZE];
    OsRng.fill_bytes(&mut bytes);
    KeyAndNonce::from_bytes(bytes)
}

/// Random per-packet salt
pub fn random_salt() -> u32 {
    OsRng.next_u32()
}

/// Random relay id; never zero, since zero means "not relayed"
pub fn random_relay_id() -> RelayId {
    loop {
        let id = OsRng.next_u32();
        if id != 0 {
            return id;
        }
    }
}
