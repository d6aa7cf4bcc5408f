//! RelayCraft Client
//!
//! Client side of the relay circuit: grows a chain of relay hops one
//! `AddRelay` at a time, keeps it alive, and layer-encrypts traffic for it.
//!
//! ## Components
//!
//! - `RelayNode`: one negotiated hop
//! - `RelayKey`: immutable encryption snapshot of the current chain
//! - `RelayCircuit`: builder and maintainer, one per direction

mod circuit;
mod key;
mod node;

#[cfg(test)]
mod test_support;

pub use circuit::{CircuitConfig, RelayCircuit};
pub use key::{DecryptedPacket, RelayKey};
pub use node::RelayNode;

use relaycraft_crypto::EncryptError;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClientError {
    #[error("Circuit has no relays")]
    NoRelays,

    #[error("Invalid relay number: {0}")]
    InvalidRelayNumber(i32),

    #[error("Encryption error: {0}")]
    Encrypt(#[from] EncryptError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
