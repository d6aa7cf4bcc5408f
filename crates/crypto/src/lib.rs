//! RelayCraft Cryptography
//!
//! Wire-level primitives of the relay circuit: the 32-byte relay header, the
//! per-hop tag layer and the connection-keyed onion layers.

mod encrypt;
mod header;
mod keys;
mod onion;

pub use encrypt::*;
pub use header::*;
pub use keys::*;
pub use onion::*;
