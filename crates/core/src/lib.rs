//! RelayCraft Core Types
//!
//! This crate defines the wire types, control-plane messages and collaborator
//! interfaces shared by the relay agent and the client circuit.

mod connection;
mod error;
mod messages;
mod packet;
mod time;
mod types;

pub use connection::*;
pub use error::*;
pub use messages::*;
pub use packet::*;
pub use time::*;
pub use types::*;
