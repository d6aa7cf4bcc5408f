//! RelayCraft Relay
//!
//! Server side of the relay circuit. Each node runs one `RelayAgent` that
//! owns the exchanges clients negotiated with it and peels or adds exactly
//! one layer per forwarded packet.

mod agent;
mod cache;
mod exchange;

#[cfg(test)]
mod test_support;

pub use agent::{DropReason, OutboundPacket, RelayAgent, RelayAgentConfig, RelayError, RelayOutcome};
pub use cache::EndpointCache;
pub use exchange::{ExchangeHandle, ExchangeState, ExchangeTable, RelayDirection, RelayExchange};
