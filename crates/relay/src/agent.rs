//! Relay agent
//!
//! Owns the exchange table and endpoint cache of one node and runs the
//! per-packet forwarding state machine. State sits behind a single lock that
//! is held only for lookups and bookkeeping; all cryptography happens after
//! it is released. Forwarded datagrams go to a bounded queue drained by the
//! sender loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use relaycraft_core::{
    mics_now, write_relay_ids, AssignRelayBlock, AssignRelayResponse, EmbryoMaterial,
    EndpointResolver, KeyAndNonce, Mics, NetAddress, NetEndpoint, PacketSender, PacketType,
    PingRelayPacket, PingRelayResponse, RelayId, RelayResult, ServerConnection, SetupRelayBlock,
    SetupRelayResponse, MAX_DATAGRAM_SIZE, MICS_PER_SECOND, RELAY_ID_PREFIX_SIZE,
};
use relaycraft_crypto::{
    decrypt_layer, decrypt_tag_layer, encrypt_layer, encrypt_tag_layer, seal_relay_packet,
    RelayHeader, RELAY_HEADER_SIZE,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::cache::EndpointCache;
use crate::exchange::{ExchangeTable, RelayDirection, RelayExchange};

/// How long the send loop blocks before re-checking for cancellation
const SEND_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid agent config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay agent configuration
#[derive(Debug, Clone)]
pub struct RelayAgentConfig {
    /// Maximum number of concurrent exchanges
    pub max_exchanges: usize,
    /// Budget a new exchange starts with
    pub default_relay_point: i64,
    /// Upper bound for credited budgets
    pub max_relay_point: i64,
    /// Idle time after which an exchange is swept
    pub relay_retention_mics: Mics,
    /// Minimum spacing of admitted unknown incoming packets
    pub restricted_interval_mics: Mics,
    /// How long a connection packet unrestricts its destination
    pub endpoint_retention_mics: Mics,
    pub endpoint_cache_capacity: usize,
    pub clean_interval: Duration,
    pub send_queue_capacity: usize,
    /// Address advertised to clients instead of the connection's own
    pub relay_address: Option<NetAddress>,
}

impl Default for RelayAgentConfig {
    fn default() -> Self {
        Self {
            max_exchanges: 1000,
            default_relay_point: 1000,
            max_relay_point: 10_000,
            relay_retention_mics: 30 * MICS_PER_SECOND,
            restricted_interval_mics: MICS_PER_SECOND,
            endpoint_retention_mics: 60 * MICS_PER_SECOND,
            endpoint_cache_capacity: 1000,
            clean_interval: Duration::from_secs(10),
            send_queue_capacity: 4096,
            relay_address: None,
        }
    }
}

impl RelayAgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_exchanges == 0 {
            return Err(RelayError::InvalidConfig("max_exchanges must be positive".into()));
        }
        if self.default_relay_point < 0 || self.default_relay_point > self.max_relay_point {
            return Err(RelayError::InvalidConfig(format!(
                "default_relay_point {} outside 0..={}",
                self.default_relay_point, self.max_relay_point
            )));
        }
        if self.relay_retention_mics <= 0 || self.endpoint_retention_mics <= 0 {
            return Err(RelayError::InvalidConfig("retention must be positive".into()));
        }
        if self.endpoint_cache_capacity == 0 || self.send_queue_capacity == 0 {
            return Err(RelayError::InvalidConfig("capacities must be positive".into()));
        }
        if self.clean_interval.is_zero() {
            return Err(RelayError::InvalidConfig("clean_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Why a packet was silently dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Destination relay id 0
    NotRelayed,
    UnknownRelayId,
    /// Sender does not match the endpoint bound to the exchange
    InvalidSender,
    DecryptionFailed,
    /// Exit destination could not be resolved
    Unresolvable,
    /// Unsolicited traffic from a restricted endpoint
    Restricted,
    /// Non-terminal layer at a hop with no outer endpoint yet
    NotEstablished,
    /// Outbound queue at capacity
    QueueFull,
    /// Forwarded datagram would exceed `MAX_DATAGRAM_SIZE`
    TooLarge,
    Malformed,
}

/// Result of processing one relay datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Queued for `addr`
    Forwarded { addr: SocketAddr },
    /// Terminal layer addressed to this node; `endpoint` is the originator
    DeliverLocally {
        endpoint: NetEndpoint,
        content: Vec<u8>,
    },
    Dropped(DropReason),
}

impl RelayOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

/// A datagram waiting for the sender loop
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub addr: SocketAddr,
    pub datagram: Bytes,
}

struct AgentState {
    exchanges: ExchangeTable,
    endpoints: EndpointCache,
}

/// Exchange fields a forwarding step needs, copied out under the lock
enum Step {
    Outward {
        inner_key: KeyAndNonce,
        embryo: EmbryoMaterial,
        origin: NetEndpoint,
        outer_relay_id: RelayId,
        outer: Option<(NetEndpoint, KeyAndNonce)>,
    },
    InwardRelayed {
        outer_key: KeyAndNonce,
        inner_key: KeyAndNonce,
        embryo: EmbryoMaterial,
        origin: NetEndpoint,
        inner_relay_id: RelayId,
    },
    InwardOriginating {
        inner_key: KeyAndNonce,
        embryo: EmbryoMaterial,
        origin: NetEndpoint,
        inner_relay_id: RelayId,
        sender: NetAddress,
    },
}

/// Server-side relay agent, one per node
pub struct RelayAgent {
    config: RelayAgentConfig,
    state: Mutex<AgentState>,
    resolver: Arc<dyn EndpointResolver>,
    send_tx: Sender<OutboundPacket>,
    send_rx: Receiver<OutboundPacket>,
}

impl RelayAgent {
    pub fn new(config: RelayAgentConfig, resolver: Arc<dyn EndpointResolver>) -> Result<Self> {
        config.validate()?;
        let (send_tx, send_rx) = bounded(config.send_queue_capacity);
        let state = AgentState {
            exchanges: ExchangeTable::new(),
            endpoints: EndpointCache::with_capacity(config.endpoint_cache_capacity),
        };

        Ok(Self {
            config,
            state: Mutex::new(state),
            resolver,
            send_tx,
            send_rx,
        })
    }

    pub fn config(&self) -> &RelayAgentConfig {
        &self.config
    }

    // =========================================================================
    // Exchange management
    // =========================================================================

    /// Create an exchange for `connection`. Returns `(inner, outer)` relay ids.
    pub fn add_exchange(
        &self,
        connection: Arc<dyn ServerConnection>,
        block: &AssignRelayBlock,
    ) -> std::result::Result<(RelayId, RelayId), RelayResult> {
        let now = mics_now();
        let mut state = self.state.lock();
        if state.exchanges.len() >= self.config.max_exchanges {
            warn!(
                max = self.config.max_exchanges,
                "Relay exchange limit reached, refusing assignment"
            );
            return Err(RelayResult::RelayExchangeLimit);
        }

        let connection_id = connection.connection_id();
        let handle = state.exchanges.create(connection, block, &self.config, now);
        let ids = state
            .exchanges
            .get(handle)
            .map(|exchange| (exchange.inner_relay_id(), exchange.outer_relay_id()))
            .ok_or(RelayResult::ConnectionFailure)?;

        debug!(
            connection_id,
            inner = ids.0,
            outer = ids.1,
            "Relay exchange assigned"
        );
        Ok(ids)
    }

    /// First handshake phase: answer an `AssignRelay` request
    pub fn process_assign_relay(
        &self,
        connection: Arc<dyn ServerConnection>,
        block: &AssignRelayBlock,
    ) -> AssignRelayResponse {
        match self.add_exchange(connection, block) {
            Ok((inner_relay_id, outer_relay_id)) => AssignRelayResponse {
                result: RelayResult::Success,
                inner_relay_id,
                outer_relay_id,
                relay_address: self.config.relay_address,
                relay_retention_mics: self.config.relay_retention_mics,
            },
            Err(result) => AssignRelayResponse::rejected(result),
        }
    }

    /// Second handshake phase: bind the next hop to the exchange the caller
    /// owns. Rebinding an established exchange is allowed.
    pub fn process_setup_relay(
        &self,
        connection_id: u64,
        block: &SetupRelayBlock,
    ) -> SetupRelayResponse {
        let result = self.setup_relay(connection_id, block, mics_now());
        if !result.is_success() {
            debug!(
                inner = block.inner_relay_id,
                outer_endpoint = %block.outer_endpoint,
                %result,
                "Relay setup refused"
            );
        }
        SetupRelayResponse { result }
    }

    fn setup_relay(&self, connection_id: u64, block: &SetupRelayBlock, now: Mics) -> RelayResult {
        if !is_valid_outer_endpoint(&block.outer_endpoint) {
            return RelayResult::InvalidEndpoint;
        }

        let mut state = self.state.lock();
        let Some((handle, RelayDirection::Outward)) = state.exchanges.find(block.inner_relay_id)
        else {
            return RelayResult::InvalidEndpoint;
        };
        let Some(exchange) = state.exchanges.get_mut(handle) else {
            return RelayResult::InvalidEndpoint;
        };
        if exchange.connection().connection_id() != connection_id {
            return RelayResult::InvalidEndpoint;
        }

        exchange.bind_outer(block.outer_endpoint, block.outer_key_and_nonce);
        exchange.touch(now);
        debug!(
            inner = exchange.inner_relay_id(),
            outer_endpoint = %block.outer_endpoint,
            "Relay exchange established"
        );
        RelayResult::Success
    }

    /// Liveness ping from the client that owns the exchange
    pub fn process_ping_relay(
        &self,
        connection_id: u64,
        packet: &PingRelayPacket,
    ) -> Option<PingRelayResponse> {
        let mut state = self.state.lock();
        let (handle, direction) = state.exchanges.find(packet.inner_relay_id)?;
        if direction != RelayDirection::Outward {
            return None;
        }
        let exchange = state.exchanges.get_mut(handle)?;
        if exchange.connection().connection_id() != connection_id {
            return None;
        }

        exchange.touch(mics_now());
        Some(PingRelayResponse {
            relay_point: exchange.relay_point(),
            outer_endpoint: exchange.outer_endpoint(),
            relay_retention_mics: exchange.relay_retention_mics(),
        })
    }

    /// Credit an exchange's budget; returns the amount actually credited
    pub fn add_relay_point(&self, relay_id: RelayId, points: i64) -> i64 {
        let mut state = self.state.lock();
        let Some((handle, _)) = state.exchanges.find(relay_id) else {
            return 0;
        };
        state
            .exchanges
            .get_mut(handle)
            .map(|exchange| exchange.credit(points, self.config.max_relay_point))
            .unwrap_or(0)
    }

    /// Spend one point of the exchange owning `relay_id`. `false` when the
    /// id is unknown or the budget ran out, in which case the exchange is
    /// removed and its connection closed.
    pub fn decrement_and_check(&self, relay_id: RelayId) -> bool {
        let exhausted = {
            let mut state = self.state.lock();
            let Some((handle, _)) = state.exchanges.find(relay_id) else {
                return false;
            };
            match state.exchanges.decrement_and_check(handle, mics_now()) {
                Ok(()) => return true,
                Err(removed) => removed,
            }
        };

        if let Some(exchange) = exhausted {
            debug!(relay_id, "No relay point");
            exchange.close();
        }
        false
    }

    /// Remove the exchange owning `relay_id` and close its connection
    pub fn remove_exchange(&self, relay_id: RelayId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state
                .exchanges
                .find(relay_id)
                .and_then(|(handle, _)| state.exchanges.remove(handle))
        };

        match removed {
            Some(exchange) => {
                exchange.close();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, relay_id: RelayId) -> bool {
        self.state.lock().exchanges.contains_id(relay_id)
    }

    pub fn exchange_count(&self) -> usize {
        self.state.lock().exchanges.len()
    }

    pub fn relay_point(&self, relay_id: RelayId) -> Option<i64> {
        self.state
            .lock()
            .exchanges
            .get_by_relay_id(relay_id)
            .map(RelayExchange::relay_point)
    }

    /// Sweep exchanges whose connection closed or that sat idle too long
    pub fn clean(&self) -> usize {
        self.clean_at(mics_now())
    }

    pub fn clean_at(&self, now: Mics) -> usize {
        let removed = self.state.lock().exchanges.remove_expired(now);
        let count = removed.len();
        for exchange in removed {
            exchange.close();
        }

        if count > 0 {
            debug!(count, "Swept relay exchanges");
        }
        count
    }

    /// Run [`RelayAgent::clean`] every `clean_interval` until cancelled
    pub async fn run_clean_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.clean_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.clean_interval, "Relay clean loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.clean();
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Relay clean loop stopped");
    }

    // =========================================================================
    // Forwarding
    // =========================================================================

    /// Process a relay datagram (prefix included) received from `from`,
    /// where `from.relay_id` is the datagram's source relay id
    pub fn process_relay(
        &self,
        from: NetEndpoint,
        destination_relay_id: RelayId,
        datagram: &[u8],
    ) -> RelayOutcome {
        self.process_relay_at(from, destination_relay_id, datagram, mics_now())
    }

    pub fn process_relay_at(
        &self,
        from: NetEndpoint,
        destination_relay_id: RelayId,
        datagram: &[u8],
        now: Mics,
    ) -> RelayOutcome {
        let result = if destination_relay_id == 0 {
            Err(DropReason::NotRelayed)
        } else if datagram.len() < RELAY_ID_PREFIX_SIZE {
            Err(DropReason::Malformed)
        } else {
            self.prepare(from, destination_relay_id, datagram, now)
                .and_then(|step| self.forward(step, datagram, now))
        };

        match result {
            Ok(outcome) => outcome,
            Err(reason) => {
                trace!(%from, relay_id = destination_relay_id, ?reason, "Relay packet dropped");
                RelayOutcome::Dropped(reason)
            }
        }
    }

    /// Lock phase: locate the exchange, check the sender, apply admission
    /// and spend a relay point
    fn prepare(
        &self,
        from: NetEndpoint,
        relay_id: RelayId,
        datagram: &[u8],
        now: Mics,
    ) -> std::result::Result<Step, DropReason> {
        let exhausted;
        let step = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let (handle, direction) = state
                .exchanges
                .find(relay_id)
                .ok_or(DropReason::UnknownRelayId)?;
            let exchange = state
                .exchanges
                .get_mut(handle)
                .ok_or(DropReason::UnknownRelayId)?;

            let origin = exchange.connection().destination_endpoint();
            let embryo = exchange.connection().embryo();
            let inner_key = *exchange.inner_key_and_nonce();

            let step = match (direction, exchange.outer_endpoint()) {
                (RelayDirection::Outward, outer_endpoint) => {
                    if from != origin {
                        return Err(DropReason::InvalidSender);
                    }
                    Step::Outward {
                        inner_key,
                        embryo,
                        origin,
                        outer_relay_id: exchange.outer_relay_id(),
                        outer: outer_endpoint.zip(exchange.outer_key_and_nonce().copied()),
                    }
                }
                (RelayDirection::Inward, Some(outer_endpoint)) => {
                    if from.addr != outer_endpoint.addr {
                        return Err(DropReason::InvalidSender);
                    }
                    if from.relay_id == outer_endpoint.relay_id {
                        Step::InwardRelayed {
                            outer_key: exchange
                                .outer_key_and_nonce()
                                .copied()
                                .ok_or(DropReason::NotEstablished)?,
                            inner_key,
                            embryo,
                            origin,
                            inner_relay_id: exchange.inner_relay_id(),
                        }
                    } else if from.relay_id == 0 {
                        // The next hop itself talking to us directly
                        Step::InwardOriginating {
                            inner_key,
                            embryo,
                            origin,
                            inner_relay_id: exchange.inner_relay_id(),
                            sender: NetAddress::from_endpoint(&from),
                        }
                    } else {
                        return Err(DropReason::InvalidSender);
                    }
                }
                (RelayDirection::Inward, None) => {
                    let sender = NetAddress::from_endpoint(&from);
                    let content = &datagram[RELAY_ID_PREFIX_SIZE..];
                    // The cache is shared by every exchange on this node: a
                    // Connect sent through any of them opens the endpoint for
                    // all outermost exchanges here.
                    let admitted = state.endpoints.is_unrestricted(&sender, now)
                        || (exchange.allow_open_sesami()
                            && PacketType::of_content(content) == Some(PacketType::OpenSesami))
                        || exchange.try_admit_unknown(now);
                    if !admitted {
                        return Err(DropReason::Restricted);
                    }
                    Step::InwardOriginating {
                        inner_key,
                        embryo,
                        origin,
                        inner_relay_id: exchange.inner_relay_id(),
                        sender,
                    }
                }
            };

            // An exhausted exchange is removed, but this packet still goes out
            exhausted = state
                .exchanges
                .decrement_and_check(handle, now)
                .err()
                .flatten();
            step
        };

        if let Some(exchange) = exhausted {
            debug!(relay_id, "No relay point");
            exchange.close();
        }
        Ok(step)
    }

    /// Crypto phase: runs without the lock except for the exit resolution
    fn forward(
        &self,
        step: Step,
        datagram: &[u8],
        now: Mics,
    ) -> std::result::Result<RelayOutcome, DropReason> {
        match step {
            Step::Outward {
                inner_key,
                embryo,
                origin,
                outer_relay_id,
                outer,
            } => {
                let mut body =
                    decrypt_tag_layer(&inner_key, datagram).map_err(|_| DropReason::DecryptionFailed)?;
                decrypt_layer(&embryo, &mut body).map_err(|_| DropReason::DecryptionFailed)?;

                if RelayHeader::is_terminal(&body) {
                    let header = RelayHeader::parse(&body).ok_or(DropReason::Malformed)?;
                    let content = body.split_off(RELAY_HEADER_SIZE);
                    if header.net_address.is_relay() {
                        return Ok(RelayOutcome::DeliverLocally {
                            endpoint: origin,
                            content,
                        });
                    }

                    let endpoint = self.resolve_exit(&header.net_address, &content, now)?;
                    let mut out = vec![0u8; RELAY_ID_PREFIX_SIZE];
                    write_relay_ids(&mut out, outer_relay_id, endpoint.relay_id)
                        .map_err(|_| DropReason::Malformed)?;
                    out.extend_from_slice(&content);
                    return self.enqueue(endpoint.addr, out);
                }

                let (outer_endpoint, outer_key) = outer.ok_or(DropReason::NotEstablished)?;
                let out = encrypt_tag_layer(&outer_key, outer_relay_id, outer_endpoint.relay_id, &body)
                    .map_err(|_| DropReason::Malformed)?;
                self.enqueue(outer_endpoint.addr, out)
            }
            Step::InwardRelayed {
                outer_key,
                inner_key,
                embryo,
                origin,
                inner_relay_id,
            } => {
                let mut body =
                    decrypt_tag_layer(&outer_key, datagram).map_err(|_| DropReason::DecryptionFailed)?;
                encrypt_layer(&embryo, &mut body).map_err(|_| DropReason::Malformed)?;
                let out = encrypt_tag_layer(&inner_key, inner_relay_id, origin.relay_id, &body)
                    .map_err(|_| DropReason::Malformed)?;
                self.enqueue(origin.addr, out)
            }
            Step::InwardOriginating {
                inner_key,
                embryo,
                origin,
                inner_relay_id,
                sender,
            } => {
                let content = &datagram[RELAY_ID_PREFIX_SIZE..];
                let packet = seal_relay_packet(std::slice::from_ref(&embryo), sender, content)
                    .map_err(|_| DropReason::Malformed)?;
                let out = encrypt_tag_layer(&inner_key, inner_relay_id, origin.relay_id, &packet)
                    .map_err(|_| DropReason::Malformed)?;
                self.enqueue(origin.addr, out)
            }
        }
    }

    /// Resolve an exit destination; a connection packet unrestricts it
    fn resolve_exit(
        &self,
        address: &NetAddress,
        content: &[u8],
        now: Mics,
    ) -> std::result::Result<NetEndpoint, DropReason> {
        let mut state = self.state.lock();
        let endpoint = state
            .endpoints
            .get_endpoint(address, self.resolver.as_ref())
            .ok_or(DropReason::Unresolvable)?;

        if PacketType::of_content(content).is_some_and(|packet_type| packet_type.is_connect()) {
            state
                .endpoints
                .unrestrict(address, now + self.config.endpoint_retention_mics);
            trace!(%address, "Endpoint unrestricted");
        }
        Ok(endpoint)
    }

    fn enqueue(
        &self,
        addr: SocketAddr,
        datagram: Vec<u8>,
    ) -> std::result::Result<RelayOutcome, DropReason> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(DropReason::TooLarge);
        }
        let packet = OutboundPacket {
            addr,
            datagram: Bytes::from(datagram),
        };
        self.send_tx
            .try_send(packet)
            .map_err(|_| DropReason::QueueFull)?;
        Ok(RelayOutcome::Forwarded { addr })
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Pop the next queued datagram, if any
    pub fn next_outbound(&self) -> Option<OutboundPacket> {
        self.send_rx.try_recv().ok()
    }

    pub fn pending_sends(&self) -> usize {
        self.send_rx.len()
    }

    /// Drain the outbound queue into `sender`; returns the number sent
    pub fn process_send(&self, sender: &dyn PacketSender) -> usize {
        let mut sent = 0;
        while let Ok(packet) = self.send_rx.try_recv() {
            sender.send(&packet.addr, &packet.datagram);
            sent += 1;
        }
        sent
    }

    /// Blocking send loop. Run it on a dedicated thread
    /// (`tokio::task::spawn_blocking` or `std::thread::spawn`).
    pub fn run_send_loop(&self, sender: &dyn PacketSender, cancel: watch::Receiver<bool>) {
        info!("Relay send loop started");

        while !*cancel.borrow() {
            match self.send_rx.recv_timeout(SEND_POLL_INTERVAL) {
                Ok(packet) => {
                    sender.send(&packet.addr, &packet.datagram);
                    self.process_send(sender);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("Relay send loop stopped");
    }
}

fn is_valid_outer_endpoint(endpoint: &NetEndpoint) -> bool {
    endpoint.relay_id != 0 && endpoint.addr.port() != 0 && !endpoint.addr.ip().is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{embryo, MockResolver, MockServerConnection, RecordingSender};
    use relaycraft_core::read_relay_ids;
    use relaycraft_crypto::{generate_key_and_nonce, open_relay_packet};

    fn agent_with(config: RelayAgentConfig) -> RelayAgent {
        RelayAgent::new(config, Arc::new(MockResolver::new())).unwrap()
    }

    fn agent() -> RelayAgent {
        agent_with(RelayAgentConfig::default())
    }

    fn assign_block(open_sesami: bool, unknown_incoming: bool) -> AssignRelayBlock {
        AssignRelayBlock {
            inner_key_and_nonce: generate_key_and_nonce(),
            allow_open_sesami: open_sesami,
            allow_unknown_incoming: unknown_incoming,
        }
    }

    fn content(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
        let mut content = packet_type.as_u16().to_le_bytes().to_vec();
        content.extend_from_slice(payload);
        content
    }

    /// One-hop client view of an exchange
    struct Hop {
        connection: Arc<MockServerConnection>,
        block: AssignRelayBlock,
        inner: RelayId,
        outer: RelayId,
    }

    impl Hop {
        fn assign(agent: &RelayAgent, id: u64, block: AssignRelayBlock) -> Self {
            let connection = MockServerConnection::arc(id);
            let (inner, outer) = agent.add_exchange(connection.clone(), &block).unwrap();
            Self {
                connection,
                block,
                inner,
                outer,
            }
        }

        fn from(&self) -> NetEndpoint {
            self.connection.destination_endpoint()
        }

        /// Client-built outward datagram terminating at this hop
        fn outward(&self, destination: NetAddress, content: &[u8]) -> Vec<u8> {
            let packet =
                seal_relay_packet(&[self.connection.embryo()], destination, content).unwrap();
            encrypt_tag_layer(&self.block.inner_key_and_nonce, 0, self.inner, &packet).unwrap()
        }

        /// Client side decryption of an inward datagram
        fn open_inward(&self, datagram: &[u8]) -> (NetAddress, Vec<u8>) {
            let body = decrypt_tag_layer(&self.block.inner_key_and_nonce, datagram).unwrap();
            let opened = open_relay_packet(&[self.connection.embryo()], body).unwrap();
            assert_eq!(opened.depth, 1);
            (opened.header.net_address, opened.content)
        }
    }

    fn remote() -> NetAddress {
        NetAddress::new(0, "198.51.100.7:9000".parse().unwrap())
    }

    fn from_remote() -> NetEndpoint {
        NetEndpoint::new(0, remote().socket_addr())
    }

    fn inward(hop: &Hop, content: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0u8; RELAY_ID_PREFIX_SIZE];
        write_relay_ids(&mut datagram, 0, hop.outer).unwrap();
        datagram.extend_from_slice(content);
        datagram
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RelayAgentConfig {
            default_relay_point: 20_000,
            ..RelayAgentConfig::default()
        };
        let result = RelayAgent::new(config, Arc::new(MockResolver::new()));
        assert!(matches!(result, Err(RelayError::InvalidConfig(_))));
    }

    #[test]
    fn test_exchange_limit() {
        let agent = agent_with(RelayAgentConfig {
            max_exchanges: 2,
            ..RelayAgentConfig::default()
        });

        Hop::assign(&agent, 1, assign_block(false, false));
        Hop::assign(&agent, 2, assign_block(false, false));
        let result = agent.add_exchange(MockServerConnection::arc(3), &assign_block(false, false));

        assert_eq!(result, Err(RelayResult::RelayExchangeLimit));
        assert_eq!(agent.exchange_count(), 2);
    }

    #[test]
    fn test_assign_response() {
        let relay_address = NetAddress::new(0, "192.0.2.1:7000".parse().unwrap());
        let agent = agent_with(RelayAgentConfig {
            relay_address: Some(relay_address),
            ..RelayAgentConfig::default()
        });

        let response =
            agent.process_assign_relay(MockServerConnection::arc(1), &assign_block(false, false));
        assert_eq!(response.result, RelayResult::Success);
        assert_ne!(response.inner_relay_id, response.outer_relay_id);
        assert_eq!(response.relay_address, Some(relay_address));
        assert_eq!(response.relay_retention_mics, 30 * MICS_PER_SECOND);
        assert!(agent.contains(response.inner_relay_id));
        assert!(agent.contains(response.outer_relay_id));
    }

    #[test]
    fn test_not_relayed_and_unknown_id() {
        let agent = agent();
        let from = NetEndpoint::new(0, "10.0.0.1:4000".parse().unwrap());

        assert_eq!(
            agent.process_relay(from, 0, &[0u8; 64]),
            RelayOutcome::Dropped(DropReason::NotRelayed)
        );
        assert_eq!(
            agent.process_relay(from, 1234, &[0u8; 64]),
            RelayOutcome::Dropped(DropReason::UnknownRelayId)
        );
    }

    #[test]
    fn test_deliver_locally() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let payload = content(PacketType::Data, b"to the relay");

        let outcome = agent.process_relay(hop.from(), hop.inner, &hop.outward(NetAddress::RELAY, &payload));

        assert_eq!(
            outcome,
            RelayOutcome::DeliverLocally {
                endpoint: hop.from(),
                content: payload,
            }
        );
        assert_eq!(agent.pending_sends(), 0);
    }

    #[test]
    fn test_outward_from_wrong_sender_dropped() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let datagram = hop.outward(remote(), &content(PacketType::Data, b"x"));
        let impostor = NetEndpoint::new(0, "10.9.9.9:4000".parse().unwrap());

        assert_eq!(
            agent.process_relay(impostor, hop.inner, &datagram),
            RelayOutcome::Dropped(DropReason::InvalidSender)
        );
    }

    #[test]
    fn test_tampered_datagram_dropped() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let mut datagram = hop.outward(remote(), &content(PacketType::Data, b"x"));
        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;

        assert_eq!(
            agent.process_relay(hop.from(), hop.inner, &datagram),
            RelayOutcome::Dropped(DropReason::DecryptionFailed)
        );
    }

    #[test]
    fn test_exit_forwards_plain_content() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let payload = content(PacketType::Data, b"hello exit");

        let outcome = agent.process_relay(hop.from(), hop.inner, &hop.outward(remote(), &payload));
        assert_eq!(
            outcome,
            RelayOutcome::Forwarded {
                addr: remote().socket_addr()
            }
        );

        let packet = agent.next_outbound().unwrap();
        assert_eq!(packet.addr, remote().socket_addr());
        assert_eq!(read_relay_ids(&packet.datagram).unwrap(), (hop.outer, 0));
        assert_eq!(&packet.datagram[RELAY_ID_PREFIX_SIZE..], payload.as_slice());
    }

    #[test]
    fn test_unresolvable_exit_dropped() {
        let agent = RelayAgent::new(
            RelayAgentConfig::default(),
            Arc::new(MockResolver::failing()),
        )
        .unwrap();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let datagram = hop.outward(remote(), &content(PacketType::Connect, b""));

        assert_eq!(
            agent.process_relay(hop.from(), hop.inner, &datagram),
            RelayOutcome::Dropped(DropReason::Unresolvable)
        );
    }

    #[test]
    fn test_unsolicited_incoming_is_restricted() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));

        let outcome = agent.process_relay(
            from_remote(),
            hop.outer,
            &inward(&hop, &content(PacketType::Data, b"unsolicited")),
        );

        assert_eq!(outcome, RelayOutcome::Dropped(DropReason::Restricted));
        assert_eq!(agent.pending_sends(), 0);
    }

    #[test]
    fn test_connect_unrestricts_until_retention() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let now = mics_now();

        let connect = hop.outward(remote(), &content(PacketType::Connect, b"syn"));
        assert!(!agent
            .process_relay_at(hop.from(), hop.inner, &connect, now)
            .is_dropped());
        agent.next_outbound().unwrap();

        let reply = content(PacketType::Data, b"reply");
        let outcome =
            agent.process_relay_at(from_remote(), hop.outer, &inward(&hop, &reply), now + 1);
        assert_eq!(
            outcome,
            RelayOutcome::Forwarded {
                addr: hop.from().addr
            }
        );

        let packet = agent.next_outbound().unwrap();
        assert_eq!(read_relay_ids(&packet.datagram).unwrap(), (hop.inner, 0));
        let (sender, opened) = hop.open_inward(&packet.datagram);
        assert_eq!(sender, remote());
        assert_eq!(opened, reply);

        // Back to restricted once the retention window has passed
        let expired = now + RelayAgentConfig::default().endpoint_retention_mics;
        assert_eq!(
            agent.process_relay_at(from_remote(), hop.outer, &inward(&hop, &reply), expired),
            RelayOutcome::Dropped(DropReason::Restricted)
        );
    }

    #[test]
    fn test_non_connect_does_not_unrestrict() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));

        let data = hop.outward(remote(), &content(PacketType::Data, b"hello"));
        assert!(!agent.process_relay(hop.from(), hop.inner, &data).is_dropped());

        assert_eq!(
            agent.process_relay(
                from_remote(),
                hop.outer,
                &inward(&hop, &content(PacketType::Data, b"reply"))
            ),
            RelayOutcome::Dropped(DropReason::Restricted)
        );
    }

    #[test]
    fn test_connect_unrestricts_for_every_exchange() {
        let agent = agent();
        let connected = Hop::assign(&agent, 1, assign_block(false, false));
        let other = Hop::assign(&agent, 2, assign_block(false, false));

        let connect = connected.outward(remote(), &content(PacketType::Connect, b"syn"));
        assert!(!agent
            .process_relay(connected.from(), connected.inner, &connect)
            .is_dropped());
        agent.next_outbound().unwrap();

        // The other circuit never connected but shares the node's cache
        let reply = content(PacketType::Data, b"reply");
        assert_eq!(
            agent.process_relay(from_remote(), other.outer, &inward(&other, &reply)),
            RelayOutcome::Forwarded {
                addr: other.from().addr
            }
        );
        let packet = agent.next_outbound().unwrap();
        assert_eq!(other.open_inward(&packet.datagram), (remote(), reply));
    }

    #[test]
    fn test_open_sesami_bypass() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(true, false));

        let sesami = inward(&hop, &content(PacketType::OpenSesami, b"knock"));
        assert!(!agent.process_relay(from_remote(), hop.outer, &sesami).is_dropped());

        let data = inward(&hop, &content(PacketType::Data, b"knock"));
        assert_eq!(
            agent.process_relay(from_remote(), hop.outer, &data),
            RelayOutcome::Dropped(DropReason::Restricted)
        );
    }

    #[test]
    fn test_unknown_incoming_is_rate_bounded() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, true));
        let datagram = inward(&hop, &content(PacketType::Data, b"hi"));
        let now = mics_now() + MICS_PER_SECOND;

        assert!(!agent
            .process_relay_at(from_remote(), hop.outer, &datagram, now)
            .is_dropped());
        assert_eq!(
            agent.process_relay_at(from_remote(), hop.outer, &datagram, now + 10),
            RelayOutcome::Dropped(DropReason::Restricted)
        );
        assert!(!agent
            .process_relay_at(from_remote(), hop.outer, &datagram, now + MICS_PER_SECOND)
            .is_dropped());
    }

    #[test]
    fn test_point_exhaustion_removes_exchange() {
        let agent = agent_with(RelayAgentConfig {
            default_relay_point: 2,
            ..RelayAgentConfig::default()
        });
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let datagram = hop.outward(NetAddress::RELAY, &content(PacketType::Data, b"x"));

        assert!(!agent.process_relay(hop.from(), hop.inner, &datagram).is_dropped());
        assert!(!agent.process_relay(hop.from(), hop.inner, &datagram).is_dropped());
        assert_eq!(agent.relay_point(hop.inner), Some(0));

        // The exhausting packet is still processed
        assert!(!agent.process_relay(hop.from(), hop.inner, &datagram).is_dropped());
        assert!(!agent.contains(hop.inner));
        assert!(!agent.contains(hop.outer));
        assert!(hop.connection.is_closed());

        assert_eq!(
            agent.process_relay(hop.from(), hop.inner, &datagram),
            RelayOutcome::Dropped(DropReason::UnknownRelayId)
        );
    }

    #[test]
    fn test_decrement_and_check_three_times() {
        let agent = agent_with(RelayAgentConfig {
            default_relay_point: 2,
            ..RelayAgentConfig::default()
        });
        let hop = Hop::assign(&agent, 1, assign_block(false, false));

        assert!(agent.decrement_and_check(hop.inner));
        assert!(agent.decrement_and_check(hop.outer));
        assert!(!agent.decrement_and_check(hop.inner));
        assert_eq!(agent.exchange_count(), 0);
        assert!(hop.connection.is_closed());
    }

    #[test]
    fn test_add_relay_point_is_capped() {
        let agent = agent_with(RelayAgentConfig {
            default_relay_point: 10,
            max_relay_point: 100,
            ..RelayAgentConfig::default()
        });
        let hop = Hop::assign(&agent, 1, assign_block(false, false));

        assert_eq!(agent.add_relay_point(hop.inner, 50), 50);
        assert_eq!(agent.add_relay_point(hop.outer, 50), 40);
        assert_eq!(agent.relay_point(hop.inner), Some(100));
        assert_eq!(agent.add_relay_point(42, 10), 0);
    }

    fn setup_block(hop: &Hop, outer_endpoint: NetEndpoint) -> SetupRelayBlock {
        SetupRelayBlock {
            inner_relay_id: hop.inner,
            outer_endpoint,
            outer_key_and_nonce: generate_key_and_nonce(),
        }
    }

    #[test]
    fn test_setup_relay_validation() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let next = NetEndpoint::new(77, "10.0.0.2:4000".parse().unwrap());

        let no_relay_id = setup_block(&hop, NetEndpoint::new(0, next.addr));
        assert_eq!(
            agent.process_setup_relay(1, &no_relay_id).result,
            RelayResult::InvalidEndpoint
        );

        let unspecified = setup_block(&hop, NetEndpoint::new(77, "0.0.0.0:4000".parse().unwrap()));
        assert_eq!(
            agent.process_setup_relay(1, &unspecified).result,
            RelayResult::InvalidEndpoint
        );

        // Only the connection that owns the exchange may set it up
        assert_eq!(
            agent.process_setup_relay(2, &setup_block(&hop, next)).result,
            RelayResult::InvalidEndpoint
        );

        let mut by_outer = setup_block(&hop, next);
        by_outer.inner_relay_id = hop.outer;
        assert_eq!(
            agent.process_setup_relay(1, &by_outer).result,
            RelayResult::InvalidEndpoint
        );

        assert_eq!(
            agent.process_setup_relay(1, &setup_block(&hop, next)).result,
            RelayResult::Success
        );
        let ping = agent
            .process_ping_relay(1, &PingRelayPacket { inner_relay_id: hop.inner })
            .unwrap();
        assert_eq!(ping.outer_endpoint, Some(next));
        assert_eq!(ping.relay_point, 1000);
    }

    #[test]
    fn test_ping_requires_owner() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));

        assert!(agent
            .process_ping_relay(2, &PingRelayPacket { inner_relay_id: hop.inner })
            .is_none());
        assert!(agent
            .process_ping_relay(1, &PingRelayPacket { inner_relay_id: hop.outer })
            .is_none());
        let ping = agent
            .process_ping_relay(1, &PingRelayPacket { inner_relay_id: hop.inner })
            .unwrap();
        assert!(ping.outer_endpoint.is_none());
    }

    #[test]
    fn test_established_hop_rewraps_for_next_hop() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let next_endpoint = NetEndpoint::new(77, "10.0.0.2:4000".parse().unwrap());
        let setup = setup_block(&hop, next_endpoint);
        assert!(agent.process_setup_relay(1, &setup).result.is_success());

        // Two layers: this hop's, then the next hop's
        let next_embryo = embryo(2);
        let payload = content(PacketType::Data, b"two hops");
        let packet =
            seal_relay_packet(&[hop.connection.embryo(), next_embryo], remote(), &payload).unwrap();
        let datagram =
            encrypt_tag_layer(&hop.block.inner_key_and_nonce, 0, hop.inner, &packet).unwrap();

        let outcome = agent.process_relay(hop.from(), hop.inner, &datagram);
        assert_eq!(
            outcome,
            RelayOutcome::Forwarded {
                addr: next_endpoint.addr
            }
        );

        let forwarded = agent.next_outbound().unwrap();
        assert_eq!(read_relay_ids(&forwarded.datagram).unwrap(), (hop.outer, 77));
        let body = decrypt_tag_layer(&setup.outer_key_and_nonce, &forwarded.datagram).unwrap();
        let opened = open_relay_packet(&[next_embryo], body).unwrap();
        assert_eq!(opened.header.net_address, remote());
        assert_eq!(opened.content, payload);
    }

    #[test]
    fn test_non_terminal_without_outer_endpoint_dropped() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let packet = seal_relay_packet(
            &[hop.connection.embryo(), embryo(2)],
            remote(),
            b"too deep",
        )
        .unwrap();
        let datagram =
            encrypt_tag_layer(&hop.block.inner_key_and_nonce, 0, hop.inner, &packet).unwrap();

        assert_eq!(
            agent.process_relay(hop.from(), hop.inner, &datagram),
            RelayOutcome::Dropped(DropReason::NotEstablished)
        );
    }

    #[test]
    fn test_inward_relayed_adds_layer() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let next_endpoint = NetEndpoint::new(77, "10.0.0.2:4000".parse().unwrap());
        let setup = setup_block(&hop, next_endpoint);
        agent.process_setup_relay(1, &setup);

        // The next hop originated a reply carrying its own layer
        let next_embryo = embryo(2);
        let reply = seal_relay_packet(&[next_embryo], remote(), b"from afar").unwrap();
        let datagram = encrypt_tag_layer(&setup.outer_key_and_nonce, 77, hop.outer, &reply).unwrap();

        let impostor = NetEndpoint::new(77, "10.0.0.3:4000".parse().unwrap());
        assert_eq!(
            agent.process_relay(impostor, hop.outer, &datagram),
            RelayOutcome::Dropped(DropReason::InvalidSender)
        );

        assert!(!agent
            .process_relay(next_endpoint, hop.outer, &datagram)
            .is_dropped());
        let packet = agent.next_outbound().unwrap();
        let body = decrypt_tag_layer(&hop.block.inner_key_and_nonce, &packet.datagram).unwrap();
        let opened = open_relay_packet(&[hop.connection.embryo(), next_embryo], body).unwrap();
        assert_eq!(opened.depth, 2);
        assert_eq!(opened.header.net_address, remote());
        assert_eq!(opened.content, b"from afar");
    }

    #[test]
    fn test_next_hop_talking_directly_originates() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let next_endpoint = NetEndpoint::new(77, "10.0.0.2:4000".parse().unwrap());
        agent.process_setup_relay(1, &setup_block(&hop, next_endpoint));

        // Source id 0 from the next hop's address: the node itself, not a
        // relayed packet. No restriction applies.
        let from = NetEndpoint::new(0, next_endpoint.addr);
        let message = content(PacketType::Data, b"direct");
        let outcome = agent.process_relay(from, hop.outer, &inward(&hop, &message));
        assert_eq!(
            outcome,
            RelayOutcome::Forwarded {
                addr: hop.from().addr
            }
        );

        let packet = agent.next_outbound().unwrap();
        assert_eq!(read_relay_ids(&packet.datagram).unwrap(), (hop.inner, 0));
        let (sender, opened) = hop.open_inward(&packet.datagram);
        assert_eq!(sender, NetAddress::from_endpoint(&from));
        assert_eq!(opened, message);
    }

    #[test]
    fn test_next_hop_with_foreign_relay_id_dropped() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, true));
        let next_endpoint = NetEndpoint::new(77, "10.0.0.2:4000".parse().unwrap());
        agent.process_setup_relay(1, &setup_block(&hop, next_endpoint));

        let from = NetEndpoint::new(78, next_endpoint.addr);
        assert_eq!(
            agent.process_relay(from, hop.outer, &inward(&hop, &content(PacketType::Data, b"x"))),
            RelayOutcome::Dropped(DropReason::InvalidSender)
        );
        assert_eq!(agent.pending_sends(), 0);
    }

    #[test]
    fn test_oversized_forward_dropped() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(true, false));

        // Originating adds prefix, header, one layer and one tag layer
        let growth = RELAY_HEADER_SIZE + 2 * relaycraft_crypto::AEAD_TAG_SIZE;
        let fits = content(
            PacketType::OpenSesami,
            &vec![7u8; MAX_DATAGRAM_SIZE - RELAY_ID_PREFIX_SIZE - growth - 2],
        );
        assert!(!agent
            .process_relay(from_remote(), hop.outer, &inward(&hop, &fits))
            .is_dropped());
        assert_eq!(agent.next_outbound().unwrap().datagram.len(), MAX_DATAGRAM_SIZE);

        let too_large = content(
            PacketType::OpenSesami,
            &vec![7u8; MAX_DATAGRAM_SIZE - RELAY_ID_PREFIX_SIZE - growth - 1],
        );
        assert_eq!(
            agent.process_relay(from_remote(), hop.outer, &inward(&hop, &too_large)),
            RelayOutcome::Dropped(DropReason::TooLarge)
        );
        assert_eq!(agent.pending_sends(), 0);
    }

    #[test]
    fn test_queue_full_drops() {
        let agent = agent_with(RelayAgentConfig {
            send_queue_capacity: 1,
            ..RelayAgentConfig::default()
        });
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let datagram = hop.outward(remote(), &content(PacketType::Data, b"x"));

        assert!(!agent.process_relay(hop.from(), hop.inner, &datagram).is_dropped());
        assert_eq!(
            agent.process_relay(hop.from(), hop.inner, &datagram),
            RelayOutcome::Dropped(DropReason::QueueFull)
        );

        let sender = RecordingSender::default();
        assert_eq!(agent.process_send(&sender), 1);
        assert_eq!(sender.sent.lock()[0].0, remote().socket_addr());
        assert!(!agent.process_relay(hop.from(), hop.inner, &datagram).is_dropped());
    }

    #[test]
    fn test_clean_sweeps_closed_and_idle() {
        let agent = agent();
        let closed = Hop::assign(&agent, 1, assign_block(false, false));
        let idle = Hop::assign(&agent, 2, assign_block(false, false));
        closed.connection.close();

        assert_eq!(agent.clean(), 1);
        assert!(!agent.contains(closed.inner));
        assert!(agent.contains(idle.inner));

        let later = mics_now() + RelayAgentConfig::default().relay_retention_mics + MICS_PER_SECOND;
        assert_eq!(agent.clean_at(later), 1);
        assert_eq!(agent.exchange_count(), 0);
        assert!(idle.connection.is_closed());
    }

    #[test]
    fn test_remove_exchange_closes_connection() {
        let agent = agent();
        let hop = Hop::assign(&agent, 1, assign_block(false, false));

        assert!(agent.remove_exchange(hop.outer));
        assert!(hop.connection.is_closed());
        assert!(!agent.remove_exchange(hop.inner));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_loop_until_cancelled() {
        let agent = Arc::new(agent());
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(agent.clone().run_clean_loop(cancel_rx));

        hop.connection.close();
        tokio::time::sleep(agent.config().clean_interval + Duration::from_millis(10)).await;
        assert_eq!(agent.exchange_count(), 0);

        cancel_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_send_loop_stops_on_cancel() {
        let agent = Arc::new(agent());
        let hop = Hop::assign(&agent, 1, assign_block(false, false));
        let datagram = hop.outward(remote(), &content(PacketType::Data, b"x"));
        agent.process_relay(hop.from(), hop.inner, &datagram);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sender = Arc::new(RecordingSender::default());
        let loop_agent = agent.clone();
        let loop_sender = sender.clone();
        let handle = std::thread::spawn(move || {
            loop_agent.run_send_loop(loop_sender.as_ref(), cancel_rx);
        });

        while sender.sent.lock().is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
        cancel_tx.send(true).unwrap();
        handle.join().unwrap();
        assert_eq!(sender.sent.lock().len(), 1);
    }
}
