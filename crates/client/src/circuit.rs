//! Relay circuit builder and maintainer
//!
//! A circuit grows one hop at a time. Each hop is first assigned by the
//! relay itself (`AssignRelay`, driven by the caller) and then announced to
//! the previous hop with `SetupRelay` so traffic can flow through it. Hops
//! are added one at a time and only join the chain once that announcement
//! succeeded. The encryption snapshot is republished on every chain change.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use relaycraft_core::{
    AssignRelayBlock, AssignRelayResponse, CircuitKind, ClientConnection, NetAddress, NetEndpoint,
    PingRelayPacket, RelayResult, RelayedConnectionCloser, SetupRelayBlock,
};
use relaycraft_crypto::generate_key_and_nonce;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::{DecryptedPacket, RelayKey, RelayNode, Result};

/// Client circuit configuration
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Hop cap for outgoing circuits; incoming circuits always have one hop
    pub max_serial_relays: usize,
    /// Pause between hop removals while closing
    pub close_delay: Duration,
    pub maintain_interval: Duration,
    /// Policy flags advertised to new hops
    pub allow_open_sesami: bool,
    pub allow_unknown_incoming: bool,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_serial_relays: 5,
            close_delay: Duration::from_millis(100),
            maintain_interval: Duration::from_secs(10),
            allow_open_sesami: false,
            allow_unknown_incoming: false,
        }
    }
}

/// Client-side relay circuit, one per direction
pub struct RelayCircuit {
    kind: CircuitKind,
    config: CircuitConfig,
    /// Innermost first
    nodes: Mutex<Vec<RelayNode>>,
    /// Held by `add_relay` from validation to commit
    growth: tokio::sync::Mutex<()>,
    key: RwLock<Arc<RelayKey>>,
    closer: Arc<dyn RelayedConnectionCloser>,
}

impl RelayCircuit {
    pub fn new(
        kind: CircuitKind,
        config: CircuitConfig,
        closer: Arc<dyn RelayedConnectionCloser>,
    ) -> Self {
        Self {
            kind,
            config,
            nodes: Mutex::new(Vec::new()),
            growth: tokio::sync::Mutex::new(()),
            key: RwLock::new(Arc::new(RelayKey::empty(kind))),
            closer,
        }
    }

    pub fn kind(&self) -> CircuitKind {
        self.kind
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn max_relays(&self) -> usize {
        match self.kind {
            CircuitKind::Incoming => 1,
            CircuitKind::Outgoing => self.config.max_serial_relays,
        }
    }

    pub fn number_of_relays(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Snapshot of the chain, innermost first
    pub fn nodes(&self) -> Vec<RelayNode> {
        self.nodes.lock().clone()
    }

    /// Current encryption snapshot
    pub fn relay_key(&self) -> Arc<RelayKey> {
        self.key.read().clone()
    }

    /// Address under which the outermost hop reaches us
    pub fn relayed_address(&self) -> Option<NetAddress> {
        self.nodes.lock().last().map(RelayNode::outer_address)
    }

    pub fn try_encrypt(
        &self,
        relay_number: i32,
        destination: NetAddress,
        content: &[u8],
    ) -> Result<Vec<u8>> {
        self.relay_key().try_encrypt(relay_number, destination, content)
    }

    pub fn try_decrypt(
        &self,
        endpoint: &NetEndpoint,
        datagram: &[u8],
    ) -> Option<DecryptedPacket> {
        self.relay_key().try_decrypt(endpoint, datagram)
    }

    /// Negotiation payload for the next hop
    pub fn new_assign_relay_block(&self) -> AssignRelayBlock {
        AssignRelayBlock {
            inner_key_and_nonce: generate_key_and_nonce(),
            allow_open_sesami: self.config.allow_open_sesami,
            allow_unknown_incoming: self.config.allow_unknown_incoming,
        }
    }

    /// Whether `add_relay` would accept this hop. No side effects.
    pub fn can_add_relay(
        &self,
        response: &AssignRelayResponse,
        connection: &dyn ClientConnection,
    ) -> RelayResult {
        self.validate(&self.nodes.lock(), response, connection)
    }

    fn validate(
        &self,
        nodes: &[RelayNode],
        response: &AssignRelayResponse,
        connection: &dyn ClientConnection,
    ) -> RelayResult {
        if !response.result.is_success() {
            return response.result;
        }
        if nodes.len() >= self.max_relays() {
            return RelayResult::SerialRelayLimit;
        }
        if response.inner_relay_id == 0 || response.outer_relay_id == 0 {
            return RelayResult::InvalidEndpoint;
        }

        let addr = RelayNode::resolve_address(response, connection).socket_addr();
        if nodes.iter().any(|node| node.endpoint().addr == addr) {
            return RelayResult::DuplicateEndpoint;
        }

        let ids = [response.inner_relay_id, response.outer_relay_id];
        let duplicate_id = response.inner_relay_id == response.outer_relay_id
            || nodes.iter().any(|node| {
                ids.contains(&node.inner_relay_id()) || ids.contains(&node.outer_relay_id())
            });
        if duplicate_id {
            return RelayResult::DuplicateRelayId;
        }

        RelayResult::Success
    }

    /// Append a hop assigned by `connection`'s relay and announce it to the
    /// previous hop.
    ///
    /// Hops are added one at a time. The hop joins the chain, and the key
    /// snapshot, only once the previous hop accepted it; otherwise its
    /// connection is closed and the chain is left as it was. If `close` or
    /// `clean` cut the chain while the announcement was in flight, the hop is
    /// dropped with `ConnectionFailure`.
    pub async fn add_relay(
        &self,
        block: AssignRelayBlock,
        response: AssignRelayResponse,
        connection: Arc<dyn ClientConnection>,
        cancel: &watch::Receiver<bool>,
    ) -> RelayResult {
        let _growing = self.growth.lock().await;

        let (previous, node) = {
            let nodes = self.nodes.lock();
            let result = self.validate(&nodes, &response, connection.as_ref());
            if !result.is_success() {
                debug!(kind = ?self.kind, %result, "Relay refused");
                return result;
            }
            (
                nodes.last().cloned(),
                RelayNode::new(&block, &response, connection),
            )
        };

        if let Some(previous) = &previous {
            let setup = SetupRelayBlock {
                inner_relay_id: previous.inner_relay_id(),
                outer_endpoint: node.endpoint(),
                outer_key_and_nonce: *node.inner_key_and_nonce(),
            };
            let mut cancel = cancel.clone();
            let response = tokio::select! {
                response = previous.connection().setup_relay(setup) => response,
                _ = cancelled(&mut cancel) => None,
            };

            let result = match response {
                Some(response) if response.result.is_success() => RelayResult::Success,
                Some(_) => RelayResult::InvalidEndpoint,
                None => RelayResult::ConnectionFailure,
            };
            if !result.is_success() {
                warn!(
                    kind = ?self.kind,
                    endpoint = %node.endpoint(),
                    %result,
                    "Relay setup failed"
                );
                node.connection().close();
                return result;
            }
        }

        let committed = {
            let mut nodes = self.nodes.lock();
            let unchanged =
                nodes.last().map(RelayNode::endpoint) == previous.as_ref().map(RelayNode::endpoint);
            if unchanged {
                nodes.push(node.clone());
                self.publish_key(&nodes);
            }
            unchanged.then_some(nodes.len())
        };
        let Some(count) = committed else {
            warn!(
                kind = ?self.kind,
                endpoint = %node.endpoint(),
                "Circuit changed during relay setup, dropping relay"
            );
            node.connection().close();
            return RelayResult::ConnectionFailure;
        };

        info!(
            kind = ?self.kind,
            relays = count,
            endpoint = %node.endpoint(),
            "Relay added"
        );
        RelayResult::Success
    }

    /// Must be called with the node lock held
    fn publish_key(&self, nodes: &[RelayNode]) {
        *self.key.write() = Arc::new(RelayKey::new(self.kind, nodes));
    }

    /// Tear the circuit down outermost first, pausing `close_delay` between
    /// hops. Cancellation skips the remaining pauses but still closes every
    /// hop.
    pub async fn close(&self, cancel: &watch::Receiver<bool>) {
        let nodes = self.nodes();
        if !nodes.is_empty() {
            info!(kind = ?self.kind, relays = nodes.len(), "Closing relay circuit");
        }

        let mut cancel = cancel.clone();
        let mut skip_delay = self.config.close_delay.is_zero();
        for (index, node) in nodes.iter().enumerate().rev() {
            {
                let mut current = self.nodes.lock();
                current.truncate(index);
                self.publish_key(&current);
            }
            node.connection().close();
            debug!(kind = ?self.kind, endpoint = %node.endpoint(), "Relay removed");

            if index > 0 && !skip_delay {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.close_delay) => {}
                    _ = cancelled(&mut cancel) => skip_delay = true,
                }
            }
        }

        {
            let mut current = self.nodes.lock();
            current.clear();
            self.publish_key(&current);
        }
        self.closer.close_relayed_connections(self.kind);
    }

    /// Drop hops whose connection died. Every hop beyond a dead one is
    /// unreachable, so the chain is cut at the first dead hop.
    pub fn clean(&self) -> usize {
        let removed = {
            let mut nodes = self.nodes.lock();
            let Some(dead) = nodes.iter().position(|node| !node.is_alive()) else {
                return 0;
            };
            let removed = nodes.split_off(dead);
            self.publish_key(&nodes);
            removed
        };

        for node in &removed {
            node.connection().close();
        }
        info!(
            kind = ?self.kind,
            removed = removed.len(),
            "Dropped dead relays"
        );
        removed.len()
    }

    /// Ping every hop so the relays keep their exchanges alive. Returns the
    /// number of hops that answered.
    pub async fn maintain(&self, cancel: &watch::Receiver<bool>) -> usize {
        let mut cancel = cancel.clone();
        let mut answered = 0;

        for node in self.nodes() {
            let packet = PingRelayPacket {
                inner_relay_id: node.inner_relay_id(),
            };
            let response = tokio::select! {
                response = node.connection().ping_relay(packet) => response,
                _ = cancelled(&mut cancel) => break,
            };

            match response {
                Some(response) => {
                    answered += 1;
                    trace!(
                        endpoint = %node.endpoint(),
                        relay_point = response.relay_point,
                        "Relay ping answered"
                    );
                }
                None => debug!(endpoint = %node.endpoint(), "Relay ping unanswered"),
            }
        }
        answered
    }

    /// Run `clean` and `maintain` every `maintain_interval` until cancelled
    pub async fn run_maintenance_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.maintain_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.clean();
                    self.maintain(&cancel).await;
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(kind = ?self.kind, "Relay maintenance loop stopped");
    }
}

/// Resolves once `cancel` turns true; never if its sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
