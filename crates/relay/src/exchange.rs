//! Relay exchanges
//!
//! One `RelayExchange` per hop established at this node. Exchanges live in an
//! arena keyed by a stable handle; the inner and outer relay id indices hold
//! handles, never references, and are updated together on insert/remove.

use std::collections::HashMap;
use std::sync::Arc;

use relaycraft_core::{
    AssignRelayBlock, KeyAndNonce, Mics, NetEndpoint, RelayId, ServerConnection,
};
use relaycraft_crypto::random_relay_id;
use tracing::debug;

use crate::RelayAgentConfig;

/// Stable handle of an exchange inside its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeHandle(u64);

/// Which id a packet was addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    /// Addressed to the inner id: moving away from the originator
    Outward,
    /// Addressed to the outer id: moving towards the originator
    Inward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Inner side assigned, next hop unknown (this is the outermost hop)
    AssignedInner,
    /// Next hop bound by `SetupRelay`
    Established,
}

/// Server-side record of one hop of one circuit
pub struct RelayExchange {
    inner_relay_id: RelayId,
    outer_relay_id: RelayId,
    connection: Arc<dyn ServerConnection>,
    inner_key_and_nonce: KeyAndNonce,
    outer_endpoint: Option<NetEndpoint>,
    outer_key_and_nonce: Option<KeyAndNonce>,
    relay_point: i64,
    relay_retention_mics: Mics,
    restricted_interval_mics: Mics,
    allow_open_sesami: bool,
    allow_unknown_incoming: bool,
    last_access_mics: Mics,
    last_restricted_mics: Mics,
}

impl RelayExchange {
    fn new(
        inner_relay_id: RelayId,
        outer_relay_id: RelayId,
        connection: Arc<dyn ServerConnection>,
        block: &AssignRelayBlock,
        config: &RelayAgentConfig,
        now: Mics,
    ) -> Self {
        Self {
            inner_relay_id,
            outer_relay_id,
            connection,
            inner_key_and_nonce: block.inner_key_and_nonce,
            outer_endpoint: None,
            outer_key_and_nonce: None,
            relay_point: config.default_relay_point,
            relay_retention_mics: config.relay_retention_mics,
            restricted_interval_mics: config.restricted_interval_mics,
            allow_open_sesami: block.allow_open_sesami,
            allow_unknown_incoming: block.allow_unknown_incoming,
            last_access_mics: now,
            last_restricted_mics: 0,
        }
    }

    pub fn inner_relay_id(&self) -> RelayId {
        self.inner_relay_id
    }

    pub fn outer_relay_id(&self) -> RelayId {
        self.outer_relay_id
    }

    pub fn connection(&self) -> &Arc<dyn ServerConnection> {
        &self.connection
    }

    pub fn inner_key_and_nonce(&self) -> &KeyAndNonce {
        &self.inner_key_and_nonce
    }

    pub fn outer_endpoint(&self) -> Option<NetEndpoint> {
        self.outer_endpoint
    }

    pub fn outer_key_and_nonce(&self) -> Option<&KeyAndNonce> {
        self.outer_key_and_nonce.as_ref()
    }

    pub fn relay_point(&self) -> i64 {
        self.relay_point
    }

    pub fn relay_retention_mics(&self) -> Mics {
        self.relay_retention_mics
    }

    pub fn allow_open_sesami(&self) -> bool {
        self.allow_open_sesami
    }

    pub fn allow_unknown_incoming(&self) -> bool {
        self.allow_unknown_incoming
    }

    pub fn last_access_mics(&self) -> Mics {
        self.last_access_mics
    }

    pub fn state(&self) -> ExchangeState {
        if self.outer_endpoint.is_some() {
            ExchangeState::Established
        } else {
            ExchangeState::AssignedInner
        }
    }

    pub(crate) fn bind_outer(&mut self, endpoint: NetEndpoint, key_and_nonce: KeyAndNonce) {
        self.outer_endpoint = Some(endpoint);
        self.outer_key_and_nonce = Some(key_and_nonce);
    }

    pub(crate) fn touch(&mut self, now: Mics) {
        self.last_access_mics = now;
    }

    /// Credit up to `max_point`; returns the amount actually credited
    pub(crate) fn credit(&mut self, points: i64, max_point: i64) -> i64 {
        let credited = points.min(max_point - self.relay_point).max(0);
        self.relay_point += credited;
        credited
    }

    /// Spend one point. `false` when the budget would go negative.
    fn consume_point(&mut self, now: Mics) -> bool {
        if self.relay_point <= 0 {
            return false;
        }
        self.relay_point -= 1;
        self.last_access_mics = now;
        true
    }

    /// Rate bound for unknown incoming traffic at the outermost hop
    pub(crate) fn try_admit_unknown(&mut self, now: Mics) -> bool {
        if !self.allow_unknown_incoming {
            return false;
        }
        if now - self.last_restricted_mics < self.restricted_interval_mics {
            return false;
        }
        self.last_restricted_mics = now;
        true
    }

    pub(crate) fn is_expired(&self, now: Mics) -> bool {
        self.connection.is_closed() || now - self.last_access_mics > self.relay_retention_mics
    }

    /// Close the connection the exchange shares its lifetime with
    pub(crate) fn close(self) {
        debug!(
            inner = self.inner_relay_id,
            outer = self.outer_relay_id,
            "Relay exchange removed"
        );
        self.connection.close();
    }
}

impl std::fmt::Debug for RelayExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayExchange")
            .field("inner_relay_id", &self.inner_relay_id)
            .field("outer_relay_id", &self.outer_relay_id)
            .field("outer_endpoint", &self.outer_endpoint)
            .field("relay_point", &self.relay_point)
            .finish_non_exhaustive()
    }
}

/// Exchange arena plus its relay id indices
#[derive(Default)]
pub struct ExchangeTable {
    records: HashMap<ExchangeHandle, RelayExchange>,
    by_inner: HashMap<RelayId, ExchangeHandle>,
    by_outer: HashMap<RelayId, ExchangeHandle>,
    next_handle: u64,
}

impl ExchangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `relay_id` is in use as either an inner or an outer id
    pub fn contains_id(&self, relay_id: RelayId) -> bool {
        self.by_inner.contains_key(&relay_id) || self.by_outer.contains_key(&relay_id)
    }

    fn unused_relay_id(&self) -> RelayId {
        loop {
            let id = random_relay_id();
            if !self.contains_id(id) {
                return id;
            }
        }
    }

    /// Create an exchange with two fresh ids distinct from every id in use
    pub(crate) fn create(
        &mut self,
        connection: Arc<dyn ServerConnection>,
        block: &AssignRelayBlock,
        config: &RelayAgentConfig,
        now: Mics,
    ) -> ExchangeHandle {
        let inner_relay_id = self.unused_relay_id();
        let outer_relay_id = loop {
            let id = self.unused_relay_id();
            if id != inner_relay_id {
                break id;
            }
        };

        let handle = ExchangeHandle(self.next_handle);
        self.next_handle += 1;

        let exchange =
            RelayExchange::new(inner_relay_id, outer_relay_id, connection, block, config, now);
        self.by_inner.insert(inner_relay_id, handle);
        self.by_outer.insert(outer_relay_id, handle);
        self.records.insert(handle, exchange);
        handle
    }

    pub fn find(&self, relay_id: RelayId) -> Option<(ExchangeHandle, RelayDirection)> {
        if let Some(handle) = self.by_inner.get(&relay_id) {
            return Some((*handle, RelayDirection::Outward));
        }
        self.by_outer
            .get(&relay_id)
            .map(|handle| (*handle, RelayDirection::Inward))
    }

    pub fn get(&self, handle: ExchangeHandle) -> Option<&RelayExchange> {
        self.records.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ExchangeHandle) -> Option<&mut RelayExchange> {
        self.records.get_mut(&handle)
    }

    pub fn get_by_relay_id(&self, relay_id: RelayId) -> Option<&RelayExchange> {
        let (handle, _) = self.find(relay_id)?;
        self.get(handle)
    }

    /// Evict an exchange from every index. Idempotent.
    pub(crate) fn remove(&mut self, handle: ExchangeHandle) -> Option<RelayExchange> {
        let exchange = self.records.remove(&handle)?;
        self.by_inner.remove(&exchange.inner_relay_id);
        self.by_outer.remove(&exchange.outer_relay_id);
        Some(exchange)
    }

    /// Spend one relay point. When the budget is exhausted the exchange is
    /// evicted and handed back so the caller can close it outside the lock.
    pub(crate) fn decrement_and_check(
        &mut self,
        handle: ExchangeHandle,
        now: Mics,
    ) -> Result<(), Option<RelayExchange>> {
        let Some(exchange) = self.records.get_mut(&handle) else {
            return Err(None);
        };
        if exchange.consume_point(now) {
            Ok(())
        } else {
            Err(self.remove(handle))
        }
    }

    /// Evict every exchange whose connection closed or that sat idle longer
    /// than its retention
    pub(crate) fn remove_expired(&mut self, now: Mics) -> Vec<RelayExchange> {
        let expired: Vec<ExchangeHandle> = self
            .records
            .iter()
            .filter(|(_, exchange)| exchange.is_expired(now))
            .map(|(handle, _)| *handle)
            .collect();

        expired
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelayExchange> {
        self.records.values()
    }
}
