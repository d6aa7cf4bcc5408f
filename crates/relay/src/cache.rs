//! Endpoint cache for relay exits
//!
//! Caches logical address -> transport endpoint resolutions together with the
//! endpoint's restriction state. Every entry starts restricted; an outbound
//! connection packet through the exit unrestricts it for a retention window.

use hashlink::LruCache;
use relaycraft_core::{EndpointResolver, Mics, NetAddress, NetEndpoint};

/// Default maximum cache size
const DEFAULT_CAPACITY: usize = 1000;

/// A cached endpoint entry
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    endpoint: NetEndpoint,
    /// Inbound traffic is accepted until this time
    unrestricted_until: Mics,
}

/// Bounded LRU cache of resolved endpoints.
///
/// Not synchronized; the relay agent only touches it under its state lock.
pub struct EndpointCache {
    entries: LruCache<NetAddress, CacheEntry>,
}

impl EndpointCache {
    /// Create a new endpoint cache with default settings
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(capacity.max(1)),
        }
    }

    /// Resolve `address`, consulting the cache first. A newly resolved
    /// endpoint is cached restricted; on overflow the least recently touched
    /// entry is evicted.
    pub fn get_endpoint(
        &mut self,
        address: &NetAddress,
        resolver: &dyn EndpointResolver,
    ) -> Option<NetEndpoint> {
        if let Some(entry) = self.entries.get(address) {
            return Some(entry.endpoint);
        }

        let endpoint = resolver.try_create_endpoint(address)?;
        self.entries.insert(
            *address,
            CacheEntry {
                endpoint,
                unrestricted_until: 0,
            },
        );
        Some(endpoint)
    }

    /// Accept inbound traffic from `address` until `until`
    pub fn unrestrict(&mut self, address: &NetAddress, until: Mics) -> bool {
        match self.entries.get_mut(address) {
            Some(entry) => {
                entry.unrestricted_until = entry.unrestricted_until.max(until);
                true
            }
            None => false,
        }
    }

    /// Whether inbound traffic from `address` is currently accepted.
    /// Unknown addresses are restricted.
    pub fn is_unrestricted(&mut self, address: &NetAddress, now: Mics) -> bool {
        self.entries
            .get(address)
            .map(|entry| now < entry.unrestricted_until)
            .unwrap_or(false)
    }

    pub fn contains(&self, address: &NetAddress) -> bool {
        self.entries.peek(address).is_some()
    }

    /// Get the number of entries in the cache
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for EndpointCache {
    fn default() -> Self {
        Self::new()
    }
}
