//! Mock collaborators for unit tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use relaycraft_core::{
    EmbryoMaterial, EndpointResolver, NetAddress, NetEndpoint, PacketSender, ServerConnection,
};

pub fn embryo(seed: u8) -> EmbryoMaterial {
    EmbryoMaterial {
        key: [seed; 32],
        salt: seed as u64 * 7919,
        secret: [seed.wrapping_add(1); 16],
    }
}

pub struct MockServerConnection {
    id: u64,
    endpoint: NetEndpoint,
    embryo: EmbryoMaterial,
    closed: AtomicBool,
}

impl MockServerConnection {
    pub fn new(id: u64, endpoint: NetEndpoint, embryo: EmbryoMaterial) -> Self {
        Self {
            id,
            endpoint,
            embryo,
            closed: AtomicBool::new(false),
        }
    }

    /// Direct (not relayed) peer at `10.0.0.<id>:4000`
    pub fn arc(id: u64) -> Arc<Self> {
        let addr: SocketAddr = format!("10.0.0.{}:4000", id % 250).parse().unwrap();
        Arc::new(Self::new(id, NetEndpoint::new(0, addr), embryo(id as u8)))
    }
}

impl ServerConnection for MockServerConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn destination_endpoint(&self) -> NetEndpoint {
        self.endpoint
    }

    fn embryo(&self) -> EmbryoMaterial {
        self.embryo
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Resolves every address to its own socket address
pub struct MockResolver {
    fail: bool,
    calls: AtomicUsize,
}

impl MockResolver {
    pub fn new() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EndpointResolver for MockResolver {
    fn try_create_endpoint(&self, address: &NetAddress) -> Option<NetEndpoint> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return None;
        }
        Some(NetEndpoint::new(address.relay_id, address.socket_addr()))
    }
}

/// Records every datagram handed to it
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl PacketSender for RecordingSender {
    fn send(&self, addr: &SocketAddr, datagram: &[u8]) {
        self.sent.lock().push((*addr, datagram.to_vec()));
    }
}
