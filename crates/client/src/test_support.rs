//! Mock collaborators for unit tests

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use relaycraft_core::{
    AssignRelayResponse, CircuitKind, ClientConnection, EmbryoMaterial, NetAddress,
    PingRelayPacket, PingRelayResponse, RelayResult, RelayedConnectionCloser, SetupRelayBlock,
    SetupRelayResponse, MICS_PER_SECOND,
};
use tokio::sync::Notify;

pub fn assign_response(inner: u32, outer: u32) -> AssignRelayResponse {
    AssignRelayResponse {
        result: RelayResult::Success,
        inner_relay_id: inner,
        outer_relay_id: outer,
        relay_address: None,
        relay_retention_mics: 30 * MICS_PER_SECOND,
    }
}

/// Client connection to a relay at `10.1.0.<id>:5000`
pub struct MockClientConnection {
    address: NetAddress,
    embryo: EmbryoMaterial,
    closed: AtomicBool,
    /// `None` makes the RPCs undeliverable
    setup_result: Mutex<Option<RelayResult>>,
    /// One-shot answers used before `setup_result`
    queued_setup_results: Mutex<VecDeque<Option<RelayResult>>>,
    /// The next setup waits for this before answering
    setup_gate: Mutex<Option<Arc<Notify>>>,
    pub setups: Mutex<Vec<SetupRelayBlock>>,
    pub pings: AtomicUsize,
    close_log: Option<Arc<Mutex<Vec<NetAddress>>>>,
}

impl MockClientConnection {
    pub fn new(id: u8, close_log: Option<Arc<Mutex<Vec<NetAddress>>>>) -> Self {
        let addr: SocketAddr = format!("10.1.0.{}:5000", id).parse().unwrap();
        Self {
            address: NetAddress::new(0, addr),
            embryo: EmbryoMaterial {
                key: [id; 32],
                salt: id as u64 * 104_729,
                secret: [id ^ 0x5a; 16],
            },
            closed: AtomicBool::new(false),
            setup_result: Mutex::new(Some(RelayResult::Success)),
            queued_setup_results: Mutex::new(VecDeque::new()),
            setup_gate: Mutex::new(None),
            setups: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
            close_log,
        }
    }

    pub fn arc(id: u8) -> Arc<Self> {
        Arc::new(Self::new(id, None))
    }

    pub fn logged(id: u8, close_log: &Arc<Mutex<Vec<NetAddress>>>) -> Arc<Self> {
        Arc::new(Self::new(id, Some(close_log.clone())))
    }

    pub fn set_setup_result(&self, result: Option<RelayResult>) {
        *self.setup_result.lock() = result;
    }

    /// Answer the next setup with `result`, then fall back to the default
    pub fn queue_setup_result(&self, result: Option<RelayResult>) {
        self.queued_setup_results.lock().push_back(result);
    }

    /// Hold the next setup until `gate` is notified
    pub fn gate_next_setup(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.setup_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ClientConnection for MockClientConnection {
    fn destination_address(&self) -> NetAddress {
        self.address
    }

    fn embryo(&self) -> EmbryoMaterial {
        self.embryo
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(log) = &self.close_log {
                log.lock().push(self.address);
            }
        }
    }

    async fn setup_relay(&self, block: SetupRelayBlock) -> Option<SetupRelayResponse> {
        self.setups.lock().push(block);
        let gate = self.setup_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let queued = self.queued_setup_results.lock().pop_front();
        let result = queued.unwrap_or_else(|| *self.setup_result.lock())?;
        Some(SetupRelayResponse { result })
    }

    async fn ping_relay(&self, _packet: PingRelayPacket) -> Option<PingRelayResponse> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return None;
        }
        Some(PingRelayResponse {
            relay_point: 1000,
            outer_endpoint: None,
            relay_retention_mics: 30 * MICS_PER_SECOND,
        })
    }
}

#[derive(Default)]
pub struct RecordingCloser {
    pub closed: Mutex<Vec<CircuitKind>>,
}

impl RelayedConnectionCloser for RecordingCloser {
    fn close_relayed_connections(&self, kind: CircuitKind) {
        self.closed.lock().push(kind);
    }
}
