//! The transport contract (C9, §6.1): the only interface this crate uses to
//! reach the host's actual MIDI I/O. Endpoint enumeration, packet I/O, and
//! BLE-specific timing heuristics live on the other side of this trait —
//! this crate only consumes it.
//!
//! [`MockTransport`] is the reference implementation used by this crate's
//! own test suite (and exported for host applications' tests), grounded in
//! the pack's recurring "fake peer that speaks the real wire format"
//! pattern (the echo/delayed/reordering routers in `hooteproto`'s test
//! suite).
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Opaque handle to a transport endpoint (a MIDI source or destination).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId(pub String);

impl EndpointId {
    /// Construct an endpoint id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        EndpointId(id.into())
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A MIDI source endpoint the transport can receive from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    /// The endpoint's id.
    pub id: EndpointId,
    /// A host-facing display name.
    pub name: String,
}

/// A MIDI destination endpoint the transport can send to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestInfo {
    /// The endpoint's id.
    pub id: EndpointId,
    /// A host-facing display name.
    pub name: String,
}

/// One inbound delivery from the transport: raw bytes (whole or fragmented
/// SysEx) plus which source they arrived on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedPacket {
    /// The raw bytes delivered in this packet.
    pub data: Vec<u8>,
    /// The source endpoint this packet arrived on.
    pub source_id: EndpointId,
}

/// Coarse classification of the underlying transport, used to stretch PE
/// timeouts on links with high and variable latency (§6.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportType {
    /// USB MIDI.
    Usb,
    /// Bluetooth LE MIDI. Implies an implementation-defined timeout
    /// multiplier.
    Ble,
    /// Network MIDI (e.g. RTP-MIDI).
    Network,
    /// An in-process virtual endpoint.
    Virtual,
    /// Anything else, or unknown.
    Unknown,
}

/// Failures a transport operation can report.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport's underlying send call failed.
    #[error("send failed (code {0})")]
    SendFailed(i32),
    /// The destination endpoint id is not known to this transport.
    #[error("endpoint not found")]
    EndpointNotFound,
    /// The transport has no live connection to send over.
    #[error("not connected")]
    NotConnected,
    /// Removing a virtual endpoint that doesn't exist.
    #[error("virtual endpoint not found: {0}")]
    VirtualEndpointNotFound(EndpointId),
    /// The transport doesn't implement this optional capability.
    #[error("unsupported transport capability: {0}")]
    Unsupported(&'static str),
}

/// The capability this crate's engine, discovery manager, and reassembler
/// consume to do MIDI I/O. Implemented by the host application over its own
/// OS/hardware MIDI stack; [`MockTransport`] is the in-memory reference
/// implementation used for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enumerate currently visible source endpoints.
    async fn sources(&self) -> Vec<SourceInfo>;

    /// Enumerate currently visible destination endpoints.
    async fn destinations(&self) -> Vec<DestInfo>;

    /// Send raw bytes to a destination endpoint.
    async fn send(&self, bytes: Vec<u8>, destination_id: EndpointId) -> Result<(), TransportError>;

    /// Subscribe to inbound packets. Multiple subscribers may be active at
    /// once (the orchestrator's receive loop is typically the only one);
    /// delivery is at-least-once and ordering within one source endpoint is
    /// preserved.
    fn subscribe(&self) -> broadcast::Receiver<ReceivedPacket>;

    /// This transport's coarse classification.
    fn transport_type(&self) -> TransportType {
        TransportType::Unknown
    }

    /// Create a virtual source endpoint (optional capability).
    async fn create_virtual_source(&self, _name: &str) -> Result<EndpointId, TransportError> {
        Err(TransportError::Unsupported("create_virtual_source"))
    }

    /// Create a virtual destination endpoint (optional capability).
    async fn create_virtual_destination(&self, _name: &str) -> Result<EndpointId, TransportError> {
        Err(TransportError::Unsupported("create_virtual_destination"))
    }

    /// Remove a previously created virtual source.
    async fn remove_virtual_source(&self, id: EndpointId) -> Result<(), TransportError> {
        Err(TransportError::VirtualEndpointNotFound(id))
    }

    /// Remove a previously created virtual destination.
    async fn remove_virtual_destination(&self, id: EndpointId) -> Result<(), TransportError> {
        Err(TransportError::VirtualEndpointNotFound(id))
    }

    /// Inject bytes as if sent by a virtual source endpoint this transport
    /// owns.
    async fn send_from_virtual_source(
        &self,
        _bytes: Vec<u8>,
        _source_id: EndpointId,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("send_from_virtual_source"))
    }
}

struct MockState {
    sources: Vec<SourceInfo>,
    destinations: Vec<DestInfo>,
    virtual_sources: HashSet<EndpointId>,
    virtual_destinations: HashSet<EndpointId>,
    sent: Vec<(Vec<u8>, EndpointId)>,
}

/// In-memory [`Transport`] implementation. Sends are recorded for
/// assertions; [`MockTransport::inject`] simulates an inbound delivery from
/// a given source, which is how tests script device replies.
pub struct MockTransport {
    state: Mutex<MockState>,
    received_tx: broadcast::Sender<ReceivedPacket>,
    virtual_counter: AtomicU64,
    transport_type: TransportType,
}

impl MockTransport {
    /// Construct an empty mock transport with no pre-registered endpoints.
    pub fn new() -> Arc<Self> {
        Self::with_transport_type(TransportType::Virtual)
    }

    /// Construct a mock transport that reports the given [`TransportType`]
    /// (useful for exercising BLE timeout-multiplier behavior in tests).
    pub fn with_transport_type(transport_type: TransportType) -> Arc<Self> {
        let (received_tx, _) = broadcast::channel(1024);
        Arc::new(MockTransport {
            state: Mutex::new(MockState {
                sources: Vec::new(),
                destinations: Vec::new(),
                virtual_sources: HashSet::new(),
                virtual_destinations: HashSet::new(),
                sent: Vec::new(),
            }),
            received_tx,
            virtual_counter: AtomicU64::new(0),
            transport_type,
        })
    }

    /// Register a fixed (non-virtual) source/destination pair representing
    /// one device endpoint, as a test fixture would at setup time.
    pub async fn register_device(&self, id: &str, name: &str) {
        let endpoint = EndpointId::new(id);
        let mut state = self.state.lock().await;
        state.sources.push(SourceInfo {
            id: endpoint.clone(),
            name: name.to_string(),
        });
        state.destinations.push(DestInfo {
            id: endpoint,
            name: name.to_string(),
        });
    }

    /// Simulate an inbound delivery from `source_id`, as if the underlying
    /// hardware had received it. Fragmentation is the caller's
    /// responsibility: pass a whole packet or a fragment, same as a real
    /// transport would deliver.
    pub fn inject(&self, data: Vec<u8>, source_id: EndpointId) {
        let _ = self.received_tx.send(ReceivedPacket { data, source_id });
    }

    /// Every message sent so far, in send order.
    pub async fn sent_messages(&self) -> Vec<(Vec<u8>, EndpointId)> {
        self.state.lock().await.sent.clone()
    }

    /// Clear the record of sent messages.
    pub async fn clear_sent(&self) {
        self.state.lock().await.sent.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn sources(&self) -> Vec<SourceInfo> {
        self.state.lock().await.sources.clone()
    }

    async fn destinations(&self) -> Vec<DestInfo> {
        self.state.lock().await.destinations.clone()
    }

    async fn send(&self, bytes: Vec<u8>, destination_id: EndpointId) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let known = state.destinations.iter().any(|d| d.id == destination_id)
            || state.virtual_destinations.contains(&destination_id);
        if !known {
            return Err(TransportError::EndpointNotFound);
        }
        state.sent.push((bytes, destination_id));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ReceivedPacket> {
        self.received_tx.subscribe()
    }

    fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    async fn create_virtual_source(&self, name: &str) -> Result<EndpointId, TransportError> {
        let n = self.virtual_counter.fetch_add(1, Ordering::Relaxed);
        let id = EndpointId::new(format!("virtual-src-{n}"));
        let mut state = self.state.lock().await;
        state.virtual_sources.insert(id.clone());
        state.sources.push(SourceInfo {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn create_virtual_destination(&self, name: &str) -> Result<EndpointId, TransportError> {
        let n = self.virtual_counter.fetch_add(1, Ordering::Relaxed);
        let id = EndpointId::new(format!("virtual-dst-{n}"));
        let mut state = self.state.lock().await;
        state.virtual_destinations.insert(id.clone());
        state.destinations.push(DestInfo {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn remove_virtual_source(&self, id: EndpointId) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if !state.virtual_sources.remove(&id) {
            return Err(TransportError::VirtualEndpointNotFound(id));
        }
        state.sources.retain(|s| s.id != id);
        Ok(())
    }

    async fn remove_virtual_destination(&self, id: EndpointId) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if !state.virtual_destinations.remove(&id) {
            return Err(TransportError::VirtualEndpointNotFound(id));
        }
        state.destinations.retain(|d| d.id != id);
        Ok(())
    }

    async fn send_from_virtual_source(
        &self,
        bytes: Vec<u8>,
        source_id: EndpointId,
    ) -> Result<(), TransportError> {
        let state = self.state.lock().await;
        if !state.virtual_sources.contains(&source_id) {
            return Err(TransportError::VirtualEndpointNotFound(source_id));
        }
        drop(state);
        self.inject(bytes, source_id);
        Ok(())
    }
}
