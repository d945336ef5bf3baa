//! The orchestrator façade (C8, §4.8): composes [`crate::pe::Engine`] and
//! [`crate::discovery::Manager`] behind one MUID, owns the single receive
//! loop that demultiplexes transport packets to them, and adds typed
//! helpers for the well-known PE resources.
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::codec::{CiMessage, DiscoveryPayload};
use crate::config::EngineConfig;
use crate::discovery::{CIManagerEvent, Manager};
use crate::error::PEError;
use crate::muid::{new_muid, MUID};
use crate::pe::{DeviceHandle, Engine, Notification, PeRequest, PeResponse};
use crate::sysex::SysexReassembler;
use crate::transport::Transport;

/// A fused event from either the discovery manager or the PE engine's
/// notification stream, as delivered by [`Orchestrator::events`].
#[derive(Clone, Debug)]
pub enum OrchestratorEvent {
    /// A discovery-manager lifecycle event.
    Device(CIManagerEvent),
    /// A PE subscription notification.
    Notification(Notification),
}

/// Composes the PE engine and discovery manager for one local MUID and
/// drives the single background task that feeds both from the transport.
pub struct Orchestrator {
    pe: Arc<Engine>,
    discovery: Arc<Manager>,
    transport: Arc<dyn Transport>,
    own_muid: MUID,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an orchestrator over `transport`, generating a fresh MUID and
    /// announcing `own_identity` in this node's own Discovery Inquiry.
    pub fn new(transport: Arc<dyn Transport>, own_identity: DiscoveryPayload, config: EngineConfig) -> Arc<Orchestrator> {
        let own_muid = new_muid();
        let pe = Engine::new(own_muid, transport.clone(), config.clone());
        let discovery = Manager::new(own_muid, own_identity, transport.clone(), config);
        Arc::new(Orchestrator {
            pe,
            discovery,
            transport,
            own_muid,
            receive_task: Mutex::new(None),
        })
    }

    /// This node's MUID.
    pub fn own_muid(&self) -> MUID {
        self.own_muid
    }

    /// The underlying PE transaction engine.
    pub fn pe(&self) -> &Arc<Engine> {
        &self.pe
    }

    /// The underlying discovery manager.
    pub fn discovery(&self) -> &Arc<Manager> {
        &self.discovery
    }

    /// Start the background receive loop and begin Discovery Inquiry
    /// broadcasting. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        self.discovery.start().await;
        let mut guard = self.receive_task.lock().await;
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        *guard = Some(tokio::spawn(async move { this.receive_loop().await }));
    }

    /// Stop the receive loop, Discovery Inquiry broadcasting, and the PE
    /// engine's in-flight transactions. The transport itself is left
    /// running; `start()` may be called again afterward.
    pub async fn stop(&self) {
        self.discovery.stop().await;
        self.pe.stop().await;
        let mut guard = self.receive_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    /// A fused stream of discovery events and PE notifications. Each call
    /// returns an independent receiver; none observe events sent before
    /// they subscribed.
    pub fn events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        let (tx, rx) = broadcast::channel(256);
        let mut device_events = self.discovery.events();
        let device_tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = device_events.recv().await {
                if device_tx.send(OrchestratorEvent::Device(event)).is_err() {
                    break;
                }
            }
        });
        let mut notifications = self.pe.notifications();
        tokio::spawn(async move {
            while let Ok(notification) = notifications.recv().await {
                if tx.send(OrchestratorEvent::Notification(notification)).is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut packets = self.transport.subscribe();
        let mut reassembler = SysexReassembler::new();
        loop {
            match packets.recv().await {
                Ok(packet) => {
                    for frame in reassembler.feed(&packet.data) {
                        match CiMessage::from_bytes(&frame) {
                            Some(message) => self.dispatch(message).await,
                            None => trace!(len = frame.len(), "dropping malformed CI frame"),
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "receive loop lagged behind the transport's packet stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn dispatch(&self, message: CiMessage) {
        let dest = message.dest();
        if dest != self.own_muid && !dest.is_broadcast() {
            return;
        }
        match &message {
            CiMessage::DiscoveryInquiry { .. }
            | CiMessage::DiscoveryReply { .. }
            | CiMessage::InvalidateMuid { .. } => self.discovery.handle_inbound(message).await,
            CiMessage::Nak { .. }
            | CiMessage::PeGetReply { .. }
            | CiMessage::PeSetReply { .. }
            | CiMessage::PeSubscribeReply { .. }
            | CiMessage::PeNotify { .. } => self.pe.handle_inbound(message).await,
            _ => {}
        }
    }

    /// Read and typed-decode the standard `DeviceInfo` resource.
    pub async fn get_device_info(&self, device: DeviceHandle, timeout: Duration) -> Result<DeviceInfo, PEError> {
        self.get_typed("DeviceInfo", device, timeout).await
    }

    /// Read and typed-decode the standard `ResourceList` resource.
    pub async fn get_resource_list(&self, device: DeviceHandle, timeout: Duration) -> Result<ResourceList, PEError> {
        self.get_typed("ResourceList", device, timeout).await
    }

    /// Read and typed-decode the standard `ChannelList` resource.
    pub async fn get_channel_list(&self, device: DeviceHandle, timeout: Duration) -> Result<ChannelList, PEError> {
        self.get_typed("ChannelList", device, timeout).await
    }

    /// Read and typed-decode the standard `ProgramList` resource.
    pub async fn get_program_list(&self, device: DeviceHandle, timeout: Duration) -> Result<ProgramList, PEError> {
        self.get_typed("ProgramList", device, timeout).await
    }

    async fn get_typed<T: for<'de> Deserialize<'de>>(
        &self,
        resource: &str,
        device: DeviceHandle,
        timeout: Duration,
    ) -> Result<T, PEError> {
        let response = self.pe.get(PeRequest::get(resource, timeout), device).await?;
        if response.body.is_empty() {
            return Err(PEError::EmptyResponse {
                resource: resource.to_string(),
            });
        }
        serde_json::from_slice(&response.body).map_err(|e| PEError::InvalidResponse {
            reason: format!("{resource} did not decode: {e}"),
        })
    }
}

/// The standard `DeviceInfo` resource (§4.8). Unknown fields are ignored
/// rather than rejected, matching this crate's lenient-decode posture.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceInfo {
    /// Manufacturer display name, when the device reports one.
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Product family display name.
    #[serde(default)]
    pub family: Option<String>,
    /// Model display name.
    #[serde(default)]
    pub model: Option<String>,
    /// Firmware/software version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Every other field the device reported, preserved structurally.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One entry of the standard `ResourceList` resource.
#[derive(Clone, Debug, Deserialize)]
pub struct ResourceListEntry {
    /// The resource's name.
    pub resource: String,
    /// Whether the device supports Get on this resource.
    #[serde(default)]
    pub can_get: bool,
    /// Whether/how the device supports Set on this resource (`"full"`,
    /// `"partial"`, or absent).
    #[serde(default)]
    pub can_set: Option<String>,
    /// Whether the device supports Subscribe on this resource.
    #[serde(default)]
    pub can_subscribe: bool,
}

/// The standard `ResourceList` resource: every PE resource the device
/// exposes.
pub type ResourceList = Vec<ResourceListEntry>;

/// One channel entry of the standard `ChannelList` resource.
#[derive(Clone, Debug, Deserialize)]
pub struct ChannelListEntry {
    /// The MIDI channel index this entry describes.
    pub channel: u16,
    /// Display name for the channel, if the device provides one.
    #[serde(default)]
    pub name: Option<String>,
}

/// The standard `ChannelList` resource.
pub type ChannelList = Vec<ChannelListEntry>;

/// One bank-select/program-change entry of the standard `ProgramList`
/// resource, tolerating the vendor `bankPC: [msb, lsb, program]` array
/// shape in addition to the standard `{bankPC, bankCC, program}`
/// named-field shape (§4.8, §9).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawProgramEntry")]
pub struct ProgramListEntry {
    /// Display name of the program.
    pub title: Option<String>,
    /// Bank-select MSB (the `bankPC` field in named form), `0..=255` as
    /// reported — out-of-range values are not rejected at decode time.
    pub bank_msb: Option<u8>,
    /// Bank-select LSB (the `bankCC` field in named form).
    pub bank_lsb: Option<u8>,
    /// Program-change number.
    pub program: Option<u8>,
}

/// The raw JSON shape `ProgramListEntry` decodes from before reconciling
/// `bankPC`'s two observed shapes.
#[derive(Deserialize)]
struct RawProgramEntry {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    #[serde(rename = "bankPC")]
    bank_pc: Option<BankPc>,
    #[serde(default)]
    #[serde(rename = "bankCC")]
    bank_cc: Option<u8>,
    #[serde(default)]
    program: Option<u8>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BankPc {
    /// The standard named form: `bankPC` is the bank MSB alone.
    Value(u8),
    /// The vendor array form: `bankPC: [msb, lsb, program]`.
    Triple(Vec<u8>),
}

impl TryFrom<RawProgramEntry> for ProgramListEntry {
    type Error = std::convert::Infallible;

    fn try_from(raw: RawProgramEntry) -> Result<Self, Self::Error> {
        let (mut bank_msb, mut bank_lsb, mut program_from_array) = (None, raw.bank_cc, None);
        match raw.bank_pc {
            Some(BankPc::Value(msb)) => bank_msb = Some(msb),
            Some(BankPc::Triple(values)) => {
                // Empty arrays do not zero-fill; a present-but-short array
                // fills only the positions it actually carries.
                bank_msb = values.first().copied();
                bank_lsb = values.get(1).copied().or(bank_lsb);
                program_from_array = values.get(2).copied();
            }
            None => {}
        }
        // An explicit `program` key always wins over the array's third
        // element, even when that element is literally 0.
        let program = raw.program.or(program_from_array);
        Ok(ProgramListEntry {
            title: raw.title,
            bank_msb,
            bank_lsb,
            program,
        })
    }
}

/// The standard `ProgramList` resource.
pub type ProgramList = Vec<ProgramListEntry>;
