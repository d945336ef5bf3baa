//! The CI discovery manager (C7, §4.7): a reactor task that owns the
//! discovered-device map for one MUID, broadcasts Discovery Inquiry on an
//! interval, and tracks device lifecycle via Discovery Reply/InvalidateMUID,
//! following the same actor-per-component shape as [`crate::pe::Engine`].
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::ci::{DiscoveredDevice, CI_VERSION};
use crate::codec::{CiMessage, DiscoveryPayload};
use crate::config::EngineConfig;
use crate::muid::{MUID, BROADCAST};
use crate::transport::Transport;

/// A change to the discovered-device map (§9 "sum types over class
/// hierarchies").
#[derive(Clone, Debug)]
pub enum CIManagerEvent {
    /// A device was heard from for the first time.
    DeviceDiscovered(DiscoveredDevice),
    /// A previously known device's identity/capabilities changed.
    DeviceUpdated(DiscoveredDevice),
    /// A device was removed: InvalidateMUID, timeout, or `clear_devices()`.
    DeviceLost(MUID),
}

enum Command {
    Inbound(CiMessage),
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    ClearDevices(oneshot::Sender<()>),
    Devices(oneshot::Sender<Vec<DiscoveredDevice>>),
    Device(MUID, oneshot::Sender<Option<DiscoveredDevice>>),
}

/// The CI discovery manager for one local MUID. Cheap to share via `Arc`;
/// every public method is safe to call from any number of concurrent tasks.
pub struct Manager {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<CIManagerEvent>,
    own_muid: MUID,
}

impl Manager {
    /// Spawn the manager's reactor task. `own_identity` is the payload this
    /// node announces in its own Discovery Inquiry/Reply.
    pub fn new(
        own_muid: MUID,
        own_identity: DiscoveryPayload,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Arc<Manager> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(256);
        let reactor_events = events_tx.clone();
        tokio::spawn(reactor_task(own_muid, own_identity, transport, config, cmd_rx, reactor_events));
        Arc::new(Manager {
            cmd_tx,
            events_tx,
            own_muid,
        })
    }

    /// This manager's own MUID.
    pub fn own_muid(&self) -> MUID {
        self.own_muid
    }

    /// Subscribe to device-lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<CIManagerEvent> {
        self.events_tx.subscribe()
    }

    /// Feed one parsed inbound CI message to the manager. Messages this
    /// component doesn't act on are silently ignored.
    pub async fn handle_inbound(&self, message: CiMessage) {
        let _ = self.cmd_tx.send(Command::Inbound(message)).await;
    }

    /// Begin broadcasting Discovery Inquiry every `discovery_interval`.
    /// Idempotent.
    pub async fn start(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Start(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop broadcasting Discovery Inquiry. The discovered-device map and
    /// eviction sweep are unaffected; calling `start()` again resumes
    /// broadcasting.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Every currently known device.
    pub async fn devices(&self) -> Vec<DiscoveredDevice> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Devices(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Look up one known device by MUID.
    pub async fn device(&self, muid: MUID) -> Option<DiscoveredDevice> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Device(muid, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Remove every known device, emitting `DeviceLost` for each.
    pub async fn clear_devices(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ClearDevices(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn reactor_task(
    own_muid: MUID,
    own_identity: DiscoveryPayload,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    events_tx: broadcast::Sender<CIManagerEvent>,
) {
    let mut devices: HashMap<MUID, DiscoveredDevice> = HashMap::new();
    let mut running = false;
    let mut discovery_tick = tokio::time::interval(config.discovery_interval());
    discovery_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut eviction_tick = tokio::time::interval(config.cleanup_interval);
    eviction_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                match cmd {
                    Command::Inbound(message) => {
                        handle_inbound(message, &mut devices, &events_tx, own_muid);
                    }
                    Command::Start(ack) => {
                        running = true;
                        broadcast_inquiry(&transport, own_muid, &own_identity).await;
                        let _ = ack.send(());
                    }
                    Command::Stop(ack) => {
                        running = false;
                        let _ = ack.send(());
                    }
                    Command::ClearDevices(ack) => {
                        for (muid, _) in devices.drain() {
                            let _ = events_tx.send(CIManagerEvent::DeviceLost(muid));
                        }
                        let _ = ack.send(());
                    }
                    Command::Devices(resp) => {
                        let _ = resp.send(devices.values().cloned().collect());
                    }
                    Command::Device(muid, resp) => {
                        let _ = resp.send(devices.get(&muid).cloned());
                    }
                }
            }
            _ = discovery_tick.tick(), if running => {
                broadcast_inquiry(&transport, own_muid, &own_identity).await;
            }
            _ = eviction_tick.tick() => {
                evict_expired(&mut devices, &events_tx, config.device_timeout());
            }
        }
    }
}

async fn broadcast_inquiry(transport: &Arc<dyn Transport>, own_muid: MUID, own_identity: &DiscoveryPayload) {
    let message = CiMessage::DiscoveryInquiry {
        source: own_muid,
        dest: BROADCAST,
        ci_version: CI_VERSION,
        payload: own_identity.clone(),
    };
    let bytes = message.to_bytes();
    for destination in transport.destinations().await {
        let _ = transport.send(bytes.clone(), destination.id).await;
    }
}

fn handle_inbound(
    message: CiMessage,
    devices: &mut HashMap<MUID, DiscoveredDevice>,
    events_tx: &broadcast::Sender<CIManagerEvent>,
    own_muid: MUID,
) {
    match message {
        CiMessage::DiscoveryReply { source, dest, payload, .. } => {
            if dest != own_muid {
                return;
            }
            let device = DiscoveredDevice {
                muid: source,
                identity: payload.identity,
                category_support: payload.category_support,
                max_sysex_size: payload.max_sysex_size,
                initiator_output_path: payload.initiator_output_path,
                function_block: payload.function_block,
                last_seen: Instant::now(),
            };
            match devices.insert(source, device.clone()) {
                None => {
                    let _ = events_tx.send(CIManagerEvent::DeviceDiscovered(device));
                }
                Some(previous) => {
                    let changed = previous.identity != device.identity
                        || previous.category_support != device.category_support
                        || previous.max_sysex_size != device.max_sysex_size
                        || previous.initiator_output_path != device.initiator_output_path
                        || previous.function_block != device.function_block;
                    if changed {
                        let _ = events_tx.send(CIManagerEvent::DeviceUpdated(device));
                    }
                }
            }
        }
        CiMessage::InvalidateMuid { target, .. } => {
            if devices.remove(&target).is_some() {
                let _ = events_tx.send(CIManagerEvent::DeviceLost(target));
            } else {
                debug!(?target, "InvalidateMUID for unknown device");
            }
        }
        _ => {}
    }
}

fn evict_expired(
    devices: &mut HashMap<MUID, DiscoveredDevice>,
    events_tx: &broadcast::Sender<CIManagerEvent>,
    device_timeout: Duration,
) {
    let now = Instant::now();
    let expired: Vec<MUID> = devices
        .iter()
        .filter(|(_, device)| now.saturating_duration_since(device.last_seen) > device_timeout)
        .map(|(muid, _)| *muid)
        .collect();
    for muid in expired {
        devices.remove(&muid);
        let _ = events_tx.send(CIManagerEvent::DeviceLost(muid));
    }
}
