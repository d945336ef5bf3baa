//! The Property Exchange transaction engine (C6, §3, §4.6, §9): a
//! reactor task owning the request-ID pool, in-flight transactions, chunk
//! assemblers, and live subscriptions for one MUID, grounded in
//! `hooteproto::client`'s `reactor_task`/`ReactorCommand`/`PendingRequest`
//! pattern and generalized from a single request map to the PE-specific
//! concerns (chunked bodies, NAK classification, subscriptions).
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Semaphore};
use tracing::{debug, trace, warn};

use crate::chunk::{ChunkAssembler, ChunkResult};
use crate::ci::CI_VERSION;
use crate::codec::{CiMessage, PeChunkPayload};
use crate::config::EngineConfig;
use crate::error::PEError;
use crate::muid::MUID;
use crate::reqid::RequestIdPool;
use crate::transport::Transport;

use super::header;
use super::request::{
    BatchOptions, BatchSetItem, DeviceHandle, Notification, PeOperation, PeRequest, PeResponse,
    Subscription,
};

/// Diagnostic snapshot of engine state, mainly useful for tests asserting
/// that `stop()` actually released everything (§8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineStats {
    /// Request-ID slots neither occupied nor cooling.
    pub available_ids: usize,
    /// Transactions currently awaiting a reply.
    pub pending_transactions: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
}

enum Command {
    Send {
        corr: u64,
        operation: PeOperation,
        request: PeRequest,
        device: DeviceHandle,
        resp: oneshot::Sender<Result<PeResponse, PEError>>,
    },
    Unsubscribe {
        corr: u64,
        subscribe_id: String,
        timeout: Duration,
        resp: oneshot::Sender<Result<PeResponse, PEError>>,
    },
    Cancel(u64),
    Inbound(CiMessage),
    Stats(oneshot::Sender<EngineStats>),
    Stop(oneshot::Sender<()>),
}

struct Transaction {
    request_id: u8,
    operation: PeOperation,
    resource: String,
    device: DeviceHandle,
    deadline: Instant,
    resp: Option<oneshot::Sender<Result<PeResponse, PEError>>>,
    unsubscribe_target: Option<String>,
}

/// Best-effort cooperative cancellation: if the future awaiting a PE
/// transaction is dropped before it resolves (caller timeout, request
/// cancelled, select! lost a race), this tells the reactor to free the
/// transaction's request ID and stop waiting on it.
struct CancelGuard {
    cmd_tx: mpsc::Sender<Command>,
    corr: Option<u64>,
}

impl CancelGuard {
    fn disarm(&mut self) {
        self.corr = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(corr) = self.corr.take() {
            let _ = self.cmd_tx.try_send(Command::Cancel(corr));
        }
    }
}

/// The Property Exchange transaction engine for one local MUID. Cheap to
/// clone-share via `Arc`; every public method is safe to call from any
/// number of concurrent tasks.
pub struct Engine {
    cmd_tx: mpsc::Sender<Command>,
    device_semaphores: Mutex<HashMap<MUID, Arc<Semaphore>>>,
    max_inflight_per_device: usize,
    next_correlation: AtomicU64,
    notifications_tx: broadcast::Sender<Notification>,
}

impl Engine {
    /// Spawn the engine's reactor task and return a shared handle to it.
    /// `own_muid` is this node's MUID, shared with its
    /// [`crate::discovery::Manager`].
    pub fn new(own_muid: MUID, transport: Arc<dyn Transport>, config: EngineConfig) -> Arc<Engine> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (notifications_tx, _) = broadcast::channel(256);
        let reactor_notifications = notifications_tx.clone();
        let max_inflight_per_device = config.max_inflight_per_device();
        tokio::spawn(reactor_task(own_muid, transport, config, cmd_rx, reactor_notifications));
        Arc::new(Engine {
            cmd_tx,
            device_semaphores: Mutex::new(HashMap::new()),
            max_inflight_per_device,
            next_correlation: AtomicU64::new(0),
            notifications_tx,
        })
    }

    /// Feed one parsed inbound CI message to the engine. Non-PE messages
    /// are silently ignored; called from the orchestrator's single receive
    /// loop.
    pub async fn handle_inbound(&self, message: CiMessage) {
        let _ = self.cmd_tx.send(Command::Inbound(message)).await;
    }

    /// Subscribe to notifications delivered across every live subscription
    /// this engine holds (§4.6, point 4).
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications_tx.subscribe()
    }

    /// Read a resource.
    pub async fn get(&self, request: PeRequest, device: DeviceHandle) -> Result<PeResponse, PEError> {
        self.dispatch(PeOperation::Get, request, device).await
    }

    /// Write a resource.
    pub async fn set(&self, request: PeRequest, device: DeviceHandle) -> Result<PeResponse, PEError> {
        self.dispatch(PeOperation::Set, request, device).await
    }

    /// Subscribe to a resource's change notifications.
    pub async fn subscribe(&self, request: PeRequest, device: DeviceHandle) -> Result<PeResponse, PEError> {
        self.dispatch(PeOperation::Subscribe, request, device).await
    }

    /// End a live subscription.
    pub async fn unsubscribe(
        &self,
        subscribe_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<PeResponse, PEError> {
        let subscribe_id = subscribe_id.into();
        let corr = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let mut guard = CancelGuard {
            cmd_tx: self.cmd_tx.clone(),
            corr: Some(corr),
        };
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Unsubscribe {
                corr,
                subscribe_id,
                timeout,
                resp: resp_tx,
            })
            .await
            .is_err()
        {
            return Err(PEError::Cancelled);
        }
        let result = resp_rx.await.unwrap_or(Err(PEError::Cancelled));
        guard.disarm();
        result
    }

    /// Issue a batch of Set requests concurrently (bounded by
    /// [`BatchOptions::max_concurrency`], and still subject to the
    /// per-device in-flight cap), returning every item's outcome keyed by
    /// resource name (§4.6, point 5).
    pub async fn batch_set(
        &self,
        items: Vec<BatchSetItem>,
        device: DeviceHandle,
        options: BatchOptions,
    ) -> HashMap<String, Result<PeResponse, PEError>> {
        use futures::stream::{self, StreamExt};

        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_on_first_failure = options.stop_on_first_failure;
        let validate = options.validate_payloads;
        let timeout = options.timeout;

        let results = stream::iter(items.into_iter().map(|item| {
            let device = device.clone();
            let failed = failed.clone();
            async move {
                if stop_on_first_failure && failed.load(Ordering::Relaxed) {
                    return (item.resource, Err(PEError::Cancelled));
                }
                let request = PeRequest::set(item.resource.clone(), item.body, timeout);
                if validate {
                    if let Err(e) = request.validate() {
                        failed.store(true, Ordering::Relaxed);
                        return (item.resource, Err(e));
                    }
                }
                let result = self.set(request, device).await;
                if result.is_err() {
                    failed.store(true, Ordering::Relaxed);
                }
                (item.resource, result)
            }
        }))
        .buffer_unordered(options.max_concurrency)
        .collect::<Vec<_>>()
        .await;

        results.into_iter().collect()
    }

    /// Tear the engine's in-flight state down: every pending transaction
    /// resolves with [`PEError::Cancelled`], every subscription is
    /// forgotten, and the request-ID pool is fully released. The reactor
    /// task itself keeps running and is valid to use again immediately
    /// (§4.6, point 6).
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Snapshot of request-ID, transaction, and subscription counts.
    pub async fn stats(&self) -> EngineStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats(tx)).await.is_err() {
            return EngineStats {
                available_ids: 0,
                pending_transactions: 0,
                subscriptions: 0,
            };
        }
        rx.await.unwrap_or(EngineStats {
            available_ids: 0,
            pending_transactions: 0,
            subscriptions: 0,
        })
    }

    async fn dispatch(
        &self,
        operation: PeOperation,
        request: PeRequest,
        device: DeviceHandle,
    ) -> Result<PeResponse, PEError> {
        request.validate()?;
        let semaphore = self.semaphore_for(device.muid).await;
        let _permit = semaphore
            .acquire_owned()
            .await
            .expect("engine semaphore is never closed");
        let corr = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let mut guard = CancelGuard {
            cmd_tx: self.cmd_tx.clone(),
            corr: Some(corr),
        };
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Send {
                corr,
                operation,
                request,
                device,
                resp: resp_tx,
            })
            .await
            .is_err()
        {
            return Err(PEError::Cancelled);
        }
        let result = resp_rx.await.unwrap_or(Err(PEError::Cancelled));
        guard.disarm();
        result
    }

    async fn semaphore_for(&self, muid: MUID) -> Arc<Semaphore> {
        let mut map = self.device_semaphores.lock().await;
        map.entry(muid)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_inflight_per_device)))
            .clone()
    }
}

async fn reactor_task(
    own_muid: MUID,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    notifications_tx: broadcast::Sender<Notification>,
) {
    let mut pool = RequestIdPool::with_cooldown(config.cooldown());
    let mut pending: HashMap<u64, Transaction> = HashMap::new();
    let mut by_request_id: HashMap<u8, u64> = HashMap::new();
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
    let mut reply_assembler: ChunkAssembler<u8> = ChunkAssembler::new(config.reply_assembly_timeout);
    let mut notify_assembler: ChunkAssembler<(MUID, u8)> =
        ChunkAssembler::new(config.notify_assembly_timeout);
    let mut cleanup = tokio::time::interval(config.cleanup_interval);
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                match cmd {
                    Command::Send { corr, operation, request, device, resp } => {
                        handle_send(
                            own_muid, &transport, &config, &mut pool, &mut pending, &mut by_request_id,
                            corr, operation, request, device, resp,
                        ).await;
                    }
                    Command::Unsubscribe { corr, subscribe_id, timeout, resp } => {
                        handle_unsubscribe(
                            own_muid, &transport, &config, &mut pool, &mut pending, &mut by_request_id,
                            &subscriptions, corr, subscribe_id, timeout, resp,
                        ).await;
                    }
                    Command::Cancel(corr) => {
                        if let Some(mut txn) = pending.remove(&corr) {
                            by_request_id.remove(&txn.request_id);
                            pool.release(txn.request_id, Instant::now());
                            if let Some(resp) = txn.resp.take() {
                                let _ = resp.send(Err(PEError::Cancelled));
                            }
                        }
                    }
                    Command::Inbound(message) => {
                        handle_inbound(
                            message, &mut pending, &mut by_request_id, &mut pool,
                            &mut reply_assembler, &mut notify_assembler, &mut subscriptions,
                            &notifications_tx,
                        );
                    }
                    Command::Stats(resp) => {
                        let now = Instant::now();
                        let _ = resp.send(EngineStats {
                            available_ids: pool.available(now),
                            pending_transactions: pending.len(),
                            subscriptions: subscriptions.len(),
                        });
                    }
                    Command::Stop(ack) => {
                        for (_, mut txn) in pending.drain() {
                            if let Some(resp) = txn.resp.take() {
                                let _ = resp.send(Err(PEError::Cancelled));
                            }
                        }
                        by_request_id.clear();
                        subscriptions.clear();
                        pool.release_all();
                        let _ = ack.send(());
                    }
                }
            }
            _ = cleanup.tick() => {
                sweep_deadlines(&mut pool, &mut pending, &mut by_request_id);
                sweep_chunk_timeouts(&mut pool, &mut pending, &mut by_request_id, &mut reply_assembler);
                notify_assembler.poll_timeouts(Instant::now());
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_send(
    own_muid: MUID,
    transport: &Arc<dyn Transport>,
    config: &EngineConfig,
    pool: &mut RequestIdPool,
    pending: &mut HashMap<u64, Transaction>,
    by_request_id: &mut HashMap<u8, u64>,
    corr: u64,
    operation: PeOperation,
    request: PeRequest,
    device: DeviceHandle,
    resp: oneshot::Sender<Result<PeResponse, PEError>>,
) {
    let now = Instant::now();
    let Some(request_id) = pool.acquire(now) else {
        let _ = resp.send(Err(PEError::NearExhaustion));
        return;
    };
    let deadline = now + config.scale_timeout(request.timeout);

    let send_result = match operation {
        PeOperation::Get => {
            let header_bytes = header::request_header(&request, None);
            let message = CiMessage::PeGetInquiry {
                source: own_muid,
                dest: device.muid,
                ci_version: CI_VERSION,
                request_id,
                header: header_bytes,
            };
            transport.send(message.to_bytes(), device.endpoint.clone()).await
        }
        PeOperation::Set | PeOperation::Subscribe => {
            let body = request.body.clone().unwrap_or_default();
            let (encoded, encoding) = header::encode_body(&body, config.compression_threshold);
            let header_bytes = header::request_header(&request, Some(encoding));
            let chunks = header::split_for_chunking(device.max_sysex_size, &header_bytes, &encoded);
            let num_chunks = chunks.len() as u16;
            send_chunks(transport, own_muid, device.muid, device.endpoint.clone(), operation, request_id, chunks, num_chunks).await
        }
        PeOperation::Unsubscribe => unreachable!("unsubscribe has its own command"),
    };

    if let Err(e) = send_result {
        pool.release(request_id, now);
        let _ = resp.send(Err(PEError::TransportError { cause: e.to_string() }));
        return;
    }

    pending.insert(
        corr,
        Transaction {
            request_id,
            operation,
            resource: request.resource,
            device,
            deadline,
            resp: Some(resp),
            unsubscribe_target: None,
        },
    );
    by_request_id.insert(request_id, corr);
}

async fn send_chunks(
    transport: &Arc<dyn Transport>,
    own_muid: MUID,
    dest: MUID,
    endpoint: crate::transport::EndpointId,
    operation: PeOperation,
    request_id: u8,
    chunks: Vec<(Vec<u8>, Vec<u8>)>,
    num_chunks: u16,
) -> Result<(), crate::transport::TransportError> {
    for (i, (chunk_header, chunk_property)) in chunks.into_iter().enumerate() {
        let payload = PeChunkPayload {
            request_id,
            header: chunk_header,
            num_chunks,
            this_chunk: (i + 1) as u16,
            property: chunk_property,
        };
        let message = match operation {
            PeOperation::Set => CiMessage::PeSet {
                source: own_muid,
                dest,
                ci_version: CI_VERSION,
                payload,
            },
            _ => CiMessage::PeSubscribe {
                source: own_muid,
                dest,
                ci_version: CI_VERSION,
                payload,
            },
        };
        transport.send(message.to_bytes(), endpoint.clone()).await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_unsubscribe(
    own_muid: MUID,
    transport: &Arc<dyn Transport>,
    config: &EngineConfig,
    pool: &mut RequestIdPool,
    pending: &mut HashMap<u64, Transaction>,
    by_request_id: &mut HashMap<u8, u64>,
    subscriptions: &HashMap<String, Subscription>,
    corr: u64,
    subscribe_id: String,
    timeout: Duration,
    resp: oneshot::Sender<Result<PeResponse, PEError>>,
) {
    let now = Instant::now();
    let Some(sub) = subscriptions.get(&subscribe_id).cloned() else {
        let _ = resp.send(Err(PEError::InvalidResponse {
            reason: format!("no live subscription {subscribe_id:?}"),
        }));
        return;
    };
    let Some(request_id) = pool.acquire(now) else {
        let _ = resp.send(Err(PEError::NearExhaustion));
        return;
    };
    let header_bytes = serde_json::to_vec(&serde_json::json!({
        "command": "end",
        "subscribeId": subscribe_id,
    }))
    .unwrap_or_default();
    let payload = PeChunkPayload {
        request_id,
        header: header_bytes,
        num_chunks: 1,
        this_chunk: 1,
        property: Vec::new(),
    };
    let message = CiMessage::PeSubscribe {
        source: own_muid,
        dest: sub.device.muid,
        ci_version: CI_VERSION,
        payload,
    };
    if let Err(e) = transport.send(message.to_bytes(), sub.device.endpoint.clone()).await {
        pool.release(request_id, now);
        let _ = resp.send(Err(PEError::TransportError { cause: e.to_string() }));
        return;
    }
    let deadline = now + config.scale_timeout(timeout);
    pending.insert(
        corr,
        Transaction {
            request_id,
            operation: PeOperation::Unsubscribe,
            resource: sub.resource,
            device: sub.device,
            deadline,
            resp: Some(resp),
            unsubscribe_target: Some(subscribe_id),
        },
    );
    by_request_id.insert(request_id, corr);
}

#[allow(clippy::too_many_arguments)]
fn handle_inbound(
    message: CiMessage,
    pending: &mut HashMap<u64, Transaction>,
    by_request_id: &mut HashMap<u8, u64>,
    pool: &mut RequestIdPool,
    reply_assembler: &mut ChunkAssembler<u8>,
    notify_assembler: &mut ChunkAssembler<(MUID, u8)>,
    subscriptions: &mut HashMap<String, Subscription>,
    notifications_tx: &broadcast::Sender<Notification>,
) {
    let now = Instant::now();
    match message {
        CiMessage::PeGetReply { payload, .. }
        | CiMessage::PeSetReply { payload, .. }
        | CiMessage::PeSubscribeReply { payload, .. } => {
            let request_id = payload.request_id;
            let result = reply_assembler.add_chunk(
                request_id,
                payload.this_chunk,
                payload.num_chunks,
                &payload.header,
                &payload.property,
                now,
            );
            if let ChunkResult::Complete { header, body } = result {
                complete_transaction(request_id, header, body, pending, by_request_id, pool, subscriptions);
            }
        }
        CiMessage::Nak { payload, .. } => {
            if let Some(corr) = by_request_id.remove(&payload.orig_tx) {
                if let Some(mut txn) = pending.remove(&corr) {
                    pool.release(txn.request_id, now);
                    if let Some(resp) = txn.resp.take() {
                        let _ = resp.send(Err(PEError::Nak {
                            status_code: payload.status_code,
                            status_data: payload.status_data,
                        }));
                    }
                }
            } else {
                trace!(orig_tx = payload.orig_tx, "NAK for unknown or already-resolved request");
            }
        }
        CiMessage::PeNotify { source, payload, .. } => {
            let key = (source, payload.request_id);
            let result = notify_assembler.add_chunk(
                key,
                payload.this_chunk,
                payload.num_chunks,
                &payload.header,
                &payload.property,
                now,
            );
            if let ChunkResult::Complete { header, body } = result {
                deliver_notification(header, body, subscriptions, notifications_tx);
            }
        }
        _ => {}
    }
}

fn complete_transaction(
    request_id: u8,
    header: Vec<u8>,
    body: Vec<u8>,
    pending: &mut HashMap<u64, Transaction>,
    by_request_id: &mut HashMap<u8, u64>,
    pool: &mut RequestIdPool,
    subscriptions: &mut HashMap<String, Subscription>,
) {
    let now = Instant::now();
    let Some(corr) = by_request_id.remove(&request_id) else {
        return;
    };
    let Some(mut txn) = pending.remove(&corr) else {
        return;
    };
    pool.release(request_id, now);
    let Some(resp) = txn.resp.take() else {
        return;
    };

    let parsed = match header::parse_header(&header) {
        Ok(value) => value,
        Err(e) => {
            let _ = resp.send(Err(e));
            return;
        }
    };
    let status = parsed.get("status").and_then(Value::as_u64).unwrap_or(200) as u16;
    let message = parsed.get("message").and_then(Value::as_str).map(String::from);

    if (400..600).contains(&status) {
        let _ = resp.send(Err(PEError::DeviceError { status, message }));
        return;
    }

    let mutual_encoding = parsed
        .get("mutualEncoding")
        .and_then(Value::as_str)
        .unwrap_or("ASCII")
        .to_string();
    let decoded_body = match header::decode_body(&body, &mutual_encoding) {
        Ok(b) => b,
        Err(e) => {
            let _ = resp.send(Err(e));
            return;
        }
    };

    let subscribe_id = parsed.get("subscribeId").and_then(Value::as_str).map(String::from);

    match txn.operation {
        PeOperation::Subscribe => {
            if let Some(sid) = &subscribe_id {
                subscriptions.insert(
                    sid.clone(),
                    Subscription {
                        subscribe_id: sid.clone(),
                        resource: txn.resource.clone(),
                        device: txn.device.clone(),
                        created_at: now,
                    },
                );
            }
        }
        PeOperation::Unsubscribe => {
            if let Some(target) = &txn.unsubscribe_target {
                subscriptions.remove(target);
            }
        }
        _ => {}
    }

    let _ = resp.send(Ok(PeResponse {
        status,
        message,
        header: parsed,
        body: decoded_body,
        subscribe_id,
    }));
}

fn deliver_notification(
    header: Vec<u8>,
    body: Vec<u8>,
    subscriptions: &HashMap<String, Subscription>,
    notifications_tx: &broadcast::Sender<Notification>,
) {
    let parsed = match header::parse_header(&header) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "dropping malformed PE notification header");
            return;
        }
    };
    let Some(subscribe_id) = parsed.get("subscribeId").and_then(Value::as_str) else {
        return;
    };
    let Some(sub) = subscriptions.get(subscribe_id) else {
        debug!(subscribe_id, "notification for unknown subscription, dropping");
        return;
    };
    let _ = notifications_tx.send(Notification {
        subscribe_id: subscribe_id.to_string(),
        resource: sub.resource.clone(),
        data: body,
    });
}

fn sweep_deadlines(
    pool: &mut RequestIdPool,
    pending: &mut HashMap<u64, Transaction>,
    by_request_id: &mut HashMap<u8, u64>,
) {
    let now = Instant::now();
    let expired: Vec<u64> = pending
        .iter()
        .filter(|(_, txn)| now >= txn.deadline)
        .map(|(corr, _)| *corr)
        .collect();
    for corr in expired {
        if let Some(mut txn) = pending.remove(&corr) {
            by_request_id.remove(&txn.request_id);
            pool.release(txn.request_id, now);
            if let Some(resp) = txn.resp.take() {
                let _ = resp.send(Err(PEError::Timeout {
                    resource: txn.resource.clone(),
                }));
            }
        }
    }
}

fn sweep_chunk_timeouts(
    pool: &mut RequestIdPool,
    pending: &mut HashMap<u64, Transaction>,
    by_request_id: &mut HashMap<u8, u64>,
    reply_assembler: &mut ChunkAssembler<u8>,
) {
    let now = Instant::now();
    for request_id in reply_assembler.poll_timeouts(now) {
        if let Some(corr) = by_request_id.remove(&request_id) {
            if let Some(mut txn) = pending.remove(&corr) {
                pool.release(txn.request_id, now);
                if let Some(resp) = txn.resp.take() {
                    let _ = resp.send(Err(PEError::Timeout {
                        resource: txn.resource.clone(),
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationKind;
    use crate::transport::{EndpointId, MockTransport};
    use std::collections::HashSet as StdHashSet;

    fn device(muid: MUID, endpoint: &str) -> DeviceHandle {
        DeviceHandle {
            muid,
            endpoint: EndpointId::new(endpoint),
            max_sysex_size: None,
        }
    }

    async fn sent_snapshot(transport: &Arc<MockTransport>) -> Vec<(Vec<u8>, EndpointId)> {
        transport.sent_messages().await
    }

    /// Polls `transport`'s sent messages for unanswered PE Get/Set/Subscribe
    /// inquiries and feeds a canned 2xx reply straight into `engine`,
    /// emulating a responder device without a real transport round-trip.
    async fn auto_respond_once(
        transport: &Arc<MockTransport>,
        engine: &Engine,
        own_muid: MUID,
        device_muid: MUID,
        answered: &mut StdHashSet<u8>,
    ) {
        for (bytes, _ep) in sent_snapshot(transport).await {
            let Some(message) = CiMessage::from_bytes(&bytes) else {
                continue;
            };
            if message.source() != own_muid || message.dest() != device_muid {
                continue;
            }
            let request_id = match &message {
                CiMessage::PeGetInquiry { request_id, .. } => *request_id,
                CiMessage::PeSet { payload, .. } | CiMessage::PeSubscribe { payload, .. } => {
                    payload.request_id
                }
                _ => continue,
            };
            if !answered.insert(request_id) {
                continue;
            }
            let (header, status): (&[u8], u16) = match &message {
                CiMessage::PeSubscribe { payload, .. } if payload.header.windows(6).any(|w| w == b"\"end\":") => {
                    (b"{\"status\":200}", 200)
                }
                CiMessage::PeSubscribe { .. } => (b"{\"status\":200,\"subscribeId\":\"sub-1\"}", 200),
                _ => (b"{\"status\":200}", 200),
            };
            let _ = status;
            let reply = match &message {
                CiMessage::PeGetInquiry { .. } => CiMessage::PeGetReply {
                    source: device_muid,
                    dest: own_muid,
                    ci_version: CI_VERSION,
                    payload: PeChunkPayload {
                        request_id,
                        header: header.to_vec(),
                        num_chunks: 1,
                        this_chunk: 1,
                        property: b"{\"manufacturer\":\"Acme\"}".to_vec(),
                    },
                },
                CiMessage::PeSet { .. } => CiMessage::PeSetReply {
                    source: device_muid,
                    dest: own_muid,
                    ci_version: CI_VERSION,
                    payload: PeChunkPayload {
                        request_id,
                        header: header.to_vec(),
                        num_chunks: 1,
                        this_chunk: 1,
                        property: Vec::new(),
                    },
                },
                CiMessage::PeSubscribe { .. } => CiMessage::PeSubscribeReply {
                    source: device_muid,
                    dest: own_muid,
                    ci_version: CI_VERSION,
                    payload: PeChunkPayload {
                        request_id,
                        header: header.to_vec(),
                        num_chunks: 1,
                        this_chunk: 1,
                        property: Vec::new(),
                    },
                },
                _ => continue,
            };
            engine.handle_inbound(reply).await;
        }
    }

    async fn wait_until_sent(transport: &Arc<MockTransport>, count: usize) {
        for _ in 0..200 {
            if transport.sent_messages().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} sent message(s)");
    }

    #[tokio::test]
    async fn get_roundtrip_success() {
        let transport = MockTransport::new();
        transport.register_device("dev-1", "Device One").await;
        let own_muid = MUID::new(1);
        let device_muid = MUID::new(2);
        let engine = Engine::new(own_muid, transport.clone(), EngineConfig::new());

        let task = {
            let engine = engine.clone();
            let dev = device(device_muid, "dev-1");
            tokio::spawn(async move {
                engine
                    .get(PeRequest::get("DeviceInfo", Duration::from_secs(2)), dev)
                    .await
            })
        };

        wait_until_sent(&transport, 1).await;
        let mut answered = StdHashSet::new();
        auto_respond_once(&transport, &engine, own_muid, device_muid, &mut answered).await;

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"{\"manufacturer\":\"Acme\"}");
        let stats = engine.stats().await;
        assert_eq!(stats.pending_transactions, 0);
        assert_eq!(stats.available_ids, crate::reqid::SLOT_COUNT);
    }

    #[tokio::test]
    async fn device_error_status_surfaces_as_device_error() {
        let transport = MockTransport::new();
        transport.register_device("dev-1", "Device One").await;
        let own_muid = MUID::new(1);
        let device_muid = MUID::new(2);
        let engine = Engine::new(own_muid, transport.clone(), EngineConfig::new());

        let task = {
            let engine = engine.clone();
            let dev = device(device_muid, "dev-1");
            tokio::spawn(async move { engine.get(PeRequest::get("Foo", Duration::from_secs(2)), dev).await })
        };
        wait_until_sent(&transport, 1).await;
        let sent = sent_snapshot(&transport).await;
        let message = CiMessage::from_bytes(&sent[0].0).unwrap();
        let request_id = match message {
            CiMessage::PeGetInquiry { request_id, .. } => request_id,
            _ => panic!("expected Get Inquiry"),
        };
        let reply = CiMessage::PeGetReply {
            source: device_muid,
            dest: own_muid,
            ci_version: CI_VERSION,
            payload: PeChunkPayload {
                request_id,
                header: b"{\"status\":404,\"message\":\"no such resource\"}".to_vec(),
                num_chunks: 1,
                this_chunk: 1,
                property: Vec::new(),
            },
        };
        engine.handle_inbound(reply).await;

        let err = task.await.unwrap().unwrap_err();
        match err {
            PEError::DeviceError { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message.as_deref(), Some("no such resource"));
            }
            other => panic!("expected DeviceError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nak_resolves_waiter_with_classified_error() {
        let transport = MockTransport::new();
        transport.register_device("dev-1", "Device One").await;
        let own_muid = MUID::new(1);
        let device_muid = MUID::new(2);
        let engine = Engine::new(own_muid, transport.clone(), EngineConfig::new());

        let task = {
            let engine = engine.clone();
            let dev = device(device_muid, "dev-1");
            tokio::spawn(async move { engine.get(PeRequest::get("Foo", Duration::from_secs(2)), dev).await })
        };
        wait_until_sent(&transport, 1).await;
        let sent = sent_snapshot(&transport).await;
        let request_id = match CiMessage::from_bytes(&sent[0].0).unwrap() {
            CiMessage::PeGetInquiry { request_id, .. } => request_id,
            _ => panic!("expected Get Inquiry"),
        };
        engine
            .handle_inbound(CiMessage::Nak {
                source: device_muid,
                dest: own_muid,
                ci_version: CI_VERSION,
                payload: crate::codec::NakPayload {
                    orig_tx: request_id,
                    status_code: 1,
                    status_data: crate::error::NAK_DETAIL_BUSY,
                    details: None,
                    message: None,
                },
            })
            .await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, PEError::Nak { status_data, .. } if status_data == crate::error::NAK_DETAIL_BUSY));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn timeout_releases_id_and_resolves_waiter() {
        let transport = MockTransport::new();
        transport.register_device("dev-1", "Device One").await;
        let own_muid = MUID::new(1);
        let device_muid = MUID::new(2);
        let config = EngineConfig::new().with_cleanup_interval(Duration::from_millis(20));
        let engine = Engine::new(own_muid, transport.clone(), config);

        let dev = device(device_muid, "dev-1");
        let err = engine
            .get(PeRequest::get("Foo", Duration::from_millis(50)), dev)
            .await
            .unwrap_err();
        assert!(matches!(err, PEError::Timeout { resource } if resource == "Foo"));

        let stats = engine.stats().await;
        assert_eq!(stats.pending_transactions, 0);
        assert_eq!(stats.available_ids, crate::reqid::SLOT_COUNT);
    }

    #[tokio::test]
    async fn cancellation_releases_id_when_future_dropped() {
        let transport = MockTransport::new();
        transport.register_device("dev-1", "Device One").await;
        let own_muid = MUID::new(1);
        let device_muid = MUID::new(2);
        let engine = Engine::new(own_muid, transport.clone(), EngineConfig::new());

        {
            let engine = engine.clone();
            let dev = device(device_muid, "dev-1");
            let fut = engine.get(PeRequest::get("Foo", Duration::from_secs(30)), dev);
            tokio::pin!(fut);
            // Poll once to send the request, then drop without awaiting completion.
            let _ = futures::poll!(&mut fut);
        }
        wait_until_sent(&transport, 1).await;

        // Give the reactor a moment to process the Cancel command the
        // dropped CancelGuard sent.
        for _ in 0..100 {
            if engine.stats().await.pending_transactions == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = engine.stats().await;
        assert_eq!(stats.pending_transactions, 0);
        assert_eq!(stats.available_ids, crate::reqid::SLOT_COUNT);
    }

    #[tokio::test]
    async fn subscribe_notify_unsubscribe_lifecycle() {
        let transport = MockTransport::new();
        transport.register_device("dev-1", "Device One").await;
        let own_muid = MUID::new(1);
        let device_muid = MUID::new(2);
        let engine = Engine::new(own_muid, transport.clone(), EngineConfig::new());
        let mut notifications = engine.notifications();

        let task = {
            let engine = engine.clone();
            let dev = device(device_muid, "dev-1");
            tokio::spawn(async move { engine.subscribe(PeRequest::subscribe("Foo", Duration::from_secs(2)), dev).await })
        };
        wait_until_sent(&transport, 1).await;
        let sent = sent_snapshot(&transport).await;
        let request_id = match CiMessage::from_bytes(&sent[0].0).unwrap() {
            CiMessage::PeSubscribe { payload, .. } => payload.request_id,
            _ => panic!("expected Subscribe"),
        };
        engine
            .handle_inbound(CiMessage::PeSubscribeReply {
                source: device_muid,
                dest: own_muid,
                ci_version: CI_VERSION,
                payload: PeChunkPayload {
                    request_id,
                    header: b"{\"status\":200,\"subscribeId\":\"sub-1\"}".to_vec(),
                    num_chunks: 1,
                    this_chunk: 1,
                    property: Vec::new(),
                },
            })
            .await;
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.subscribe_id.as_deref(), Some("sub-1"));
        assert_eq!(engine.stats().await.subscriptions, 1);

        // A Notify addressed to the live subscription is delivered.
        engine
            .handle_inbound(CiMessage::PeNotify {
                source: device_muid,
                dest: own_muid,
                ci_version: CI_VERSION,
                payload: PeChunkPayload {
                    request_id: 99,
                    header: b"{\"subscribeId\":\"sub-1\"}".to_vec(),
                    num_chunks: 1,
                    this_chunk: 1,
                    property: b"changed".to_vec(),
                },
            })
            .await;
        let notification = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.subscribe_id, "sub-1");
        assert_eq!(notification.data, b"changed");

        // Unsubscribe removes the subscription once the device confirms.
        let unsub_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.unsubscribe("sub-1", Duration::from_secs(2)).await })
        };
        wait_until_sent(&transport, 2).await;
        let sent = sent_snapshot(&transport).await;
        let end_request_id = match CiMessage::from_bytes(&sent[1].0).unwrap() {
            CiMessage::PeSubscribe { payload, .. } => payload.request_id,
            _ => panic!("expected end-subscribe"),
        };
        engine
            .handle_inbound(CiMessage::PeSubscribeReply {
                source: device_muid,
                dest: own_muid,
                ci_version: CI_VERSION,
                payload: PeChunkPayload {
                    request_id: end_request_id,
                    header: b"{\"status\":200}".to_vec(),
                    num_chunks: 1,
                    this_chunk: 1,
                    property: Vec::new(),
                },
            })
            .await;
        unsub_task.await.unwrap().unwrap();
        assert_eq!(engine.stats().await.subscriptions, 0);
    }

    #[tokio::test]
    async fn notify_for_unknown_subscription_is_dropped_silently() {
        let transport = MockTransport::new();
        let own_muid = MUID::new(1);
        let engine = Engine::new(own_muid, transport.clone(), EngineConfig::new());
        let mut notifications = engine.notifications();
        engine
            .handle_inbound(CiMessage::PeNotify {
                source: MUID::new(2),
                dest: own_muid,
                ci_version: CI_VERSION,
                payload: PeChunkPayload {
                    request_id: 1,
                    header: b"{\"subscribeId\":\"unknown\"}".to_vec(),
                    num_chunks: 1,
                    this_chunk: 1,
                    property: b"x".to_vec(),
                },
            })
            .await;
        assert!(tokio::time::timeout(Duration::from_millis(100), notifications.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn validation_failure_never_reaches_the_transport() {
        let transport = MockTransport::new();
        transport.register_device("dev-1", "Device One").await;
        let own_muid = MUID::new(1);
        let engine = Engine::new(own_muid, transport.clone(), EngineConfig::new());
        let dev = device(MUID::new(2), "dev-1");
        let err = engine.get(PeRequest::get("", Duration::from_secs(1)), dev).await.unwrap_err();
        assert!(matches!(
            err,
            PEError::ValidationFailed {
                kind: ValidationKind::EmptyResource
            }
        ));
        assert!(transport.sent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn per_device_admission_control_serializes_above_cap() {
        let transport = MockTransport::new();
        transport.register_device("dev-1", "Device One").await;
        let own_muid = MUID::new(1);
        let device_muid = MUID::new(2);
        let config = EngineConfig::new().with_max_inflight(1);
        let engine = Engine::new(own_muid, transport.clone(), config);

        let dev = device(device_muid, "dev-1");
        let first = {
            let engine = engine.clone();
            let dev = dev.clone();
            tokio::spawn(async move { engine.get(PeRequest::get("A", Duration::from_secs(2)), dev).await })
        };
        wait_until_sent(&transport, 1).await;

        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get(PeRequest::get("B", Duration::from_secs(2)), dev).await })
        };
        // Give the second request every chance to (wrongly) go out before
        // the first completes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent_messages().await.len(), 1, "second request must wait for a free slot");

        let mut answered = StdHashSet::new();
        auto_respond_once(&transport, &engine, own_muid, device_muid, &mut answered).await;
        first.await.unwrap().unwrap();

        wait_until_sent(&transport, 2).await;
        auto_respond_once(&transport, &engine, own_muid, device_muid, &mut answered).await;
        second.await.unwrap().unwrap();
    }

    /// §5/§8: 50 concurrent requests followed by `stop()` must leave every
    /// request ID available and no pending transactions, regardless of
    /// whether each one completed, was cancelled, or never got a reply.
    #[tokio::test]
    async fn stress_fifty_concurrent_requests_then_stop() {
        let transport = MockTransport::new();
        transport.register_device("dev-1", "Device One").await;
        let own_muid = MUID::new(1);
        let device_muid = MUID::new(2);
        let config = EngineConfig::new().with_max_inflight(50);
        let engine = Engine::new(own_muid, transport.clone(), config);

        let barrier = Arc::new(tokio::sync::Barrier::new(50));
        let mut handles = Vec::new();
        for i in 0..50u32 {
            let engine = engine.clone();
            let dev = device(device_muid, "dev-1");
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine
                    .get(PeRequest::get(format!("R{i}"), Duration::from_secs(30)), dev)
                    .await
            }));
        }

        wait_until_sent(&transport, 50).await;
        // Answer half, leave the rest unanswered so `stop()` has to tear
        // down both completed-but-unreceived and fully-pending transactions.
        let mut answered = StdHashSet::new();
        for (bytes, _ep) in sent_snapshot(&transport).await.into_iter().take(25) {
            if let Some(CiMessage::PeGetInquiry { request_id, .. }) = CiMessage::from_bytes(&bytes) {
                answered.insert(request_id);
                engine
                    .handle_inbound(CiMessage::PeGetReply {
                        source: device_muid,
                        dest: own_muid,
                        ci_version: CI_VERSION,
                        payload: PeChunkPayload {
                            request_id,
                            header: b"{\"status\":200}".to_vec(),
                            num_chunks: 1,
                            this_chunk: 1,
                            property: Vec::new(),
                        },
                    })
                    .await;
            }
        }

        engine.stop().await;
        for handle in handles {
            let _ = handle.await;
        }

        let stats = engine.stats().await;
        assert_eq!(stats.available_ids, crate::reqid::SLOT_COUNT);
        assert_eq!(stats.pending_transactions, 0);
    }
}
