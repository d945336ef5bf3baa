//! Request/response types for the PE transaction engine (C6, §3, §4.6).
use std::time::{Duration, Instant};

use crate::ci::DiscoveredDevice;
use crate::error::{PEError, ValidationKind};
use crate::muid::MUID;
use crate::transport::EndpointId;

/// Which PE operation a [`PeRequest`] performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeOperation {
    /// Read a resource.
    Get,
    /// Write a resource.
    Set,
    /// Subscribe to a resource's change notifications.
    Subscribe,
    /// Cancel an existing subscription.
    Unsubscribe,
}

/// Enough of a discovered device's identity to address a PE request to it:
/// the CI MUID used in the wire frame, and the transport endpoint the bytes
/// actually go out on. Two devices sharing a transport endpoint are
/// disambiguated by MUID; a device reachable over several endpoints picks
/// one at discovery time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    /// The device's CI MUID.
    pub muid: MUID,
    /// The transport endpoint to send requests to.
    pub endpoint: EndpointId,
    /// The device's advertised maximum SysEx size, if known, used to decide
    /// whether an outbound Set/Subscribe body needs chunking.
    pub max_sysex_size: Option<u32>,
}

impl DeviceHandle {
    /// Build a handle from a device learned via discovery plus the
    /// endpoint it was heard on.
    pub fn from_discovered(device: &DiscoveredDevice, endpoint: EndpointId) -> Self {
        DeviceHandle {
            muid: device.muid,
            endpoint,
            max_sysex_size: Some(device.max_sysex_size),
        }
    }
}

/// A Property Exchange request (§3 "PE request").
#[derive(Clone, Debug)]
pub struct PeRequest {
    /// The operation to perform.
    pub operation: PeOperation,
    /// The target resource name.
    pub resource: String,
    /// Optional resource id (`resId` header field), for resources addressed
    /// by both name and id (e.g. a specific program in `ProgramList`).
    pub res_id: Option<String>,
    /// Optional MIDI channel, `0..=127`.
    pub channel: Option<u16>,
    /// Optional byte offset into a list resource.
    pub offset: Option<i64>,
    /// Optional maximum number of entries to return.
    pub limit: Option<i64>,
    /// The body to write; required for `Set`.
    pub body: Option<Vec<u8>>,
    /// How long to wait for a reply before failing with `Timeout`.
    pub timeout: Duration,
}

impl PeRequest {
    /// Construct a `Get` request for `resource` with the given timeout.
    pub fn get(resource: impl Into<String>, timeout: Duration) -> Self {
        PeRequest {
            operation: PeOperation::Get,
            resource: resource.into(),
            res_id: None,
            channel: None,
            offset: None,
            limit: None,
            body: None,
            timeout,
        }
    }

    /// Construct a `Set` request for `resource` carrying `body`.
    pub fn set(resource: impl Into<String>, body: Vec<u8>, timeout: Duration) -> Self {
        PeRequest {
            operation: PeOperation::Set,
            resource: resource.into(),
            res_id: None,
            channel: None,
            offset: None,
            limit: None,
            body: Some(body),
            timeout,
        }
    }

    /// Construct a `Subscribe` request for `resource`.
    pub fn subscribe(resource: impl Into<String>, timeout: Duration) -> Self {
        PeRequest {
            operation: PeOperation::Subscribe,
            resource: resource.into(),
            res_id: None,
            channel: None,
            offset: None,
            limit: None,
            body: None,
            timeout,
        }
    }

    /// Set the optional MIDI channel.
    pub fn with_channel(mut self, channel: u16) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set the optional resource id.
    pub fn with_res_id(mut self, res_id: impl Into<String>) -> Self {
        self.res_id = Some(res_id.into());
        self
    }

    /// Set the optional list offset/limit.
    pub fn with_range(mut self, offset: i64, limit: i64) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    /// Validate the invariants from §3: non-empty resource, `Set` requires
    /// a body, and `channel` must fit a MIDI-channel index.
    pub fn validate(&self) -> Result<(), PEError> {
        if self.resource.is_empty() {
            return Err(PEError::ValidationFailed {
                kind: ValidationKind::EmptyResource,
            });
        }
        if self.operation == PeOperation::Set && self.body.is_none() {
            return Err(PEError::ValidationFailed {
                kind: ValidationKind::MissingBody,
            });
        }
        if let Some(channel) = self.channel {
            if channel > 127 {
                return Err(PEError::ValidationFailed {
                    kind: ValidationKind::InvalidChannel(channel),
                });
            }
        }
        Ok(())
    }
}

/// The result of a completed PE transaction.
#[derive(Clone, Debug)]
pub struct PeResponse {
    /// HTTP-style status from the reply header.
    pub status: u16,
    /// Optional human-readable message from the reply header.
    pub message: Option<String>,
    /// The full reply header, parsed as JSON.
    pub header: serde_json::Value,
    /// The reassembled property body.
    pub body: Vec<u8>,
    /// `subscribeId`, present only on a successful Subscribe reply.
    pub subscribe_id: Option<String>,
}

/// A live subscription, owned by the engine between a successful
/// SubscribeReply and Unsubscribe/`stop()` (§3 "Subscription").
#[derive(Clone, Debug)]
pub struct Subscription {
    /// The subscription id the device assigned.
    pub subscribe_id: String,
    /// The subscribed resource.
    pub resource: String,
    /// The device the subscription is with.
    pub device: DeviceHandle,
    /// When the subscription was established.
    pub created_at: Instant,
}

/// Options controlling [`super::engine::Engine::batch_set`].
#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Upper bound on concurrently in-flight Sets across the whole batch
    /// (still additionally bounded by the per-device in-flight cap).
    pub max_concurrency: usize,
    /// Stop issuing further Sets once one has failed.
    pub stop_on_first_failure: bool,
    /// Per-item timeout.
    pub timeout: Duration,
    /// Validate every item's payload before sending any of them.
    pub validate_payloads: bool,
}

impl BatchOptions {
    /// Construct options with the given per-item timeout and otherwise
    /// permissive defaults (unbounded-ish concurrency of 4, no early stop,
    /// validation on).
    pub fn new(timeout: Duration) -> Self {
        BatchOptions {
            max_concurrency: 4,
            stop_on_first_failure: false,
            timeout,
            validate_payloads: true,
        }
    }

    /// Override the concurrency bound (floored at 1).
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Stop issuing further Sets once one has failed.
    pub fn with_stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }
}

/// One item in a [`super::engine::Engine::batch_set`] call.
#[derive(Clone, Debug)]
pub struct BatchSetItem {
    /// The resource to write.
    pub resource: String,
    /// The body to write.
    pub body: Vec<u8>,
}

/// A notification delivered on the engine's notification stream (§4.6,
/// point 4).
#[derive(Clone, Debug)]
pub struct Notification {
    /// The subscription this notification belongs to.
    pub subscribe_id: String,
    /// The subscribed resource.
    pub resource: String,
    /// The notification body.
    pub data: Vec<u8>,
}
