//! The error taxonomy surfaced to PE callers (§6.4): a sum type, not a
//! class hierarchy, with accessors the caller uses to decide whether and
//! how to retry.
use std::time::Duration;

use thiserror::Error;

/// Status-detail codepoint carried by a NAK's `status_data` byte.
pub const NAK_DETAIL_BUSY: u8 = 0x01;
/// Status-detail codepoint for "resource not found".
pub const NAK_DETAIL_NOT_FOUND: u8 = 0x02;

/// Why a [`PEError::ValidationFailed`] was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationKind {
    /// `resource` was empty.
    EmptyResource,
    /// A `Set` request carried no body.
    MissingBody,
    /// `channel` didn't fit a MIDI-channel index (`0..=127`).
    InvalidChannel(u16),
}

impl std::fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationKind::EmptyResource => write!(f, "resource must not be empty"),
            ValidationKind::MissingBody => write!(f, "set requires a body"),
            ValidationKind::InvalidChannel(n) => write!(f, "invalid channel {n}"),
        }
    }
}

/// The logical error kinds a PE operation can resolve with (§6.4, §7).
#[derive(Clone, Debug, Error)]
pub enum PEError {
    /// No reply arrived before the request's deadline.
    #[error("timed out waiting for a reply for resource {resource:?}")]
    Timeout {
        /// The resource the timed-out request targeted.
        resource: String,
    },
    /// The caller's wait was cancelled, or `stop()` tore the transaction
    /// down. Never logged as an error — this is expected control flow (§7).
    #[error("request was cancelled")]
    Cancelled,
    /// The device sent a NAK instead of a reply.
    #[error("device NAK'd the request (status_data={status_data:#04x})")]
    Nak {
        /// The NAK's coarse status code.
        status_code: u8,
        /// The NAK's status-detail codepoint.
        status_data: u8,
    },
    /// The PE reply header carried a 4xx/5xx `status`.
    #[error("device reported status {status}{}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    DeviceError {
        /// HTTP-style status code from the reply header.
        status: u16,
        /// Optional human-readable message from the reply header.
        message: Option<String>,
    },
    /// The transport reported a send or connectivity failure.
    #[error("transport error: {cause}")]
    TransportError {
        /// Description of the transport-level failure.
        cause: String,
    },
    /// A client-side validation invariant was violated before anything was
    /// sent.
    #[error("validation failed: {kind}")]
    ValidationFailed {
        /// Which invariant failed.
        kind: ValidationKind,
    },
    /// A reply or notification didn't structurally make sense (e.g. failed
    /// to parse as the expected JSON shape).
    #[error("invalid response: {reason}")]
    InvalidResponse {
        /// Description of why the response was rejected.
        reason: String,
    },
    /// A 2xx reply carried an empty body for a resource the caller expected
    /// to be non-empty.
    #[error("empty response for resource {resource:?}")]
    EmptyResponse {
        /// The resource that answered empty.
        resource: String,
    },
    /// The request-ID pool had no available slot; the request was never
    /// sent.
    #[error("request-ID pool is near exhaustion")]
    NearExhaustion,
}

impl PEError {
    /// Whether retrying the same request might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PEError::Timeout { .. } => true,
            PEError::Cancelled => false,
            PEError::Nak { status_data, .. } => *status_data == NAK_DETAIL_BUSY,
            PEError::DeviceError { status, .. } => (500..600).contains(status),
            PEError::TransportError { .. } => true,
            PEError::ValidationFailed { .. } => false,
            PEError::InvalidResponse { .. } => false,
            PEError::EmptyResponse { .. } => false,
            PEError::NearExhaustion => true,
        }
    }

    /// Whether the failure originated from caller-side input, not the
    /// device or transport.
    pub fn is_client_error(&self) -> bool {
        match self {
            PEError::ValidationFailed { .. } => true,
            PEError::DeviceError { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }

    /// Whether the device itself reported the failure.
    pub fn is_device_error(&self) -> bool {
        matches!(self, PEError::DeviceError { .. } | PEError::Nak { .. })
    }

    /// Whether the failure came from the transport layer rather than the
    /// protocol.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, PEError::TransportError { .. })
    }

    /// A suggested delay before retrying, or `None` if retrying isn't
    /// sensible.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        if !self.is_retryable() {
            return None;
        }
        match self {
            PEError::Nak { .. } => Some(Duration::from_millis(250)),
            PEError::TransportError { .. } => Some(Duration::from_millis(100)),
            PEError::NearExhaustion => Some(Duration::from_millis(500)),
            _ => Some(Duration::from_millis(50)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nak_busy_is_retryable_not_found_is_not() {
        let busy = PEError::Nak {
            status_code: 0x01,
            status_data: NAK_DETAIL_BUSY,
        };
        let not_found = PEError::Nak {
            status_code: 0x01,
            status_data: NAK_DETAIL_NOT_FOUND,
        };
        assert!(busy.is_retryable());
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn device_error_5xx_is_retryable_4xx_is_not() {
        let server = PEError::DeviceError {
            status: 503,
            message: None,
        };
        let client = PEError::DeviceError {
            status: 404,
            message: None,
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(client.is_client_error());
        assert!(server.is_device_error());
    }

    #[test]
    fn validation_failed_is_never_retryable() {
        let err = PEError::ValidationFailed {
            kind: ValidationKind::InvalidChannel(200),
        };
        assert!(!err.is_retryable());
        assert!(err.is_client_error());
        assert_eq!(err.suggested_retry_delay(), None);
    }

    #[test]
    fn cancelled_has_no_retry_delay() {
        assert_eq!(PEError::Cancelled.suggested_retry_delay(), None);
    }
}
