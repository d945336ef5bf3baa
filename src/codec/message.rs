//! The `CiMessage` tagged union: every MIDI-CI SysEx message this crate
//! sends or understands, plus its bit-exact wire encoding.
//!
//! All messages share the frame
//! `F0 7E 7F 0D <type> <ci_version> <srcMUID:4> <dstMUID:4> <payload> F7`.
//! Parsing is lenient at the edges: a truncated or malformed frame yields
//! `None` rather than panicking (§7).
use crate::ci::{CategorySupport, DeviceIdentity};
use crate::muid::MUID;

use super::{decode14, encode14};

/// Discovery Inquiry message type byte.
pub const DISCOVERY_INQUIRY: u8 = 0x70;
/// Discovery Reply message type byte.
pub const DISCOVERY_REPLY: u8 = 0x71;
/// InvalidateMUID message type byte.
pub const INVALIDATE_MUID: u8 = 0x7E;
/// NAK message type byte.
pub const NAK: u8 = 0x7F;
/// PE Capability Inquiry message type byte.
pub const PE_CAPABILITY_INQUIRY: u8 = 0x30;
/// PE Capability Reply message type byte.
pub const PE_CAPABILITY_REPLY: u8 = 0x31;
/// PE Get Inquiry message type byte.
pub const PE_GET_INQUIRY: u8 = 0x34;
/// PE Get Reply message type byte.
pub const PE_GET_REPLY: u8 = 0x35;
/// PE Set message type byte.
pub const PE_SET: u8 = 0x36;
/// PE Set Reply message type byte.
pub const PE_SET_REPLY: u8 = 0x37;
/// PE Subscribe message type byte.
pub const PE_SUBSCRIBE: u8 = 0x38;
/// PE Subscribe Reply message type byte.
pub const PE_SUBSCRIBE_REPLY: u8 = 0x39;
/// PE Notify message type byte.
pub const PE_NOTIFY: u8 = 0x3F;

const SYSEX_START: u8 = 0xF0;
const UNIVERSAL_NON_REALTIME: u8 = 0x7E;
const SUB_ID_CI: u8 = 0x7F;
const SUB_ID2_CI: u8 = 0x0D;
const SYSEX_END: u8 = 0xF7;

/// A fully parsed NAK body. Each optional tail segment is only present if
/// all fields preceding it were present in the wire buffer (§4.1, §7, §8).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NakPayload {
    /// The request ID being negatively acknowledged.
    pub orig_tx: u8,
    /// Coarse status code.
    pub status_code: u8,
    /// Status detail codepoint (e.g. busy = 0x01, not-found = 0x02).
    pub status_data: u8,
    /// Five detail bytes, present only if the buffer had room.
    pub details: Option<[u8; 5]>,
    /// A human-readable message, present only if the declared length fit in
    /// the remaining buffer.
    pub message: Option<String>,
}

/// Common fields of a Discovery Inquiry/Reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryPayload {
    /// Identity of the sending device.
    pub identity: DeviceIdentity,
    /// Category-support bitmask of the sending device.
    pub category_support: CategorySupport,
    /// Maximum SysEx size the sending device can receive.
    pub max_sysex_size: u32,
    /// Initiator output path (defaults to 0 when the sender omits it).
    pub initiator_output_path: u8,
    /// Function block (defaults to 0 when the sender omits it).
    pub function_block: u8,
}

/// Common fields of any PE message that carries a chunked header/property
/// body (everything except Get Inquiry).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeChunkPayload {
    /// The request ID this message belongs to.
    pub request_id: u8,
    /// The header JSON bytes (may be empty on non-first chunks).
    pub header: Vec<u8>,
    /// Total number of chunks in this reply/notification.
    pub num_chunks: u16,
    /// 1-based index of this chunk.
    pub this_chunk: u16,
    /// This chunk's slice of the property body.
    pub property: Vec<u8>,
}

/// Every MIDI-CI message this crate sends or understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CiMessage {
    /// `0x70` — broadcast/targeted Discovery Inquiry.
    DiscoveryInquiry {
        /// Source MUID.
        source: MUID,
        /// Destination MUID (broadcast for Discovery Inquiry).
        dest: MUID,
        /// CI version byte (`0x01` or `0x02`).
        ci_version: u8,
        /// The inquiry body.
        payload: DiscoveryPayload,
    },
    /// `0x71` — Discovery Reply.
    DiscoveryReply {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The reply body.
        payload: DiscoveryPayload,
    },
    /// `0x7E` — MUID collision resolution.
    InvalidateMuid {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The MUID being invalidated.
        target: MUID,
    },
    /// `0x7F` — negative acknowledgement.
    Nak {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The NAK body.
        payload: NakPayload,
    },
    /// `0x30` — PE Capability Inquiry.
    PeCapabilityInquiry {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// Max simultaneous requests the initiator can have in flight.
        max_simultaneous_requests: u8,
        /// PE major version.
        major_version: u8,
        /// PE minor version.
        minor_version: u8,
    },
    /// `0x31` — PE Capability Reply.
    PeCapabilityReply {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// Max simultaneous requests the responder supports.
        max_simultaneous_requests: u8,
        /// PE major version.
        major_version: u8,
        /// PE minor version.
        minor_version: u8,
    },
    /// `0x34` — PE Get Inquiry. Deliberately carries no chunk fields.
    PeGetInquiry {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The request ID this inquiry allocates.
        request_id: u8,
        /// The request header JSON bytes.
        header: Vec<u8>,
    },
    /// `0x35` — PE Get Reply.
    PeGetReply {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The chunked body.
        payload: PeChunkPayload,
    },
    /// `0x36` — PE Set. Chunked symmetrically with Get Reply so large
    /// bodies can be split across multiple Set messages (§9 Open
    /// Question 3).
    PeSet {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The chunked body.
        payload: PeChunkPayload,
    },
    /// `0x37` — PE Set Reply.
    PeSetReply {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The chunked body.
        payload: PeChunkPayload,
    },
    /// `0x38` — PE Subscribe.
    PeSubscribe {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The chunked body.
        payload: PeChunkPayload,
    },
    /// `0x39` — PE Subscribe Reply.
    PeSubscribeReply {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The chunked body.
        payload: PeChunkPayload,
    },
    /// `0x3F` — PE Notify (subscription update).
    PeNotify {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The chunked body.
        payload: PeChunkPayload,
    },
    /// Any message type this crate does not act on (e.g. Process Inquiry
    /// `0x40`-`0x44`, profile configuration). Kept as an opaque payload so
    /// the receive loop can log and drop it rather than fail the whole
    /// frame.
    Unknown {
        /// Source MUID.
        source: MUID,
        /// Destination MUID.
        dest: MUID,
        /// CI version byte.
        ci_version: u8,
        /// The raw message type byte.
        message_type: u8,
        /// The raw payload bytes (between dstMUID and the terminator).
        payload: Vec<u8>,
    },
}

impl CiMessage {
    /// Serialize to a complete `F0…F7` SysEx buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (message_type, source, dest, ci_version, payload) = match self {
            CiMessage::DiscoveryInquiry {
                source,
                dest,
                ci_version,
                payload,
            } => (
                DISCOVERY_INQUIRY,
                *source,
                *dest,
                *ci_version,
                encode_discovery(payload),
            ),
            CiMessage::DiscoveryReply {
                source,
                dest,
                ci_version,
                payload,
            } => (
                DISCOVERY_REPLY,
                *source,
                *dest,
                *ci_version,
                encode_discovery(payload),
            ),
            CiMessage::InvalidateMuid {
                source,
                dest,
                ci_version,
                target,
            } => (
                INVALIDATE_MUID,
                *source,
                *dest,
                *ci_version,
                target.pack().to_vec(),
            ),
            CiMessage::Nak {
                source,
                dest,
                ci_version,
                payload,
            } => (NAK, *source, *dest, *ci_version, encode_nak(payload)),
            CiMessage::PeCapabilityInquiry {
                source,
                dest,
                ci_version,
                max_simultaneous_requests,
                major_version,
                minor_version,
            } => (
                PE_CAPABILITY_INQUIRY,
                *source,
                *dest,
                *ci_version,
                vec![*max_simultaneous_requests, *major_version, *minor_version],
            ),
            CiMessage::PeCapabilityReply {
                source,
                dest,
                ci_version,
                max_simultaneous_requests,
                major_version,
                minor_version,
            } => (
                PE_CAPABILITY_REPLY,
                *source,
                *dest,
                *ci_version,
                vec![*max_simultaneous_requests, *major_version, *minor_version],
            ),
            CiMessage::PeGetInquiry {
                source,
                dest,
                ci_version,
                request_id,
                header,
            } => (
                PE_GET_INQUIRY,
                *source,
                *dest,
                *ci_version,
                encode_get_inquiry(*request_id, header),
            ),
            CiMessage::PeGetReply {
                source,
                dest,
                ci_version,
                payload,
            } => (PE_GET_REPLY, *source, *dest, *ci_version, encode_chunk(payload)),
            CiMessage::PeSet {
                source,
                dest,
                ci_version,
                payload,
            } => (PE_SET, *source, *dest, *ci_version, encode_chunk(payload)),
            CiMessage::PeSetReply {
                source,
                dest,
                ci_version,
                payload,
            } => (PE_SET_REPLY, *source, *dest, *ci_version, encode_chunk(payload)),
            CiMessage::PeSubscribe {
                source,
                dest,
                ci_version,
                payload,
            } => (PE_SUBSCRIBE, *source, *dest, *ci_version, encode_chunk(payload)),
            CiMessage::PeSubscribeReply {
                source,
                dest,
                ci_version,
                payload,
            } => (
                PE_SUBSCRIBE_REPLY,
                *source,
                *dest,
                *ci_version,
                encode_chunk(payload),
            ),
            CiMessage::PeNotify {
                source,
                dest,
                ci_version,
                payload,
            } => (PE_NOTIFY, *source, *dest, *ci_version, encode_chunk(payload)),
            CiMessage::Unknown {
                source,
                dest,
                ci_version,
                message_type,
                payload,
            } => (*message_type, *source, *dest, *ci_version, payload.clone()),
        };
        write_frame(message_type, ci_version, source, dest, &payload)
    }

    /// Parse a complete `F0…F7` SysEx buffer. Returns `None` on any
    /// structural failure (wrong prefix/terminator, truncated fields) per
    /// §7's lenient-parsing requirement.
    pub fn from_bytes(bytes: &[u8]) -> Option<CiMessage> {
        let (message_type, ci_version, source, dest, payload) = parse_frame(bytes)?;
        Some(match message_type {
            DISCOVERY_INQUIRY => CiMessage::DiscoveryInquiry {
                source,
                dest,
                ci_version,
                payload: decode_discovery(payload)?,
            },
            DISCOVERY_REPLY => CiMessage::DiscoveryReply {
                source,
                dest,
                ci_version,
                payload: decode_discovery(payload)?,
            },
            INVALIDATE_MUID => CiMessage::InvalidateMuid {
                source,
                dest,
                ci_version,
                target: decode_muid_payload(payload)?,
            },
            NAK => CiMessage::Nak {
                source,
                dest,
                ci_version,
                payload: decode_nak(payload)?,
            },
            PE_CAPABILITY_INQUIRY => {
                let (n, maj, min) = decode_capability(payload)?;
                CiMessage::PeCapabilityInquiry {
                    source,
                    dest,
                    ci_version,
                    max_simultaneous_requests: n,
                    major_version: maj,
                    minor_version: min,
                }
            }
            PE_CAPABILITY_REPLY => {
                let (n, maj, min) = decode_capability(payload)?;
                CiMessage::PeCapabilityReply {
                    source,
                    dest,
                    ci_version,
                    max_simultaneous_requests: n,
                    major_version: maj,
                    minor_version: min,
                }
            }
            PE_GET_INQUIRY => {
                let (request_id, header) = decode_get_inquiry(payload)?;
                CiMessage::PeGetInquiry {
                    source,
                    dest,
                    ci_version,
                    request_id,
                    header,
                }
            }
            PE_GET_REPLY => CiMessage::PeGetReply {
                source,
                dest,
                ci_version,
                payload: decode_chunk(payload)?,
            },
            PE_SET => CiMessage::PeSet {
                source,
                dest,
                ci_version,
                payload: decode_chunk(payload)?,
            },
            PE_SET_REPLY => CiMessage::PeSetReply {
                source,
                dest,
                ci_version,
                payload: decode_chunk(payload)?,
            },
            PE_SUBSCRIBE => CiMessage::PeSubscribe {
                source,
                dest,
                ci_version,
                payload: decode_chunk(payload)?,
            },
            PE_SUBSCRIBE_REPLY => CiMessage::PeSubscribeReply {
                source,
                dest,
                ci_version,
                payload: decode_chunk(payload)?,
            },
            PE_NOTIFY => CiMessage::PeNotify {
                source,
                dest,
                ci_version,
                payload: decode_chunk(payload)?,
            },
            other => CiMessage::Unknown {
                source,
                dest,
                ci_version,
                message_type: other,
                payload: payload.to_vec(),
            },
        })
    }

    /// The source MUID carried by any variant.
    pub fn source(&self) -> MUID {
        match self {
            CiMessage::DiscoveryInquiry { source, .. }
            | CiMessage::DiscoveryReply { source, .. }
            | CiMessage::InvalidateMuid { source, .. }
            | CiMessage::Nak { source, .. }
            | CiMessage::PeCapabilityInquiry { source, .. }
            | CiMessage::PeCapabilityReply { source, .. }
            | CiMessage::PeGetInquiry { source, .. }
            | CiMessage::PeGetReply { source, .. }
            | CiMessage::PeSet { source, .. }
            | CiMessage::PeSetReply { source, .. }
            | CiMessage::PeSubscribe { source, .. }
            | CiMessage::PeSubscribeReply { source, .. }
            | CiMessage::PeNotify { source, .. }
            | CiMessage::Unknown { source, .. } => *source,
        }
    }

    /// The destination MUID carried by any variant.
    pub fn dest(&self) -> MUID {
        match self {
            CiMessage::DiscoveryInquiry { dest, .. }
            | CiMessage::DiscoveryReply { dest, .. }
            | CiMessage::InvalidateMuid { dest, .. }
            | CiMessage::Nak { dest, .. }
            | CiMessage::PeCapabilityInquiry { dest, .. }
            | CiMessage::PeCapabilityReply { dest, .. }
            | CiMessage::PeGetInquiry { dest, .. }
            | CiMessage::PeGetReply { dest, .. }
            | CiMessage::PeSet { dest, .. }
            | CiMessage::PeSetReply { dest, .. }
            | CiMessage::PeSubscribe { dest, .. }
            | CiMessage::PeSubscribeReply { dest, .. }
            | CiMessage::PeNotify { dest, .. }
            | CiMessage::Unknown { dest, .. } => *dest,
        }
    }
}

fn write_frame(message_type: u8, ci_version: u8, source: MUID, dest: MUID, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(15 + payload.len());
    out.push(SYSEX_START);
    out.push(UNIVERSAL_NON_REALTIME);
    out.push(SUB_ID_CI);
    out.push(SUB_ID2_CI);
    out.push(message_type);
    out.push(ci_version);
    out.extend(source.pack());
    out.extend(dest.pack());
    out.extend_from_slice(payload);
    out.push(SYSEX_END);
    out
}

fn parse_frame(bytes: &[u8]) -> Option<(u8, u8, MUID, MUID, &[u8])> {
    // F0 7E 7F 0D type ver src(4) dst(4) = 14 mandatory bytes, plus F7.
    if bytes.len() < 15 {
        return None;
    }
    if bytes[0] != SYSEX_START
        || bytes[1] != UNIVERSAL_NON_REALTIME
        || bytes[2] != SUB_ID_CI
        || bytes[3] != SUB_ID2_CI
    {
        return None;
    }
    if *bytes.last()? != SYSEX_END {
        return None;
    }
    let message_type = bytes[4];
    let ci_version = bytes[5];
    let source = MUID::unpack(bytes[6..10].try_into().ok()?)?;
    let dest = MUID::unpack(bytes[10..14].try_into().ok()?)?;
    let payload = &bytes[14..bytes.len() - 1];
    Some((message_type, ci_version, source, dest, payload))
}

fn encode_discovery(p: &DiscoveryPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    out.extend(p.identity.manufacturer_id);
    out.extend(encode14(p.identity.family_id));
    out.extend(encode14(p.identity.model_id));
    out.extend(MUID::new(p.identity.version_id).pack());
    out.push(p.category_support.to_raw());
    out.extend(MUID::new(p.max_sysex_size).pack());
    out.push(p.initiator_output_path);
    out.push(p.function_block);
    out
}

fn decode_discovery(payload: &[u8]) -> Option<DiscoveryPayload> {
    if payload.len() < 16 {
        return None;
    }
    let manufacturer_id = [payload[0], payload[1], payload[2]];
    let family_id = decode14(payload[3], payload[4]);
    let model_id = decode14(payload[5], payload[6]);
    let version_id = MUID::unpack(payload[7..11].try_into().ok()?)?.value();
    let category_support = CategorySupport::from_raw(payload[11]);
    let max_sysex_size = MUID::unpack(payload[12..16].try_into().ok()?)?.value();
    let initiator_output_path = payload.get(16).copied().unwrap_or(0);
    let function_block = payload.get(17).copied().unwrap_or(0);
    Some(DiscoveryPayload {
        identity: DeviceIdentity {
            manufacturer_id,
            family_id,
            model_id,
            version_id,
        },
        category_support,
        max_sysex_size,
        initiator_output_path,
        function_block,
    })
}

fn decode_muid_payload(payload: &[u8]) -> Option<MUID> {
    if payload.len() < 4 {
        return None;
    }
    MUID::unpack(payload[0..4].try_into().ok()?)
}

fn encode_nak(p: &NakPayload) -> Vec<u8> {
    let mut out = vec![p.orig_tx, p.status_code, p.status_data];
    if let Some(details) = p.details {
        out.extend(details);
        if let Some(message) = &p.message {
            let bytes = message.as_bytes();
            out.extend(encode14(bytes.len() as u16));
            out.extend_from_slice(bytes);
        }
    }
    out
}

fn decode_nak(payload: &[u8]) -> Option<NakPayload> {
    if payload.len() < 3 {
        return None;
    }
    let orig_tx = payload[0];
    let status_code = payload[1];
    let status_data = payload[2];
    let mut details = None;
    let mut message = None;
    if payload.len() >= 8 {
        let mut buf = [0u8; 5];
        buf.copy_from_slice(&payload[3..8]);
        details = Some(buf);
        if payload.len() >= 10 {
            let msg_len = decode14(payload[8], payload[9]) as usize;
            if payload.len() >= 10 + msg_len {
                message = std::str::from_utf8(&payload[10..10 + msg_len])
                    .ok()
                    .map(str::to_string);
            }
        }
    }
    Some(NakPayload {
        orig_tx,
        status_code,
        status_data,
        details,
        message,
    })
}

fn decode_capability(payload: &[u8]) -> Option<(u8, u8, u8)> {
    if payload.len() < 3 {
        return None;
    }
    Some((payload[0], payload[1], payload[2]))
}

fn encode_get_inquiry(request_id: u8, header: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + header.len());
    out.push(request_id);
    out.extend(encode14(header.len() as u16));
    out.extend_from_slice(header);
    out
}

fn decode_get_inquiry(payload: &[u8]) -> Option<(u8, Vec<u8>)> {
    if payload.len() < 3 {
        return None;
    }
    let request_id = payload[0];
    let header_size = decode14(payload[1], payload[2]) as usize;
    if payload.len() < 3 + header_size {
        return None;
    }
    Some((request_id, payload[3..3 + header_size].to_vec()))
}

fn encode_chunk(p: &PeChunkPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + p.header.len() + p.property.len());
    out.push(p.request_id);
    out.extend(encode14(p.header.len() as u16));
    out.extend(encode14(p.num_chunks));
    out.extend(encode14(p.this_chunk));
    out.extend(encode14(p.property.len() as u16));
    out.extend_from_slice(&p.header);
    out.extend_from_slice(&p.property);
    out
}

fn decode_chunk(payload: &[u8]) -> Option<PeChunkPayload> {
    if payload.len() < 9 {
        return None;
    }
    let request_id = payload[0];
    let header_size = decode14(payload[1], payload[2]) as usize;
    let num_chunks = decode14(payload[3], payload[4]);
    let this_chunk = decode14(payload[5], payload[6]);
    let data_size = decode14(payload[7], payload[8]) as usize;
    if payload.len() < 9 + header_size + data_size {
        return None;
    }
    let header = payload[9..9 + header_size].to_vec();
    let property = payload[9 + header_size..9 + header_size + data_size].to_vec();
    Some(PeChunkPayload {
        request_id,
        header,
        num_chunks,
        this_chunk,
        property,
    })
}
