//! Device identity and category-support types shared by Discovery (§4.7) and
//! the CI wire codec (§4.1).
use std::time::Instant;

use crate::muid::MUID;

/// The CI version byte this crate sends on every outgoing message (MIDI-CI
/// version 1.2).
pub const CI_VERSION: u8 = 0x02;

/// `{manufacturer_id, family_id, model_id, version_id}` as carried by
/// Discovery messages. Wire form is always 11 bytes: manufacturer (3),
/// family (2, 14-bit), model (2, 14-bit), version (4, 28-bit packed).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Manufacturer SysEx ID, always stored as the 3-byte extended form on
    /// the wire; a single-byte code is represented here padded with zeros.
    pub manufacturer_id: [u8; 3],
    /// 14-bit device family identifier.
    pub family_id: u16,
    /// 14-bit device model identifier.
    pub model_id: u16,
    /// 28-bit software/firmware/hardware revision.
    pub version_id: u32,
}

impl DeviceIdentity {
    /// Construct an identity with a single-byte manufacturer code, padded
    /// with zeros to the three-byte wire form.
    pub fn with_short_manufacturer(code: u8, family_id: u16, model_id: u16, version_id: u32) -> Self {
        Self {
            manufacturer_id: [code, 0, 0],
            family_id,
            model_id,
            version_id,
        }
    }

    /// Construct an identity with a three-byte extended manufacturer code.
    pub fn with_extended_manufacturer(
        code: [u8; 3],
        family_id: u16,
        model_id: u16,
        version_id: u32,
    ) -> Self {
        Self {
            manufacturer_id: code,
            family_id,
            model_id,
            version_id,
        }
    }
}

/// Category-support bitmask sent during Discovery. Bit positions are this
/// crate's own convention; what matters is that encode and decode agree.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Default)]
pub struct CategorySupport(u8);

impl CategorySupport {
    /// Bit for protocol negotiation support.
    pub const PROTOCOL_NEGOTIATION: u8 = 0b0000_0010;
    /// Bit for profile configuration support.
    pub const PROFILE_CONFIGURATION: u8 = 0b0000_0100;
    /// Bit for Property Exchange support.
    pub const PROPERTY_EXCHANGE: u8 = 0b0000_1000;
    /// Bit for Process Inquiry support.
    pub const PROCESS_INQUIRY: u8 = 0b0001_0000;

    /// An empty bitmask.
    pub const fn none() -> Self {
        CategorySupport(0)
    }

    /// Construct from a raw wire byte.
    pub const fn from_raw(byte: u8) -> Self {
        CategorySupport(byte)
    }

    /// The raw wire byte.
    pub const fn to_raw(self) -> u8 {
        self.0
    }

    /// Enable Property Exchange support.
    pub fn with_property_exchange(mut self) -> Self {
        self.0 |= Self::PROPERTY_EXCHANGE;
        self
    }

    /// Enable Process Inquiry support.
    pub fn with_process_inquiry(mut self) -> Self {
        self.0 |= Self::PROCESS_INQUIRY;
        self
    }

    /// Enable Profile Configuration support.
    pub fn with_profile_configuration(mut self) -> Self {
        self.0 |= Self::PROFILE_CONFIGURATION;
        self
    }

    /// Enable protocol negotiation support.
    pub fn with_protocol_negotiation(mut self) -> Self {
        self.0 |= Self::PROTOCOL_NEGOTIATION;
        self
    }

    /// Whether the device advertises Property Exchange.
    pub const fn supports_property_exchange(self) -> bool {
        self.0 & Self::PROPERTY_EXCHANGE != 0
    }

    /// Whether the device advertises Process Inquiry.
    pub const fn supports_process_inquiry(self) -> bool {
        self.0 & Self::PROCESS_INQUIRY != 0
    }

    /// Whether the device advertises Profile Configuration.
    pub const fn supports_profile_configuration(self) -> bool {
        self.0 & Self::PROFILE_CONFIGURATION != 0
    }
}

/// A device learned via Discovery, owned exclusively by the discovery
/// manager (C7).
#[derive(Clone, Debug)]
pub struct DiscoveredDevice {
    /// The device's MUID.
    pub muid: MUID,
    /// Identity reported in its Discovery Reply.
    pub identity: DeviceIdentity,
    /// Category-support bitmask reported in its Discovery Reply.
    pub category_support: CategorySupport,
    /// Maximum SysEx message size the device can receive.
    pub max_sysex_size: u32,
    /// Optional initiator-output-path, defaulting to 0 when absent (§9 Open
    /// Question 1).
    pub initiator_output_path: u8,
    /// Optional function-block, defaulting to 0 when absent (§9 Open
    /// Question 1).
    pub function_block: u8,
    /// Wall-clock instant this device was last heard from.
    pub last_seen: Instant,
}
