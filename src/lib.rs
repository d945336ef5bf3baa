#![deny(missing_docs)]
//! Client-side MIDI-CI (Capability Inquiry) and Property Exchange over
//! Universal MIDI Packets and legacy MIDI 1.0 System Exclusive framing.
pub mod chunk;
pub mod ci;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod muid;
pub mod orchestrator;
pub mod pe;
pub mod reqid;
pub mod sysex;
pub mod transport;
pub mod ump;
