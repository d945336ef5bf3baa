//! SysEx reassembler (C2): merges fragmented transport packets into whole
//! `F0…F7` MIDI 1.0 System Exclusive messages.
//!
//! The reassembler is single-threaded and strictly order-preserving: it
//! trusts the caller to feed packets from one transport delivery in arrival
//! order and to serialize concurrent deliveries (§4.2).

/// Reassembles a byte stream of one or more SysEx messages, tolerating
/// arbitrary fragmentation boundaries.
#[derive(Debug, Default)]
pub struct SysexReassembler {
    buffer: Vec<u8>,
    buffering: bool,
}

impl SysexReassembler {
    /// Construct an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport packet's bytes, scanning byte-by-byte. Returns
    /// every whole `F0…F7` message completed by this packet, in order.
    pub fn feed(&mut self, packet: &[u8]) -> Vec<Vec<u8>> {
        let mut completed = Vec::new();
        for &byte in packet {
            match byte {
                0xF0 => {
                    self.buffer.clear();
                    self.buffer.push(byte);
                    self.buffering = true;
                }
                0xF7 if self.buffering => {
                    self.buffer.push(byte);
                    completed.push(std::mem::take(&mut self.buffer));
                    self.buffering = false;
                }
                _ if self.buffering => {
                    self.buffer.push(byte);
                }
                _ => {
                    // Not buffering and not a start byte: ignore.
                }
            }
        }
        completed
    }

    /// Whether a SysEx message is currently in progress.
    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Discard any in-progress message without emitting it.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffering = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_message_in_one_packet() {
        let mut r = SysexReassembler::new();
        let out = r.feed(&[0xF0, 0x01, 0x02, 0xF7]);
        assert_eq!(out, vec![vec![0xF0, 0x01, 0x02, 0xF7]]);
        assert!(!r.is_buffering());
    }

    #[test]
    fn message_split_across_packets() {
        let mut r = SysexReassembler::new();
        assert_eq!(r.feed(&[0xF0, 0x01, 0x02]), Vec::<Vec<u8>>::new());
        assert!(r.is_buffering());
        let out = r.feed(&[0x03, 0xF7]);
        assert_eq!(out, vec![vec![0xF0, 0x01, 0x02, 0x03, 0xF7]]);
    }

    #[test]
    fn new_start_overrides_in_progress_message() {
        let mut r = SysexReassembler::new();
        r.feed(&[0xF0, 0x01, 0x02]);
        let out = r.feed(&[0xF0, 0xAA, 0xF7]);
        assert_eq!(out, vec![vec![0xF0, 0xAA, 0xF7]]);
    }

    #[test]
    fn bytes_outside_a_message_are_ignored() {
        let mut r = SysexReassembler::new();
        let out = r.feed(&[0x90, 0x40, 0x7F, 0xF0, 0x01, 0xF7, 0x80]);
        assert_eq!(out, vec![vec![0xF0, 0x01, 0xF7]]);
    }

    #[test]
    fn multiple_messages_in_one_packet() {
        let mut r = SysexReassembler::new();
        let out = r.feed(&[0xF0, 0x01, 0xF7, 0xF0, 0x02, 0x03, 0xF7]);
        assert_eq!(
            out,
            vec![vec![0xF0, 0x01, 0xF7], vec![0xF0, 0x02, 0x03, 0xF7]]
        );
    }

    #[test]
    fn order_preserved_across_arbitrary_partitioning() {
        let whole: Vec<u8> = {
            let mut v = vec![0xF0];
            v.extend(1u8..=40);
            v.push(0xF7);
            v
        };
        for chunk_len in 1..=5 {
            let mut r = SysexReassembler::new();
            let mut out = Vec::new();
            for chunk in whole.chunks(chunk_len) {
                out.extend(r.feed(chunk));
            }
            assert_eq!(out, vec![whole.clone()], "chunk_len={chunk_len}");
        }
    }

    #[test]
    fn trailing_bytes_without_f7_stay_buffered() {
        let mut r = SysexReassembler::new();
        let out = r.feed(&[0xF0, 0x01, 0x02]);
        assert!(out.is_empty());
        assert!(r.is_buffering());
    }
}
