//! UMP ↔ MIDI 1.0 SysEx7 translator (C3): converts between `F0…F7` byte
//! streams and sequences of UMP Data-64 packets, with group-keyed stateful
//! reassembly of Start/Continue/End sequences.
//!
//! A Data-64 packet is two 32-bit words:
//! `word0 = mt<<28 | group<<24 | status<<20 | numBytes<<16 | b0<<8 | b1`,
//! `word1 = b2<<24 | b3<<16 | b4<<8 | b5`. Only the first `numBytes` of the
//! six payload byte slots are meaningful.

/// The UMP message-type nibble used for SysEx7 Data-64 packets.
pub const DATA64_MESSAGE_TYPE: u8 = 0xD;

/// Default cap on a single group's in-progress reassembly buffer. Large
/// enough for any realistic SysEx payload; overflow discards the buffer
/// rather than growing unbounded.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 65536;

/// Data-64 packet status nibble.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
#[repr(u8)]
pub enum Status {
    /// The whole SysEx payload fits in one packet.
    Complete = 0,
    /// First packet of a multi-packet sequence.
    Start = 1,
    /// A middle packet of a multi-packet sequence.
    Continue = 2,
    /// The last packet of a multi-packet sequence.
    End = 3,
}

impl Status {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Status::Complete),
            1 => Some(Status::Start),
            2 => Some(Status::Continue),
            3 => Some(Status::End),
            _ => None,
        }
    }
}

/// One UMP Data-64 packet: a group, a status, and up to 6 payload bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Data64Packet {
    /// UMP group, `0..16`.
    pub group: u8,
    /// Packet status (Complete/Start/Continue/End).
    pub status: Status,
    /// The payload bytes carried by this packet (length `0..=6`).
    pub bytes: [u8; 6],
    /// How many of `bytes` are valid, `0..=6`.
    pub num_bytes: u8,
}

impl Data64Packet {
    fn payload(&self) -> &[u8] {
        &self.bytes[..self.num_bytes as usize]
    }

    /// Pack into the two 32-bit UMP words.
    pub fn to_words(&self) -> [u32; 2] {
        let b = self.bytes;
        let word0 = (DATA64_MESSAGE_TYPE as u32) << 28
            | (self.group as u32) << 24
            | (self.status as u32) << 20
            | (self.num_bytes as u32) << 16
            | (b[0] as u32) << 8
            | (b[1] as u32);
        let word1 = (b[2] as u32) << 24 | (b[3] as u32) << 16 | (b[4] as u32) << 8 | (b[5] as u32);
        [word0, word1]
    }

    /// Parse from two 32-bit UMP words. Returns `None` if the message type
    /// nibble isn't Data-64, the status nibble is out of range, or
    /// `numBytes` exceeds 6.
    pub fn from_words(words: [u32; 2]) -> Option<Self> {
        let [word0, word1] = words;
        let bytes0 = word0.to_be_bytes();
        let message_type = bytes0[0] >> 4;
        if message_type != DATA64_MESSAGE_TYPE {
            return None;
        }
        let group = bytes0[0] & 0x0F;
        let status = Status::from_raw(bytes0[1] >> 4)?;
        let num_bytes = bytes0[1] & 0x0F;
        if num_bytes > 6 {
            return None;
        }
        let bytes1 = word1.to_be_bytes();
        let bytes = [bytes0[2], bytes0[3], bytes1[0], bytes1[1], bytes1[2], bytes1[3]];
        Some(Data64Packet {
            group,
            status,
            bytes,
            num_bytes,
        })
    }
}

/// Split a `F0…F7`-framed SysEx byte stream into a sequence of Data-64
/// packets for the given UMP group. The leading `F0` and trailing `F7` are
/// stripped; everything between them is chunked into packets of up to 6
/// bytes. A payload of 6 bytes or fewer becomes a single `Complete` packet;
/// longer payloads become `Start`, zero or more `Continue`, and one `End`.
pub fn from_midi1_sysex(bytes: &[u8], group: u8) -> Vec<Data64Packet> {
    let inner = strip_sysex_frame(bytes);
    let chunks: Vec<&[u8]> = inner.chunks(6).collect();
    if chunks.len() <= 1 {
        let payload = chunks.first().copied().unwrap_or(&[]);
        return vec![make_packet(group, Status::Complete, payload)];
    }
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let status = if i == 0 {
                Status::Start
            } else if i == last {
                Status::End
            } else {
                Status::Continue
            };
            make_packet(group, status, chunk)
        })
        .collect()
}

fn strip_sysex_frame(bytes: &[u8]) -> &[u8] {
    let start = if bytes.first() == Some(&0xF0) { 1 } else { 0 };
    let end = if bytes.last() == Some(&0xF7) {
        bytes.len() - 1
    } else {
        bytes.len()
    };
    if start > end {
        &[]
    } else {
        &bytes[start..end]
    }
}

fn make_packet(group: u8, status: Status, payload: &[u8]) -> Data64Packet {
    let mut bytes = [0u8; 6];
    let n = payload.len().min(6);
    bytes[..n].copy_from_slice(&payload[..n]);
    Data64Packet {
        group,
        status,
        bytes,
        num_bytes: n as u8,
    }
}

/// Group-keyed stateful assembler that reverses [`from_midi1_sysex`]:
/// feed it packets in arrival order and it yields whole `F0…F7` SysEx
/// messages as their End (or Complete) packet arrives.
#[derive(Debug)]
pub struct Sysex7Assembler {
    max_buffer_size: usize,
    buffers: std::collections::HashMap<u8, Vec<u8>>,
}

impl Sysex7Assembler {
    /// Construct an assembler with the default buffer cap.
    pub fn new() -> Self {
        Self::with_max_buffer_size(DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Construct an assembler with an explicit per-group buffer cap.
    pub fn with_max_buffer_size(max_buffer_size: usize) -> Self {
        Self {
            max_buffer_size,
            buffers: std::collections::HashMap::new(),
        }
    }

    /// Feed one Data-64 packet. Returns a whole `F0…F7` SysEx message when
    /// this packet completes one (Complete, or a terminating End),
    /// otherwise `None`.
    pub fn process(&mut self, packet: &Data64Packet) -> Option<Vec<u8>> {
        match packet.status {
            Status::Complete => Some(frame(packet.payload())),
            Status::Start => {
                self.buffers.insert(packet.group, packet.payload().to_vec());
                None
            }
            Status::Continue => {
                if let Some(buf) = self.buffers.get_mut(&packet.group) {
                    buf.extend_from_slice(packet.payload());
                    if buf.len() > self.max_buffer_size {
                        self.buffers.remove(&packet.group);
                    }
                }
                None
            }
            Status::End => match self.buffers.remove(&packet.group) {
                Some(mut buf) => {
                    buf.extend_from_slice(packet.payload());
                    if buf.len() > self.max_buffer_size {
                        None
                    } else {
                        Some(frame(&buf))
                    }
                }
                None => None,
            },
        }
    }

    /// Discard any in-progress buffer for a group, e.g. after a transport
    /// reset.
    pub fn reset_group(&mut self, group: u8) {
        self.buffers.remove(&group);
    }
}

impl Default for Sysex7Assembler {
    fn default() -> Self {
        Self::new()
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(0xF0);
    out.extend_from_slice(payload);
    out.push(0xF7);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seven_byte_payload_splits_into_start_and_end() {
        let bytes = [0xF0, 1, 2, 3, 4, 5, 6, 7, 0xF7];
        let packets = from_midi1_sysex(&bytes, 0);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].status, Status::Start);
        assert_eq!(packets[0].num_bytes, 6);
        assert_eq!(&packets[0].bytes, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(packets[1].status, Status::End);
        assert_eq!(packets[1].num_bytes, 1);
        assert_eq!(packets[1].bytes[0], 7);
    }

    #[test]
    fn short_payload_is_one_complete_packet() {
        let bytes = [0xF0, 1, 2, 3, 0xF7];
        let packets = from_midi1_sysex(&bytes, 2);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].status, Status::Complete);
        assert_eq!(packets[0].num_bytes, 3);
    }

    #[test]
    fn word_roundtrip() {
        let packet = make_packet(5, Status::Continue, &[9, 8, 7]);
        let words = packet.to_words();
        assert_eq!(Data64Packet::from_words(words), Some(packet));
    }

    #[test]
    fn assembler_reassembles_start_continue_end() {
        let original = [0xF0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 0xF7];
        let packets = from_midi1_sysex(&original, 3);
        assert_eq!(packets.len(), 3); // Start(6) + Continue(6) + End(0)
        let mut assembler = Sysex7Assembler::new();
        let mut result = None;
        for packet in &packets {
            result = assembler.process(packet).or(result);
        }
        assert_eq!(result, Some(original.to_vec()));
    }

    #[test]
    fn groups_are_independent() {
        let mut assembler = Sysex7Assembler::new();
        let group0 = from_midi1_sysex(&[0xF0, 1, 2, 3, 4, 5, 6, 7, 0xF7], 0);
        let group1 = from_midi1_sysex(&[0xF0, 9, 9, 9, 9, 9, 9, 9, 0xF7], 1);
        assert_eq!(assembler.process(&group0[0]), None);
        assert_eq!(assembler.process(&group1[0]), None);
        let out1 = assembler.process(&group1[1]).unwrap();
        let out0 = assembler.process(&group0[1]).unwrap();
        assert_eq!(out1, vec![0xF0, 9, 9, 9, 9, 9, 9, 9, 0xF7]);
        assert_eq!(out0, vec![0xF0, 1, 2, 3, 4, 5, 6, 7, 0xF7]);
    }

    #[test]
    fn continue_or_end_without_start_yields_nothing() {
        let mut assembler = Sysex7Assembler::new();
        let lone_continue = make_packet(0, Status::Continue, &[1, 2, 3]);
        assert_eq!(assembler.process(&lone_continue), None);
        let lone_end = make_packet(0, Status::End, &[1, 2, 3]);
        assert_eq!(assembler.process(&lone_end), None);
    }

    #[test]
    fn overflowing_buffer_is_discarded() {
        let mut assembler = Sysex7Assembler::with_max_buffer_size(4);
        let start = make_packet(0, Status::Start, &[1, 2, 3, 4, 5]);
        assembler.process(&start);
        let end = make_packet(0, Status::End, &[6]);
        assert_eq!(assembler.process(&end), None);
    }
}
