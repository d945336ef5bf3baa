//! Chunk assembler (C5): merges multi-chunk PE Reply/Notify payloads keyed
//! by request ID (replies) or `(source_muid, request_id)` (notifies).
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::muid::MUID;

/// Default assembly timeout for PE replies.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Default assembly timeout for PE notifications, which tend to arrive
/// less eagerly than request/reply pairs.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Key for a PE Reply assembly: the request ID alone, since a reply can
/// only be addressed to the request's own initiator.
pub type ReplyKey = u8;

/// Key for a PE Notify assembly: disambiguated by the notifying device's
/// MUID, since a notify's request ID is chosen by the responder.
pub type NotifyKey = (MUID, u8);

/// Outcome of feeding one chunk into the assembler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkResult {
    /// Not all chunks have arrived yet.
    Incomplete {
        /// Number of distinct chunks received so far.
        received: usize,
        /// Total chunks declared by the sender.
        total: u16,
    },
    /// Every declared chunk has arrived; `header`/`body` are the
    /// reassembled payload.
    Complete {
        /// Header bytes captured from the first chunk that sent a
        /// non-empty header.
        header: Vec<u8>,
        /// Property body, concatenated in ascending `this_chunk` order.
        body: Vec<u8>,
    },
}

struct Partial {
    header: Vec<u8>,
    chunks: HashMap<u16, Vec<u8>>,
    num_chunks: u16,
    first_seen: Instant,
}

/// A generic chunk assembler parameterized over its key type, so replies
/// (`ReplyKey`) and notifies (`NotifyKey`) can each use their own keyed
/// instance (§4.5, §3).
pub struct ChunkAssembler<K> {
    timeout: Duration,
    partials: HashMap<K, Partial>,
}

impl<K: Eq + Hash + Clone> ChunkAssembler<K> {
    /// Construct an assembler with the given assembly timeout.
    pub fn new(timeout: Duration) -> Self {
        ChunkAssembler {
            timeout,
            partials: HashMap::new(),
        }
    }

    /// Feed one chunk. `header` is the chunk's header slice (possibly
    /// empty); `property` is its slice of the property body.
    pub fn add_chunk(
        &mut self,
        key: K,
        this_chunk: u16,
        num_chunks: u16,
        header: &[u8],
        property: &[u8],
        now: Instant,
    ) -> ChunkResult {
        let partial = self.partials.entry(key.clone()).or_insert_with(|| Partial {
            header: Vec::new(),
            chunks: HashMap::new(),
            num_chunks,
            first_seen: now,
        });
        if partial.header.is_empty() && !header.is_empty() {
            partial.header = header.to_vec();
        }
        partial.chunks.insert(this_chunk, property.to_vec());

        if partial.chunks.len() as u16 >= partial.num_chunks {
            let partial = self.partials.remove(&key).expect("just inserted above");
            let mut indices: Vec<&u16> = partial.chunks.keys().collect();
            indices.sort_unstable();
            let mut body = Vec::new();
            for idx in indices {
                body.extend_from_slice(&partial.chunks[idx]);
            }
            ChunkResult::Complete {
                header: partial.header,
                body,
            }
        } else {
            let partial = &self.partials[&key];
            ChunkResult::Incomplete {
                received: partial.chunks.len(),
                total: partial.num_chunks,
            }
        }
    }

    /// Scan for assemblies that have exceeded the timeout, remove them, and
    /// return their keys.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<K> {
        let expired: Vec<K> = self
            .partials
            .iter()
            .filter(|(_, partial)| now.saturating_duration_since(partial.first_seen) > self.timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.partials.remove(key);
        }
        expired
    }

    /// Number of assemblies currently pending.
    pub fn pending_count(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_chunks_assemble_in_order() {
        let mut assembler: ChunkAssembler<ReplyKey> = ChunkAssembler::new(DEFAULT_REPLY_TIMEOUT);
        let now = Instant::now();
        assembler.add_chunk(1, 2, 3, b"", b"B", now);
        assembler.add_chunk(1, 1, 3, b"{}", b"A", now);
        let result = assembler.add_chunk(1, 3, 3, b"", b"C", now);
        assert_eq!(
            result,
            ChunkResult::Complete {
                header: b"{}".to_vec(),
                body: b"ABC".to_vec(),
            }
        );
    }

    #[test]
    fn duplicate_chunk_overwrites_and_completes_once() {
        let mut assembler: ChunkAssembler<ReplyKey> = ChunkAssembler::new(DEFAULT_REPLY_TIMEOUT);
        let now = Instant::now();
        assembler.add_chunk(1, 1, 2, b"{}", b"A", now);
        assembler.add_chunk(1, 1, 2, b"", b"A", now);
        let result = assembler.add_chunk(1, 2, 2, b"", b"B", now);
        assert_eq!(
            result,
            ChunkResult::Complete {
                header: b"{}".to_vec(),
                body: b"AB".to_vec(),
            }
        );
    }

    #[test]
    fn missing_chunk_times_out_with_no_residual_entry() {
        let mut assembler: ChunkAssembler<ReplyKey> = ChunkAssembler::new(Duration::from_millis(10));
        let t0 = Instant::now();
        assembler.add_chunk(7, 1, 3, b"{}", b"A", t0);
        assembler.add_chunk(7, 3, 3, b"", b"C", t0);
        assert_eq!(assembler.pending_count(), 1);
        let expired = assembler.poll_timeouts(t0 + Duration::from_millis(20));
        assert_eq!(expired, vec![7u8]);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn notify_key_disambiguates_by_muid() {
        let mut assembler: ChunkAssembler<NotifyKey> = ChunkAssembler::new(DEFAULT_NOTIFY_TIMEOUT);
        let now = Instant::now();
        let a = (MUID::new(1), 5u8);
        let b = (MUID::new(2), 5u8);
        assembler.add_chunk(a, 1, 1, b"{}", b"from-a", now);
        let result = assembler.add_chunk(b, 1, 1, b"{}", b"from-b", now);
        assert_eq!(
            result,
            ChunkResult::Complete {
                header: b"{}".to_vec(),
                body: b"from-b".to_vec(),
            }
        );
    }

    #[test]
    fn header_captured_on_first_non_empty_chunk() {
        let mut assembler: ChunkAssembler<ReplyKey> = ChunkAssembler::new(DEFAULT_REPLY_TIMEOUT);
        let now = Instant::now();
        assembler.add_chunk(3, 1, 2, b"", b"A", now);
        let result = assembler.add_chunk(3, 2, 2, b"{\"status\":200}", b"B", now);
        assert_eq!(
            result,
            ChunkResult::Complete {
                header: b"{\"status\":200}".to_vec(),
                body: b"AB".to_vec(),
            }
        );
    }
}
