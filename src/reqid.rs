//! Request-ID pool (C4): allocates 7-bit PE request IDs with a post-release
//! cooldown so a late reply can't be confused with a fresh request reusing
//! the same ID.
use std::time::{Duration, Instant};

/// Number of request-ID slots (`[0, 127]`).
pub const SLOT_COUNT: usize = 128;

/// Default cooldown a released slot waits before it can be reacquired.
/// `0` disables cooldown entirely.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

/// Below this many available slots, [`RequestIdPool::is_near_exhaustion`]
/// reports true.
const NEAR_EXHAUSTION_THRESHOLD: usize = 10;

#[derive(Copy, Clone, Debug)]
struct Slot {
    occupied: bool,
    cooling_until: Option<Instant>,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            occupied: false,
            cooling_until: None,
        }
    }
}

/// A fixed 128-slot pool of request IDs. Not `Send`-shared directly; owners
/// wrap it in their own mutex per the one-owner-mutates discipline (§9).
#[derive(Debug)]
pub struct RequestIdPool {
    slots: [Slot; SLOT_COUNT],
    cursor: usize,
    cooldown: Duration,
}

impl RequestIdPool {
    /// Construct a pool with the default cooldown.
    pub fn new() -> Self {
        Self::with_cooldown(DEFAULT_COOLDOWN)
    }

    /// Construct a pool with an explicit cooldown (`Duration::ZERO` disables
    /// it).
    pub fn with_cooldown(cooldown: Duration) -> Self {
        RequestIdPool {
            slots: [Slot::default(); SLOT_COUNT],
            cursor: 0,
            cooldown,
        }
    }

    /// Acquire the next available slot, scanning from a rotating cursor.
    /// Returns `None` ("unavailable") if every slot is occupied or cooling.
    pub fn acquire(&mut self, now: Instant) -> Option<u8> {
        for offset in 0..SLOT_COUNT {
            let idx = (self.cursor + offset) % SLOT_COUNT;
            let slot = &mut self.slots[idx];
            let cooling = slot.cooling_until.is_some_and(|until| until > now);
            if !slot.occupied && !cooling {
                slot.occupied = true;
                slot.cooling_until = None;
                self.cursor = (idx + 1) % SLOT_COUNT;
                return Some(idx as u8);
            }
        }
        None
    }

    /// Release a slot, starting its cooldown (unless cooldown is zero, in
    /// which case it's immediately reusable). Idempotent with respect to
    /// masking: `id | 0x80` is treated the same as `id & 0x7F`.
    pub fn release(&mut self, id: u8, now: Instant) {
        let idx = (id & 0x7F) as usize;
        let slot = &mut self.slots[idx];
        slot.occupied = false;
        slot.cooling_until = if self.cooldown.is_zero() {
            None
        } else {
            Some(now + self.cooldown)
        };
    }

    /// Clear every slot's occupancy and cooldown state immediately.
    pub fn release_all(&mut self) {
        for slot in &mut self.slots {
            slot.occupied = false;
            slot.cooling_until = None;
        }
    }

    /// Number of slots neither occupied nor cooling, as of `now`.
    pub fn available(&self, now: Instant) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.occupied && !slot.cooling_until.is_some_and(|until| until > now))
            .count()
    }

    /// True once available capacity drops below the near-exhaustion
    /// threshold.
    pub fn is_near_exhaustion(&self, now: Instant) -> bool {
        self.available(now) < NEAR_EXHAUSTION_THRESHOLD
    }
}

impl Default for RequestIdPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let mut pool = RequestIdPool::with_cooldown(Duration::ZERO);
        let now = Instant::now();
        let id = pool.acquire(now).unwrap();
        assert_eq!(pool.available(now), SLOT_COUNT - 1);
        pool.release(id, now);
        assert_eq!(pool.available(now), SLOT_COUNT);
    }

    #[test]
    fn exhaustion_returns_none_without_corrupting_state() {
        let mut pool = RequestIdPool::with_cooldown(Duration::ZERO);
        let now = Instant::now();
        let mut ids = Vec::new();
        for _ in 0..SLOT_COUNT {
            ids.push(pool.acquire(now).unwrap());
        }
        assert_eq!(pool.acquire(now), None);
        assert_eq!(pool.available(now), 0);
        // State wasn't corrupted: releasing one slot makes exactly one
        // acquire succeed again.
        pool.release(ids[0], now);
        assert!(pool.acquire(now).is_some());
        assert_eq!(pool.acquire(now), None);
    }

    #[test]
    fn cooldown_blocks_immediate_reacquisition() {
        let mut pool = RequestIdPool::with_cooldown(Duration::from_secs(2));
        let t0 = Instant::now();
        let mut ids = Vec::new();
        for _ in 0..SLOT_COUNT {
            ids.push(pool.acquire(t0).unwrap());
        }
        pool.release(5, t0);
        assert_eq!(pool.acquire(t0 + Duration::from_millis(500)), None);
        let reacquired = pool
            .acquire(t0 + Duration::from_secs(2) + Duration::from_millis(1))
            .unwrap();
        assert_eq!(reacquired, 5);
    }

    #[test]
    fn zero_cooldown_allows_immediate_reuse() {
        let mut pool = RequestIdPool::with_cooldown(Duration::ZERO);
        let now = Instant::now();
        let id = pool.acquire(now).unwrap();
        pool.release(id, now);
        assert_eq!(pool.acquire(now), Some(id));
    }

    #[test]
    fn release_masks_high_bit() {
        let mut pool = RequestIdPool::with_cooldown(Duration::ZERO);
        let now = Instant::now();
        let id = pool.acquire(now).unwrap();
        pool.release(id | 0x80, now);
        assert_eq!(pool.available(now), SLOT_COUNT);
    }

    #[test]
    fn near_exhaustion_threshold() {
        let mut pool = RequestIdPool::with_cooldown(Duration::ZERO);
        let now = Instant::now();
        for _ in 0..(SLOT_COUNT - NEAR_EXHAUSTION_THRESHOLD + 1) {
            pool.acquire(now).unwrap();
        }
        assert!(pool.is_near_exhaustion(now));
    }
}
