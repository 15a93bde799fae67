//! Event-ID generator (§4.1).
//!
//! `id = (now_ms << 16) | ((counter + offset) & 0xFFFF)`. The timestamp
//! occupies the high bits so ids sort by wall time across instances with
//! synchronized clocks; the low 16 bits are a per-instance counter seeded
//! with a random offset so two instances minting ids in the same
//! millisecond don't collide in practice.

pub mod sntp;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;

/// Supplies the generator's notion of wall-clock milliseconds. The default
/// is the local clock; `sntp::SntpClock` layers in a periodically-refreshed
/// offset from an external time source.
pub trait TimeProvider: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Default)]
pub struct LocalClock;

impl TimeProvider for LocalClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

pub struct EventIdGenerator {
    time: Arc<dyn TimeProvider>,
    counter: AtomicU32,
    offset: u16,
}

impl EventIdGenerator {
    pub fn new(time: Arc<dyn TimeProvider>) -> Self {
        let offset: u16 = rand::thread_rng().r#gen();
        Self {
            time,
            counter: AtomicU32::new(0),
            offset,
        }
    }

    pub fn with_local_clock() -> Self {
        Self::new(Arc::new(LocalClock))
    }

    /// Mint the next event id. Not a synchronization primitive: callers must
    /// not assume strict monotonic decode, only that the high bits track
    /// wall time and the low 16 bits are unique per millisecond per
    /// instance.
    pub fn next_id(&self) -> i64 {
        let now_ms = self.time.now_ms();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) as u16;
        let low = counter.wrapping_add(self.offset) as i64 & 0xFFFF;
        (now_ms << 16) | low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FixedClock(std::sync::atomic::AtomicI64);

    impl TimeProvider for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn ids_are_unique_within_one_millisecond() {
        let r#gen = EventIdGenerator::new(Arc::new(FixedClock(std::sync::atomic::AtomicI64::new(1_000))));
        let mut seen = HashSet::new();
        // Only 65,536 distinct low bits exist per instance per millisecond.
        for _ in 0..65_536 {
            assert!(seen.insert(r#gen.next_id()));
        }
    }

    #[test]
    fn timestamp_occupies_high_bits() {
        let clock = Arc::new(FixedClock(std::sync::atomic::AtomicI64::new(5_000)));
        let r#gen = EventIdGenerator::new(clock.clone());
        let id_a = r#gen.next_id();
        clock.0.store(6_000, Ordering::Relaxed);
        let id_b = r#gen.next_id();
        assert!(id_b > id_a, "later wall time must sort higher");
        assert_eq!(id_a >> 16, 5_000);
        assert_eq!(id_b >> 16, 6_000);
    }

    #[test]
    fn counter_wraps_without_panicking() {
        let r#gen = EventIdGenerator::new(Arc::new(FixedClock(std::sync::atomic::AtomicI64::new(42))));
        for _ in 0..(u32::from(u16::MAX) * 3) {
            r#gen.next_id();
        }
    }
}
