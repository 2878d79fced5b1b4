//! ============================================================================
//! Id Generator - Snowflake-style 64-bit ids
//! ============================================================================
//! Layout (high to low): 41 bits milliseconds since EPOCH_MS, 5 bits
//! datacenter, 5 bits worker, 12 bits per-millisecond sequence.
//! ============================================================================

use std::sync::Mutex;
use tracing::warn;

/// 2020-01-01T00:00:00Z
pub const EPOCH_MS: u64 = 1_577_836_800_000;

const WORKER_BITS: u64 = 5;
const DATACENTER_BITS: u64 = 5;
const SEQUENCE_BITS: u64 = 12;

const MAX_WORKER: u64 = (1 << WORKER_BITS) - 1;
const MAX_DATACENTER: u64 = (1 << DATACENTER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

const WORKER_SHIFT: u64 = SEQUENCE_BITS;
const DATACENTER_SHIFT: u64 = SEQUENCE_BITS + WORKER_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + WORKER_BITS + DATACENTER_BITS;

struct State {
    last_ms: u64,
    sequence: u64,
    /// Wall clock currently reads earlier than `last_ms`
    behind: bool,
}

/// Monotonic-ish unique id source shared by every writer
pub struct IdGenerator {
    datacenter_id: u64,
    worker_id: u64,
    clock: fn() -> u64,
    state: Mutex<State>,
}

impl IdGenerator {
    /// Ids out of range are masked to their bit width
    pub fn new(datacenter_id: u64, worker_id: u64) -> Self {
        Self::with_clock(datacenter_id, worker_id, current_ms)
    }

    pub(crate) fn with_clock(datacenter_id: u64, worker_id: u64, clock: fn() -> u64) -> Self {
        if datacenter_id > MAX_DATACENTER || worker_id > MAX_WORKER {
            warn!(
                "Snowflake ids out of range (datacenter={}, worker={}), masking",
                datacenter_id, worker_id
            );
        }
        Self {
            datacenter_id: datacenter_id & MAX_DATACENTER,
            worker_id: worker_id & MAX_WORKER,
            clock,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
                behind: false,
            }),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id_at((self.clock)())
    }

    /// Never blocks. A clock that went backwards keeps issuing from the last
    /// millisecond; an exhausted sequence borrows the next millisecond.
    fn next_id_at(&self, wall_ms: u64) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if wall_ms < state.last_ms {
            if !state.behind {
                warn!(
                    "Clock moved back {} ms, continuing from last issued timestamp",
                    state.last_ms - wall_ms
                );
                state.behind = true;
            }
        } else {
            state.behind = false;
        }

        let mut now = wall_ms.max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                now += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        ((now - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.datacenter_id << DATACENTER_SHIFT)
            | (self.worker_id << WORKER_SHIFT)
            | state.sequence
    }
}

/// Unix milliseconds encoded in an id
pub fn timestamp_ms(id: u64) -> u64 {
    (id >> TIMESTAMP_SHIFT) + EPOCH_MS
}

fn current_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(EPOCH_MS as i64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let gen = IdGenerator::new(5, 5);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let gen = Arc::new(IdGenerator::new(1, 2));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = gen.clone();
                std::thread::spawn(move || (0..2_000).map(|_| gen.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 8_000);
    }

    #[test]
    fn test_clock_regression_does_not_block() {
        let gen = IdGenerator::new(1, 1);
        let t = EPOCH_MS + 1_000_000;
        let a = gen.next_id_at(t);
        // An hour back: ids keep increasing from the last timestamp
        let b = gen.next_id_at(t - 3_600_000);
        let c = gen.next_id_at(t - 3_599_999);
        assert!(a < b && b < c);
        assert_eq!(timestamp_ms(c), t);

        let d = gen.next_id_at(t + 5);
        assert!(d > c);
        assert_eq!(timestamp_ms(d), t + 5);
    }

    #[test]
    fn test_sequence_overflow_borrows_next_ms() {
        fn frozen() -> u64 {
            EPOCH_MS + 42
        }
        let gen = IdGenerator::with_clock(0, 0, frozen);
        let ids: Vec<u64> = (0..=SEQUENCE_MASK + 2).map(|_| gen.next_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(timestamp_ms(ids[0]), EPOCH_MS + 42);
        assert_eq!(timestamp_ms(*ids.last().unwrap()), EPOCH_MS + 43);
    }

    #[test]
    fn test_embedded_fields() {
        let gen = IdGenerator::new(3, 7);
        let id = gen.next_id();
        assert_eq!((id >> DATACENTER_SHIFT) & MAX_DATACENTER, 3);
        assert_eq!((id >> WORKER_SHIFT) & MAX_WORKER, 7);

        let now = chrono::Utc::now().timestamp_millis() as u64;
        assert!(now.abs_diff(timestamp_ms(id)) < 5_000);
    }
}
