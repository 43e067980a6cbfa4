//! Monotonic `msg_seq` per inbound `msg_id`.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

const CAPACITY: usize = 1000;

/// LRU-bounded counter handing out a strictly increasing `msg_seq` for every
/// reply to a given inbound `messageId`. Sequences are offset by a
/// per-process base derived from startup time so a restarted process never
/// reuses a sequence a still-open client session might expect to keep
/// climbing.
pub struct MsgSeqCounter {
    base: u64,
    counters: Mutex<LruCache<String, u64>>,
}

impl MsgSeqCounter {
    pub fn new() -> MsgSeqCounter {
        let base = (chrono::Utc::now().timestamp() as u64) % 100_000_000;
        MsgSeqCounter {
            base,
            counters: Mutex::new(LruCache::new(NonZeroUsize::new(CAPACITY).unwrap())),
        }
    }

    /// Return the next `msg_seq` for `message_id`, starting at `base + 1`.
    pub fn next(&self, message_id: &str) -> u64 {
        let mut counters = self.counters.lock().expect("msg_seq lock poisoned");
        let counter = counters.get_or_insert_mut(message_id.to_string(), || 0);
        *counter += 1;
        self.base + *counter
    }
}

impl Default for MsgSeqCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_strictly_increases_per_message_id() {
        let counter = MsgSeqCounter::new();
        let a = counter.next("m1");
        let b = counter.next("m1");
        assert!(b > a);
    }

    #[test]
    fn different_messages_get_independent_counters() {
        let counter = MsgSeqCounter::new();
        let a1 = counter.next("m1");
        let b1 = counter.next("m2");
        assert_eq!(a1, b1);
    }

    #[test]
    fn evicts_beyond_capacity() {
        let counter = MsgSeqCounter::new();
        for i in 0..(CAPACITY + 10) {
            counter.next(&format!("m{i}"));
        }
        let counters = counter.counters.lock().unwrap();
        assert!(counters.len() <= CAPACITY);
    }
}
