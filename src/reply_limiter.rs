//! Passive-reply quota tracking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const LIMIT: u32 = 4;
const TTL: Duration = Duration::from_secs(60 * 60);
const PRUNE_THRESHOLD: usize = 10_000;

struct Record {
    count: u32,
    first_reply_at: Instant,
}

impl Record {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.first_reply_at) <= TTL
    }
}

/// Decision returned by [`ReplyLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDecision {
    /// Send as a passive reply; `remaining` quota left after this send.
    Allow { remaining: u32 },
    /// Window expired; fall back to an active message.
    FallbackExpired,
    /// Quota exhausted within the window; fall back to an active message.
    FallbackLimitExceeded,
}

/// Per-`messageId` passive reply quota, TTL=1h, LIMIT=4.
pub struct ReplyLimiter {
    records: Mutex<HashMap<String, Record>>,
}

impl ReplyLimiter {
    pub fn new() -> ReplyLimiter {
        ReplyLimiter {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether a reply to `message_id` may go out as a passive send.
    pub fn check(&self, message_id: &str) -> ReplyDecision {
        let now = Instant::now();
        let records = self.records.lock().expect("reply limiter lock poisoned");
        match records.get(message_id) {
            None => ReplyDecision::Allow { remaining: LIMIT },
            Some(record) if !record.is_fresh(now) => ReplyDecision::FallbackExpired,
            Some(record) if record.count >= LIMIT => ReplyDecision::FallbackLimitExceeded,
            Some(record) => ReplyDecision::Allow {
                remaining: LIMIT - record.count,
            },
        }
    }

    /// Record a successful passive send. Must be called only on the
    /// allow-then-send path, after the REST call succeeds.
    pub fn record_reply(&self, message_id: &str) {
        let now = Instant::now();
        let mut records = self.records.lock().expect("reply limiter lock poisoned");

        self.prune_if_large(&mut records, now);

        let stale = records
            .get(message_id)
            .map(|r| !r.is_fresh(now))
            .unwrap_or(false);
        if stale {
            records.remove(message_id);
        }

        records
            .entry(message_id.to_string())
            .and_modify(|r| r.count += 1)
            .or_insert(Record {
                count: 1,
                first_reply_at: now,
            });
    }

    fn prune_if_large(&self, records: &mut HashMap<String, Record>, now: Instant) {
        if records.len() > PRUNE_THRESHOLD {
            records.retain(|_, r| r.is_fresh(now));
        }
    }
}

impl Default for ReplyLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_first_four_then_falls_back() {
        let limiter = ReplyLimiter::new();
        for expected_remaining in (1..=4).rev() {
            match limiter.check("m1") {
                ReplyDecision::Allow { remaining } => assert_eq!(remaining, expected_remaining),
                other => panic!("unexpected: {other:?}"),
            }
            limiter.record_reply("m1");
        }
        assert_eq!(limiter.check("m1"), ReplyDecision::FallbackLimitExceeded);
    }

    #[test]
    fn record_reply_is_idempotent_per_call_not_per_window() {
        let limiter = ReplyLimiter::new();
        limiter.record_reply("m1");
        limiter.record_reply("m1");
        match limiter.check("m1") {
            ReplyDecision::Allow { remaining } => assert_eq!(remaining, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_id_is_allowed() {
        let limiter = ReplyLimiter::new();
        assert_eq!(limiter.check("never-seen"), ReplyDecision::Allow { remaining: 4 });
    }
}
