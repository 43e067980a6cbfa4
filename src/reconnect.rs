//! Backoff schedule and close-code taxonomy for the gateway connection.

use std::time::{Duration, Instant};

const DELAY_SCHEDULE_SECS: [u64; 6] = [1, 2, 5, 10, 30, 60];
const HARD_CAP_ATTEMPTS: u32 = 100;
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);
const QUICK_DISCONNECT_WINDOW: Duration = Duration::from_secs(5);
const QUICK_DISCONNECT_THRESHOLD: u32 = 3;

/// What the gateway should do after a connection attempt ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Reconnect after the given delay, attempting to resume if a session
    /// is still held.
    Reconnect { delay: Duration, keep_session: bool },
    /// Refresh the token before reconnecting (session may or may not be
    /// kept, see `keep_session`).
    RefreshTokenAndReconnect { delay: Duration, keep_session: bool },
    /// Do not reconnect; a clean shutdown.
    Stop,
    /// Do not reconnect, ever, for this process (terminal close code).
    StopPermanently { reason: &'static str },
}

/// Tracks reconnect attempt count, the single pending-timer invariant, and
/// the quick-disconnect detector.
pub struct ReconnectPolicy {
    attempts: u32,
    quick_disconnects: u32,
    connected_at: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new() -> ReconnectPolicy {
        ReconnectPolicy {
            attempts: 0,
            quick_disconnects: 0,
            connected_at: None,
        }
    }

    /// Call when a connection is successfully opened; resets the attempt
    /// counter and starts the quick-disconnect timer.
    pub fn on_open(&mut self) {
        self.attempts = 0;
        self.connected_at = Some(Instant::now());
    }

    /// Computed delay for the next attempt using `[1,2,5,10,30,60]`,
    /// saturating at the last entry, and incrementing the attempt counter.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= HARD_CAP_ATTEMPTS {
            return None;
        }
        let idx = (self.attempts as usize).min(DELAY_SCHEDULE_SECS.len() - 1);
        self.attempts += 1;
        Some(Duration::from_secs(DELAY_SCHEDULE_SECS[idx]))
    }

    /// Whether the connection that just closed counts as a "quick
    /// disconnect" (closed within 5s of opening), and bumps/reset the
    /// streak counter accordingly. Returns `true` exactly when the third
    /// consecutive quick disconnect has just occurred (caller should use
    /// the 60s override and reset the streak).
    pub fn note_close_and_check_quick_disconnect(&mut self) -> bool {
        let was_quick = self
            .connected_at
            .map(|t| t.elapsed() < QUICK_DISCONNECT_WINDOW)
            .unwrap_or(false);
        self.connected_at = None;

        if was_quick {
            self.quick_disconnects += 1;
        } else {
            self.quick_disconnects = 0;
        }

        if self.quick_disconnects >= QUICK_DISCONNECT_THRESHOLD {
            self.quick_disconnects = 0;
            true
        } else {
            false
        }
    }

    /// Decide the reconnect action for a WebSocket close code. Terminal and
    /// refresh-token close codes always take priority over the
    /// quick-disconnect override below them, since a bot-banned close
    /// coinciding with a flapping streak must still stop permanently.
    pub fn action_for_close_code(&mut self, code: u16) -> ReconnectAction {
        let quick_disconnect_triggered = self.note_close_and_check_quick_disconnect();

        match code {
            1000 => return ReconnectAction::Stop,
            4914 => return ReconnectAction::StopPermanently { reason: "bot offline / sandbox-only" },
            4915 => return ReconnectAction::StopPermanently { reason: "bot banned" },
            4009 => {
                let delay = self.next_delay().unwrap_or(Duration::from_secs(60));
                return ReconnectAction::RefreshTokenAndReconnect { delay, keep_session: true };
            }
            4900..=4913 => {
                let delay = self.next_delay().unwrap_or(Duration::from_secs(60));
                return ReconnectAction::RefreshTokenAndReconnect { delay, keep_session: false };
            }
            _ => {}
        }

        if quick_disconnect_triggered {
            return ReconnectAction::Reconnect {
                delay: RATE_LIMIT_DELAY,
                keep_session: true,
            };
        }

        let delay = self.next_delay().unwrap_or(Duration::from_secs(60));
        ReconnectAction::Reconnect { delay, keep_session: true }
    }

    /// Decide the reconnect action when a connect attempt fails outright
    /// (network error / rate-limit response), rather than from a close
    /// code on an already-open socket.
    pub fn action_for_connect_error(&mut self, err: &crate::error::GatewayError) -> ReconnectAction {
        if err.looks_like_rate_limited() {
            return ReconnectAction::Reconnect {
                delay: RATE_LIMIT_DELAY,
                keep_session: true,
            };
        }
        let delay = self.next_delay().unwrap_or(Duration::from_secs(60));
        ReconnectAction::Reconnect { delay, keep_session: true }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_schedule_saturates() {
        let mut policy = ReconnectPolicy::new();
        let expected = [1, 2, 5, 10, 30, 60, 60, 60];
        for secs in expected {
            assert_eq!(policy.next_delay(), Some(Duration::from_secs(secs)));
        }
    }

    #[test]
    fn hard_cap_stops_issuing_delays() {
        let mut policy = ReconnectPolicy::new();
        for _ in 0..HARD_CAP_ATTEMPTS {
            assert!(policy.next_delay().is_some());
        }
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn clean_close_does_not_reconnect() {
        let mut policy = ReconnectPolicy::new();
        policy.on_open();
        assert_eq!(policy.action_for_close_code(1000), ReconnectAction::Stop);
    }

    #[test]
    fn terminal_codes_stop_permanently() {
        let mut policy = ReconnectPolicy::new();
        policy.on_open();
        assert!(matches!(
            policy.action_for_close_code(4914),
            ReconnectAction::StopPermanently { .. }
        ));
        let mut policy = ReconnectPolicy::new();
        policy.on_open();
        assert!(matches!(
            policy.action_for_close_code(4915),
            ReconnectAction::StopPermanently { .. }
        ));
    }

    #[test]
    fn internal_codes_clear_session() {
        let mut policy = ReconnectPolicy::new();
        policy.on_open();
        match policy.action_for_close_code(4901) {
            ReconnectAction::RefreshTokenAndReconnect { keep_session, .. } => {
                assert!(!keep_session)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn code_4009_preserves_session() {
        let mut policy = ReconnectPolicy::new();
        policy.on_open();
        match policy.action_for_close_code(4009) {
            ReconnectAction::RefreshTokenAndReconnect { keep_session, .. } => assert!(keep_session),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn terminal_code_wins_over_coincident_quick_disconnect_streak() {
        let mut policy = ReconnectPolicy::new();
        for _ in 0..2 {
            policy.on_open();
            policy.action_for_close_code(1006);
        }
        policy.on_open();
        assert!(matches!(
            policy.action_for_close_code(4915),
            ReconnectAction::StopPermanently { .. }
        ));
    }

    #[test]
    fn refresh_token_code_wins_over_coincident_quick_disconnect_streak() {
        let mut policy = ReconnectPolicy::new();
        for _ in 0..2 {
            policy.on_open();
            policy.action_for_close_code(1006);
        }
        policy.on_open();
        match policy.action_for_close_code(4901) {
            ReconnectAction::RefreshTokenAndReconnect { keep_session, .. } => assert!(!keep_session),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn connect_error_defers_rate_limit_detection_to_gateway_error() {
        let mut policy = ReconnectPolicy::new();
        let err = crate::error::GatewayError::Api {
            status: 429,
            code: Some(100_001),
            message: "Too many requests".to_string(),
        };
        match policy.action_for_connect_error(&err) {
            ReconnectAction::Reconnect { delay, .. } => assert_eq!(delay, RATE_LIMIT_DELAY),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn three_quick_disconnects_force_60s_delay() {
        let mut policy = ReconnectPolicy::new();
        for _ in 0..2 {
            policy.on_open();
            assert!(!matches!(
                policy.action_for_close_code(1006),
                ReconnectAction::Reconnect { delay, .. } if delay == RATE_LIMIT_DELAY
            ));
        }
        policy.on_open();
        match policy.action_for_close_code(1006) {
            ReconnectAction::Reconnect { delay, .. } => assert_eq!(delay, RATE_LIMIT_DELAY),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
