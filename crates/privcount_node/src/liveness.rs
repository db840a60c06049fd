//! TS-side check-in liveness tracking (§4.5 "Check-ins"). A client is
//! considered alive if at most `2 * checkin_period` has elapsed since its
//! last heartbeat; tracked by long-term fingerprint so an IP change does not
//! register as a false dead report.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct LivenessTracker {
    last_seen: HashMap<String, u64>,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_checkin(&mut self, fingerprint: &str) {
        self.last_seen.insert(fingerprint.to_string(), now_secs());
    }

    /// `true` if a heartbeat was seen within `2 * checkin_period_secs`.
    pub fn is_alive(&self, fingerprint: &str, checkin_period_secs: u64) -> bool {
        match self.last_seen.get(fingerprint) {
            Some(&last) => now_secs().saturating_sub(last) <= 2 * checkin_period_secs,
            None => false,
        }
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.last_seen.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_checkin_is_alive() {
        let mut tracker = LivenessTracker::new();
        tracker.record_checkin("fp-1");
        assert!(tracker.is_alive("fp-1", 30));
    }

    #[test]
    fn unknown_fingerprint_is_not_alive() {
        let tracker = LivenessTracker::new();
        assert!(!tracker.is_alive("unknown", 30));
    }
}
