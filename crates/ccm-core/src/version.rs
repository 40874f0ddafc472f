//! Bootstrap version-probe bookkeeping.
//!
//! While a node is looking for an existing partition it broadcasts
//! version probes and watches what comes back. This module tracks the
//! probe retry budget, the quorum-seeking response drops, and the two
//! signals that suppress the "I am alone, form a single-node cluster"
//! shortcut: foreign-cookie responses and general protocol activity.

use std::time::{Duration, Instant};

/// Outcome of a probe-timeout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The probe interval has not elapsed yet; keep waiting.
    NoChange,
    /// Interval elapsed with retries left; re-broadcast the probe.
    TryAgain,
    /// Retry budget exhausted; decide between solo-join and resetting.
    GiveUp,
}

/// State of one bootstrap attempt.
#[derive(Debug)]
pub struct VersionSeeker {
    max_tries: u32,
    tries: u32,
    /// Version responses carrying a cookie we do not recognize, observed
    /// while already in a join round. Nonzero means other partitions
    /// exist and solo-join would split-brain.
    foreign_responses: u32,
    /// Any join-round traffic observed while probing.
    activity: bool,
    last_probe: Instant,
}

impl VersionSeeker {
    pub fn new(max_tries: u32) -> Self {
        Self {
            max_tries,
            tries: 0,
            foreign_responses: 0,
            activity: false,
            last_probe: Instant::now(),
        }
    }

    /// Back to a clean slate for a fresh bootstrap attempt.
    pub fn reset(&mut self) {
        self.tries = 0;
        self.foreign_responses = 0;
        self.activity = false;
        self.last_probe = Instant::now();
    }

    /// Note that a probe was just (re)broadcast.
    pub fn probe_sent(&mut self) {
        self.last_probe = Instant::now();
    }

    /// Evaluate a synthetic timeout against the probe interval.
    pub fn check_timeout(&mut self, interval: Duration) -> ProbeVerdict {
        if self.last_probe.elapsed() < interval {
            return ProbeVerdict::NoChange;
        }
        self.tries += 1;
        self.last_probe = Instant::now();
        if self.tries < self.max_tries {
            ProbeVerdict::TryAgain
        } else {
            ProbeVerdict::GiveUp
        }
    }

    pub fn note_activity(&mut self) {
        self.activity = true;
    }

    pub fn saw_activity(&self) -> bool {
        self.activity
    }

    pub fn note_foreign_response(&mut self) {
        self.foreign_responses += 1;
    }

    pub fn foreign_responses(&self) -> u32 {
        self.foreign_responses
    }

    pub fn clear_foreign_responses(&mut self) {
        self.foreign_responses = 0;
    }
}

/// Quorum-seeking drop counter: version responses from an undersized
/// partition may be ignored, but only a bounded number of times so an
/// actual minority cluster can still be joined eventually.
#[derive(Debug)]
pub struct RespDropCounter {
    drops: u32,
    max: u32,
}

impl RespDropCounter {
    pub fn new(max: u32) -> Self {
        Self { drops: 0, max }
    }

    pub fn can_drop(&self) -> bool {
        self.drops < self.max
    }

    pub fn dropped(&mut self) {
        self.drops += 1;
    }

    pub fn reset(&mut self) {
        self.drops = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_retry_budget() {
        let mut s = VersionSeeker::new(3);
        // zero interval: every check consumes a try
        assert_eq!(s.check_timeout(Duration::ZERO), ProbeVerdict::TryAgain);
        assert_eq!(s.check_timeout(Duration::ZERO), ProbeVerdict::TryAgain);
        assert_eq!(s.check_timeout(Duration::ZERO), ProbeVerdict::GiveUp);
    }

    #[test]
    fn test_interval_not_elapsed_is_no_change() {
        let mut s = VersionSeeker::new(3);
        assert_eq!(
            s.check_timeout(Duration::from_secs(3600)),
            ProbeVerdict::NoChange
        );
        assert_eq!(
            s.check_timeout(Duration::from_secs(3600)),
            ProbeVerdict::NoChange
        );
    }

    #[test]
    fn test_reset_restores_budget_and_signals() {
        let mut s = VersionSeeker::new(1);
        s.note_activity();
        s.note_foreign_response();
        assert_eq!(s.check_timeout(Duration::ZERO), ProbeVerdict::GiveUp);
        s.reset();
        assert!(!s.saw_activity());
        assert_eq!(s.foreign_responses(), 0);
        assert_eq!(s.check_timeout(Duration::ZERO), ProbeVerdict::GiveUp);
    }

    #[test]
    fn test_resp_drop_counter_is_bounded() {
        let mut c = RespDropCounter::new(2);
        assert!(c.can_drop());
        c.dropped();
        assert!(c.can_drop());
        c.dropped();
        assert!(!c.can_drop());
        c.reset();
        assert!(c.can_drop());
    }
}
