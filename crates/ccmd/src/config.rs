//! Engine configuration.
//!
//! All protocol timeouts derive from one keepalive interval so a single
//! flag retunes the whole ladder; the multipliers live in
//! `ccm_proto::defaults`.

use std::time::Duration;

use ccm_proto::defaults::{
    DEFAULT_KEEPALIVE_MS, DEFAULT_MAX_RESPONSE_DROPS, DEFAULT_SEND_RETRIES,
    DEFAULT_SEND_RETRY_DELAY_MS, DEFAULT_VERSION_PROBE_RETRIES, FINAL_LIST_EXTRA_SECS,
    IFF_TIMEOUT_MULT, ITF_TIMEOUT_MULT, LONG_UPDATE_TIMEOUT_MULT, UPDATE_TIMEOUT_MULT,
    VERSION_TIMEOUT_MULT,
};

/// The protocol timeout ladder.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Base tick; also the synthetic-timeout injection interval.
    pub keepalive: Duration,
    /// Update round: how long to collect JOIN replies.
    pub update: Duration,
    /// Long update: a non-leader stuck this long gives up entirely.
    pub long_update: Duration,
    /// Interval between version-probe re-broadcasts.
    pub version: Duration,
    /// Leader's wait for connectivity reports.
    pub iff: Duration,
    /// Leader-orphan limit: past this, nobody is waiting for us anymore.
    pub itf: Duration,
    /// Follower's wait for the leader's final list.
    pub final_list: Duration,
}

impl TimeoutConfig {
    pub fn from_keepalive(keepalive: Duration) -> Self {
        Self {
            keepalive,
            update: keepalive * UPDATE_TIMEOUT_MULT,
            long_update: keepalive * LONG_UPDATE_TIMEOUT_MULT,
            version: keepalive * VERSION_TIMEOUT_MULT,
            iff: keepalive * IFF_TIMEOUT_MULT,
            itf: keepalive * ITF_TIMEOUT_MULT,
            final_list: keepalive * ITF_TIMEOUT_MULT + Duration::from_secs(FINAL_LIST_EXTRA_SECS),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::from_keepalive(Duration::from_millis(DEFAULT_KEEPALIVE_MS))
    }
}

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timeouts: TimeoutConfig,
    /// Attempts for any single outbound send.
    pub send_retries: u32,
    /// Sleep between send retries.
    pub send_retry_delay: Duration,
    /// Version-probe re-broadcasts before the solo-join decision.
    pub version_probe_retries: u32,
    /// Quorum-seeking version-response drop budget.
    pub max_response_drops: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            send_retries: DEFAULT_SEND_RETRIES,
            send_retry_delay: Duration::from_millis(DEFAULT_SEND_RETRY_DELAY_MS),
            version_probe_retries: DEFAULT_VERSION_PROBE_RETRIES,
            max_response_drops: DEFAULT_MAX_RESPONSE_DROPS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_scales_with_keepalive() {
        let t = TimeoutConfig::from_keepalive(Duration::from_millis(100));
        assert_eq!(t.update, Duration::from_millis(900));
        assert_eq!(t.long_update, Duration::from_millis(3000));
        assert_eq!(t.iff, Duration::from_millis(1200));
        assert_eq!(t.itf, Duration::from_millis(1800));
        assert!(t.final_list > t.itf);
    }
}
