//! Per-round update table.
//!
//! Scratch bookkeeping for one protocol round: which nodes have replied
//! to the current JOIN solicitation and the uptime (joined-transition)
//! each reported. Reset at the start of every round. Also caches memlist
//! requests that arrive from self-declared leaders before this node is
//! ready to answer them.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use ccm_proto::constants::MAXNODE;
use ccm_proto::node::NodeDirectory;
use ccm_proto::NodeBitmap;

use crate::elect::seniority_cmp;

/// Update table keyed by node UUID. Never holds more entries than the
/// directory has nodes, because UUIDs are directory indices.
#[derive(Debug)]
pub struct UpdateTable {
    /// uuid -> reported uptime.
    entries: BTreeMap<usize, u64>,
    /// Cached (uuid, major) of REQ_MEMLIST senders, answered when the
    /// join round settles.
    memlist_requests: Vec<(usize, u64)>,
    /// When the current round started collecting.
    round_started: Instant,
}

impl UpdateTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            memlist_requests: Vec::new(),
            round_started: Instant::now(),
        }
    }

    /// Clear all round state and restart the round timer.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.memlist_requests.clear();
        self.round_started = Instant::now();
    }

    /// Record a reply. An existing entry is only replaced when
    /// `overwrite` is set (a later, higher-minor JOIN from the same node
    /// supersedes the earlier one).
    pub fn add(&mut self, uuid: usize, uptime: u64, overwrite: bool) {
        if uuid >= MAXNODE {
            return;
        }
        if overwrite {
            self.entries.insert(uuid, uptime);
        } else {
            self.entries.entry(uuid).or_insert(uptime);
        }
    }

    pub fn remove(&mut self, uuid: usize) {
        self.entries.remove(&uuid);
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_member(&self, uuid: usize) -> bool {
        self.entries.contains_key(&uuid)
    }

    pub fn uptime_of(&self, uuid: usize) -> Option<u64> {
        self.entries.get(&uuid).copied()
    }

    /// Set UUIDs in ascending order.
    pub fn uuids(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.keys().copied()
    }

    /// The responders as a bitmap, the connectivity report this node
    /// sends to the leader.
    pub fn to_bitmap(&self) -> NodeBitmap {
        let mut bm = NodeBitmap::new();
        for uuid in self.uuids() {
            bm.mark(uuid);
        }
        bm
    }

    /// Elect the leader from the current contents: minimum by
    /// `(uptime, id)` seniority. Deterministic for identical contents on
    /// every node, which the quorum rule guarantees.
    pub fn leader_candidate(&self, dir: &NodeDirectory) -> Option<usize> {
        self.entries
            .iter()
            .filter_map(|(&uuid, &uptime)| dir.id_of(uuid).map(|id| (uuid, uptime, id)))
            .min_by(|a, b| seniority_cmp((a.1, a.2), (b.1, b.2)))
            .map(|(uuid, _, _)| uuid)
    }

    /// Rebuild the table from a leader's incremental broadcast:
    /// membership UUIDs in ascending order zipped with their uptimes.
    pub fn load(&mut self, pairs: impl IntoIterator<Item = (usize, u64)>) {
        self.entries.clear();
        for (uuid, uptime) in pairs {
            if uuid < MAXNODE {
                self.entries.insert(uuid, uptime);
            }
        }
    }

    pub fn round_timed_out(&self, threshold: Duration) -> bool {
        self.round_started.elapsed() >= threshold
    }

    /// Cache a memlist request from a self-declared leader.
    pub fn note_memlist_request(&mut self, uuid: usize, major: u64) {
        if !self.memlist_requests.iter().any(|&(u, _)| u == uuid) {
            self.memlist_requests.push((uuid, major));
        }
    }

    pub fn has_memlist_requests(&self) -> bool {
        !self.memlist_requests.is_empty()
    }

    /// Drain the cached requests for answering.
    pub fn take_memlist_requests(&mut self) -> Vec<(usize, u64)> {
        std::mem::take(&mut self.memlist_requests)
    }
}

impl Default for UpdateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> NodeDirectory {
        let ids: Vec<String> = ["nodea", "nodeb", "nodec"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        NodeDirectory::new("nodea", &ids).unwrap()
    }

    #[test]
    fn test_add_respects_overwrite_flag() {
        let mut t = UpdateTable::new();
        t.add(1, 5, false);
        t.add(1, 9, false);
        assert_eq!(t.uptime_of(1), Some(5));
        t.add(1, 9, true);
        assert_eq!(t.uptime_of(1), Some(9));
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn test_out_of_range_uuid_is_ignored() {
        let mut t = UpdateTable::new();
        t.add(MAXNODE, 1, true);
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn test_leader_is_lowest_uptime_then_lowest_id() {
        let d = dir();
        let mut t = UpdateTable::new();
        t.add(0, 4, true); // nodea
        t.add(1, 2, true); // nodeb
        t.add(2, 2, true); // nodec
        // nodeb and nodec tie on uptime; nodeb sorts first
        assert_eq!(t.leader_candidate(&d), Some(1));
        t.add(0, 1, true);
        assert_eq!(t.leader_candidate(&d), Some(0));
    }

    #[test]
    fn test_leader_election_deterministic_across_tables() {
        // Two independently-built tables with the same contents elect the
        // same node regardless of insertion order.
        let d = dir();
        let mut a = UpdateTable::new();
        let mut b = UpdateTable::new();
        a.add(2, 0, true);
        a.add(0, 0, true);
        a.add(1, 3, true);
        b.add(1, 3, true);
        b.add(0, 0, true);
        b.add(2, 0, true);
        assert_eq!(a.leader_candidate(&d), b.leader_candidate(&d));
        assert_eq!(a.leader_candidate(&d), Some(0));
    }

    #[test]
    fn test_bitmap_and_load_round() {
        let mut t = UpdateTable::new();
        t.add(0, 1, true);
        t.add(2, 4, true);
        let bm = t.to_bitmap();
        assert!(bm.test(0) && bm.test(2) && !bm.test(1));

        let mut fresh = UpdateTable::new();
        fresh.load(bm.uuids().zip([1u64, 4u64]));
        assert_eq!(fresh.uptime_of(2), Some(4));
        assert_eq!(fresh.count(), 2);
    }

    #[test]
    fn test_memlist_request_cache_dedups() {
        let mut t = UpdateTable::new();
        t.note_memlist_request(1, 7);
        t.note_memlist_request(1, 7);
        t.note_memlist_request(2, 7);
        assert!(t.has_memlist_requests());
        let reqs = t.take_memlist_requests();
        assert_eq!(reqs, vec![(1, 7), (2, 7)]);
        assert!(!t.has_memlist_requests());
    }

    #[test]
    fn test_round_timer() {
        let mut t = UpdateTable::new();
        assert!(t.round_timed_out(Duration::from_millis(0)));
        t.reset();
        assert!(!t.round_timed_out(Duration::from_secs(3600)));
    }
}
