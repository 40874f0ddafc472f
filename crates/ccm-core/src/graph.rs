//! Connectivity graph and membership computer.
//!
//! Leader-only. During a full consensus round every participant reports a
//! bitmap of the UUIDs it can currently reach. The membership computer
//! reduces those reports to the largest *mutually* reachable subset (a
//! maximum clique over the reachability graph) together with the highest
//! major transition any member of that subset has ever observed, which
//! becomes the new major transition. Exact computation is fine here:
//! MAXNODE bounds the graph at 64 vertices and real rounds involve far
//! fewer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use ccm_proto::NodeBitmap;

#[derive(Debug)]
struct Report {
    reported: bool,
    max_trans: u64,
    reach: NodeBitmap,
}

/// Per-round reachability reports, keyed by reporting UUID.
#[derive(Debug)]
pub struct ConnectivityGraph {
    rows: BTreeMap<usize, Report>,
    started: Instant,
}

impl ConnectivityGraph {
    /// Start a collection round expecting reports from `expected`.
    pub fn init(expected: impl IntoIterator<Item = usize>) -> Self {
        let rows = expected
            .into_iter()
            .map(|uuid| {
                (
                    uuid,
                    Report {
                        reported: false,
                        max_trans: 0,
                        reach: NodeBitmap::new(),
                    },
                )
            })
            .collect();
        Self {
            rows,
            started: Instant::now(),
        }
    }

    /// Record a connectivity report. A node unknown to the round (it
    /// joined between solicitation and collection) is added on the fly.
    pub fn note(&mut self, uuid: usize, max_trans: u64, reach: NodeBitmap) {
        let row = self.rows.entry(uuid).or_insert(Report {
            reported: false,
            max_trans: 0,
            reach: NodeBitmap::new(),
        });
        row.reported = true;
        row.max_trans = max_trans;
        row.reach = reach;
    }

    /// Register a late joiner the round must now also wait for.
    pub fn add_uuid(&mut self, uuid: usize) {
        self.rows.entry(uuid).or_insert(Report {
            reported: false,
            max_trans: 0,
            reach: NodeBitmap::new(),
        });
    }

    /// Mark a single edge in an existing report; used when the leader
    /// learns of a late joiner it can evidently reach.
    pub fn mark_reachable(&mut self, from: usize, to: usize) {
        if let Some(row) = self.rows.get_mut(&from) {
            row.reach.mark(to);
        }
    }

    /// True once every expected node has reported.
    pub fn all_reported(&self) -> bool {
        self.rows.values().all(|r| r.reported)
    }

    pub fn timed_out(&self, threshold: Duration) -> bool {
        self.started.elapsed() >= threshold
    }

    /// Compute the maximal mutually-connected subset and the highest
    /// max-transition reported inside it.
    ///
    /// Ties in clique size resolve deterministically: vertices are
    /// expanded in ascending UUID order and a candidate replaces the best
    /// only when strictly larger, so the first (lowest-UUID-set) clique
    /// of the winning size is kept.
    pub fn max_clique(&self) -> (NodeBitmap, u64) {
        let verts: Vec<usize> = self.rows.keys().copied().collect();
        let n = verts.len();
        if n == 0 {
            return (NodeBitmap::new(), 0);
        }
        debug_assert!(n <= 64);

        // Adjacency over vertex positions; an edge requires mutual
        // reachability.
        let mut adj = vec![0u64; n];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let (ui, uj) = (verts[i], verts[j]);
                if self.rows[&ui].reach.test(uj) && self.rows[&uj].reach.test(ui) {
                    adj[i] |= 1 << j;
                }
            }
        }

        let mut best: u64 = 0;
        expand(&adj, 0, (1u64 << (n - 1)) | ((1u64 << (n - 1)) - 1), &mut best);

        let mut bm = NodeBitmap::new();
        let mut max_trans = 0;
        for i in 0..n {
            if best & (1 << i) != 0 {
                bm.mark(verts[i]);
                max_trans = max_trans.max(self.rows[&verts[i]].max_trans);
            }
        }
        (bm, max_trans)
    }
}

/// Grow cliques from `clique` using candidate set `cands`, keeping the
/// largest found in `best`. Candidates are consumed in ascending bit
/// order, so every clique is enumerated exactly once.
fn expand(adj: &[u64], clique: u64, cands: u64, best: &mut u64) {
    if clique.count_ones() > best.count_ones() {
        *best = clique;
    }
    if clique.count_ones() + cands.count_ones() <= best.count_ones() {
        return;
    }
    let mut rest = cands;
    while rest != 0 {
        let v = rest.trailing_zeros() as usize;
        let vbit = 1u64 << v;
        rest &= !vbit;
        expand(adj, clique | vbit, rest & adj[v], best);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bm(uuids: &[usize]) -> NodeBitmap {
        let mut b = NodeBitmap::new();
        for &u in uuids {
            b.mark(u);
        }
        b
    }

    #[test]
    fn test_all_reported_tracks_expected_set() {
        let mut g = ConnectivityGraph::init([0, 1]);
        assert!(!g.all_reported());
        g.note(0, 1, bm(&[0, 1]));
        assert!(!g.all_reported());
        g.note(1, 1, bm(&[0, 1]));
        assert!(g.all_reported());
        g.add_uuid(5);
        assert!(!g.all_reported());
    }

    #[test]
    fn test_full_mesh_is_one_clique() {
        let mut g = ConnectivityGraph::init([0, 1, 2]);
        g.note(0, 3, bm(&[0, 1, 2]));
        g.note(1, 4, bm(&[0, 1, 2]));
        g.note(2, 2, bm(&[0, 1, 2]));
        let (clique, maxt) = g.max_clique();
        assert_eq!(clique.uuids().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(maxt, 4);
    }

    #[test]
    fn test_partial_connectivity_drops_to_pair() {
        // A sees everyone, B cannot see C and C cannot see B: the answer
        // is a pair including A, never the full triple.
        let mut g = ConnectivityGraph::init([0, 1, 2]);
        g.note(0, 7, bm(&[0, 1, 2])); // A
        g.note(1, 5, bm(&[0, 1])); // B
        g.note(2, 6, bm(&[0, 2])); // C
        let (clique, maxt) = g.max_clique();
        assert_eq!(clique.count(), 2);
        assert!(clique.test(0));
        // deterministic tie-break keeps {A,B}; max transition is the
        // higher of the two survivors' reports
        assert!(clique.test(1));
        assert_eq!(maxt, 7);
    }

    #[test]
    fn test_max_clique_deterministic_on_same_input() {
        let build = || {
            let mut g = ConnectivityGraph::init([0, 1, 2, 3]);
            g.note(0, 1, bm(&[0, 1, 2, 3]));
            g.note(1, 1, bm(&[0, 1]));
            g.note(2, 1, bm(&[0, 2, 3]));
            g.note(3, 1, bm(&[0, 2, 3]));
            g.max_clique()
        };
        assert_eq!(build(), build());
        let (clique, _) = build();
        assert_eq!(clique.uuids().collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[test]
    fn test_silent_node_is_excluded() {
        // A member that left mid-round gets an empty report noted for it
        // and cannot appear in the clique.
        let mut g = ConnectivityGraph::init([0, 1, 2]);
        g.note(0, 2, bm(&[0, 1, 2]));
        g.note(1, 2, bm(&[0, 1, 2]));
        g.note(2, 0, NodeBitmap::new());
        assert!(g.all_reported());
        let (clique, maxt) = g.max_clique();
        assert_eq!(clique.uuids().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(maxt, 2);
    }

    #[test]
    fn test_late_joiner_edge() {
        let mut g = ConnectivityGraph::init([0]);
        g.note(0, 1, bm(&[0]));
        g.add_uuid(3);
        g.mark_reachable(0, 3);
        assert!(!g.all_reported());
        g.note(3, 9, bm(&[0, 3]));
        assert!(g.all_reported());
        let (clique, maxt) = g.max_clique();
        assert_eq!(clique.uuids().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(maxt, 9);
    }

    #[test]
    fn test_empty_graph() {
        let g = ConnectivityGraph::init([]);
        let (clique, maxt) = g.max_clique();
        assert!(clique.is_empty());
        assert_eq!(maxt, 0);
    }
}
