//! # ccm-core
//!
//! Pure protocol bookkeeping for the CCM cluster membership service:
//! the per-round update table, the leader-side connectivity graph and
//! max-clique membership computer, the partition cookie, leader-election
//! ordering, and bootstrap version-probe state.
//!
//! Everything here is synchronous and I/O-free; the `ccmd` engine owns
//! the policy of when to call what.

pub mod cookie;
pub mod elect;
pub mod graph;
pub mod update;
pub mod version;

// Re-export commonly used types at the crate root
pub use cookie::Cookie;
pub use elect::{is_highest_joiner, seniority_cmp};
pub use graph::ConnectivityGraph;
pub use update::UpdateTable;
pub use version::{ProbeVerdict, RespDropCounter, VersionSeeker};
