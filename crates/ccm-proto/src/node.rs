/// Node directory types.
///
/// The directory is the low-level membership table: it maps string node
/// identifiers to small-integer UUIDs and tracks liveness as reported by
/// the transport. The protocol engine reads it constantly but only ever
/// mutates liveness; identity is fixed at startup from the roster.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::MAXNODE;
use crate::error::{CcmError, CcmResult};

/// Liveness status of a directory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Reachable and participating.
    Active,
    /// Unreachable or departed.
    Dead,
    /// Reachable but excluded from membership (quorum witness).
    PingOnly,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Dead => write!(f, "dead"),
            NodeStatus::PingOnly => write!(f, "ping"),
        }
    }
}

/// One directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirNode {
    /// Stable string identifier (hostname in practice).
    pub id: String,
    /// Liveness as last reported by the transport.
    pub status: NodeStatus,
    /// Transport generation of the last status report. A node that died
    /// and came back carries a higher generation.
    pub generation: i64,
}

/// The node directory.
///
/// UUIDs are indices into the entry vector. Entries are sorted by
/// identifier at construction so that every node in the cluster derives
/// the identical id-to-UUID mapping from the same roster; connectivity
/// bitmaps are exchanged in UUID space and depend on this.
#[derive(Debug, Clone)]
pub struct NodeDirectory {
    nodes: Vec<DirNode>,
    me: usize,
}

impl NodeDirectory {
    /// Build a directory from the roster. `my_id` must appear in `ids`.
    /// All nodes start out `Active`; the transport corrects that as it
    /// learns better.
    pub fn new(my_id: &str, ids: &[String]) -> CcmResult<Self> {
        if ids.len() > MAXNODE {
            return Err(CcmError::DirectoryFull);
        }
        let mut sorted: Vec<String> = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let nodes: Vec<DirNode> = sorted
            .into_iter()
            .map(|id| DirNode {
                id,
                status: NodeStatus::Active,
                generation: -1,
            })
            .collect();
        let me = nodes
            .iter()
            .position(|n| n.id == my_id)
            .ok_or(CcmError::UnknownNode)?;
        Ok(Self { nodes, me })
    }

    pub fn is_valid_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn uuid_of(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    pub fn id_of(&self, uuid: usize) -> Option<&str> {
        self.nodes.get(uuid).map(|n| n.id.as_str())
    }

    pub fn status_of(&self, uuid: usize) -> Option<NodeStatus> {
        self.nodes.get(uuid).map(|n| n.status)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn active_node_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Active)
            .count()
    }

    pub fn my_id(&self) -> &str {
        &self.nodes[self.me].id
    }

    pub fn my_uuid(&self) -> usize {
        self.me
    }

    /// True when this node is the only active entry.
    pub fn only_active_node(&self) -> bool {
        self.active_node_count() == 1 && self.nodes[self.me].status == NodeStatus::Active
    }

    /// Record a liveness report. Returns the previous status, or `None`
    /// for an identifier the directory does not know.
    pub fn mark_status(&mut self, id: &str, status: NodeStatus, generation: i64) -> Option<NodeStatus> {
        let node = self.nodes.iter_mut().find(|n| n.id == id)?;
        let prev = node.status;
        node.status = status;
        node.generation = generation;
        Some(prev)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &DirNode)> {
        self.nodes.iter().enumerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_uuid_assignment_is_sorted_and_stable() {
        let dir = NodeDirectory::new("nodeb", &roster(&["nodec", "nodea", "nodeb"])).unwrap();
        assert_eq!(dir.uuid_of("nodea"), Some(0));
        assert_eq!(dir.uuid_of("nodeb"), Some(1));
        assert_eq!(dir.uuid_of("nodec"), Some(2));
        assert_eq!(dir.my_uuid(), 1);
        assert_eq!(dir.id_of(2), Some("nodec"));
    }

    #[test]
    fn test_mark_status_reports_previous() {
        let mut dir = NodeDirectory::new("a", &roster(&["a", "b"])).unwrap();
        assert_eq!(dir.mark_status("b", NodeStatus::Dead, 3), Some(NodeStatus::Active));
        assert_eq!(dir.mark_status("b", NodeStatus::Dead, 3), Some(NodeStatus::Dead));
        assert_eq!(dir.active_node_count(), 1);
        assert!(dir.only_active_node());
        assert_eq!(dir.mark_status("nosuch", NodeStatus::Dead, 0), None);
    }

    #[test]
    fn test_unknown_self_is_rejected() {
        assert!(NodeDirectory::new("x", &roster(&["a", "b"])).is_err());
    }
}
