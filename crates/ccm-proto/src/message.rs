//! CCM wire messages.
//!
//! Every protocol message carries its originator plus a typed payload.
//! Most payloads are scoped to one partition instance by a cookie and a
//! `(major, minor)` transition pair; the accessor helpers below let the
//! engine validate those generically without matching on every variant.

use serde::{Deserialize, Serialize};

/// A protocol message as read from (or written to) the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcmMessage {
    /// Identifier of the sending node.
    pub origin: String,
    /// The protocol payload.
    pub payload: CcmPayload,
    /// Opaque client data carried alongside the payload. Never
    /// interpreted by the engine.
    pub private: Option<Vec<u8>>,
}

impl CcmMessage {
    pub fn new(origin: impl Into<String>, payload: CcmPayload) -> Self {
        Self {
            origin: origin.into(),
            payload,
            private: None,
        }
    }
}

/// Typed protocol payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CcmPayload {
    /// Bootstrap probe for the active protocol version and partition
    /// context. Carries no cookie: the sender does not have one yet.
    ProtoVersion { version: u8 },

    /// Reply to a probe, sent by the leader of a joined partition.
    ProtoVersionResp {
        version: u8,
        cookie: String,
        major: u64,
        /// Size of the replying partition, a quorum hint for the joiner.
        cluster_size: usize,
    },

    /// Start (or restart) a consensus round.
    Join {
        cookie: String,
        major: u64,
        minor: u64,
        /// The major transition during which the sender last joined;
        /// 0 when it never has. Seniority input for leader election.
        uptime: u64,
    },

    /// Leader's broadcast request for connectivity reports.
    ReqMemlist { cookie: String, major: u64, minor: u64 },

    /// A member's connectivity report, unicast to the leader.
    ResMemlist {
        cookie: String,
        major: u64,
        minor: u64,
        /// Highest major transition the sender has ever observed.
        max_trans: u64,
        /// Reachability bitmap, wire-encoded.
        memlist: String,
    },

    /// Leader's consensus result closing a full round.
    FinalMemlist {
        cookie: String,
        major: u64,
        minor: u64,
        /// The new major transition for the published membership.
        max_trans: u64,
        memlist: String,
        /// Present when the membership changed and the partition context
        /// rotates.
        new_cookie: Option<String>,
    },

    /// Rejection of a JOIN that arrived ahead of the sender's round.
    Abort { cookie: String, major: u64, minor: u64 },

    /// Departure, voluntary or synthesized from a liveness report.
    Leave { cookie: String, major: u64, minor: u64 },

    /// Departure observation forwarded by a member to the leader.
    NodeLeave {
        cookie: String,
        major: u64,
        minor: u64,
        uptime: u64,
        /// The node observed leaving.
        node: String,
    },

    /// Leader's incremental membership broadcast (single join/leave,
    /// no full re-election).
    MemList {
        cookie: String,
        major: u64,
        minor: u64,
        memlist: String,
        /// Per-member uptimes, aligned with the ascending-UUID order of
        /// `memlist`.
        uptimes: Vec<u64>,
        new_cookie: Option<String>,
    },

    /// A new node announcing itself to an already-joined partition.
    Alive { cookie: String, major: u64, minor: u64 },

    /// Join observation forwarded by a member to the leader.
    NewNode {
        cookie: String,
        major: u64,
        minor: u64,
        uptime: u64,
        node: String,
    },

    /// Synthetic timeout injected by the engine when no message is
    /// pending. Never sent on the wire.
    Timeout { cookie: String, major: u64, minor: u64 },
}

impl CcmPayload {
    /// Short type tag, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            CcmPayload::ProtoVersion { .. } => "protoversion",
            CcmPayload::ProtoVersionResp { .. } => "protoversion-resp",
            CcmPayload::Join { .. } => "join",
            CcmPayload::ReqMemlist { .. } => "req-memlist",
            CcmPayload::ResMemlist { .. } => "res-memlist",
            CcmPayload::FinalMemlist { .. } => "final-memlist",
            CcmPayload::Abort { .. } => "abort",
            CcmPayload::Leave { .. } => "leave",
            CcmPayload::NodeLeave { .. } => "node-leave",
            CcmPayload::MemList { .. } => "mem-list",
            CcmPayload::Alive { .. } => "alive",
            CcmPayload::NewNode { .. } => "new-node",
            CcmPayload::Timeout { .. } => "timeout",
        }
    }

    /// The cookie scoping this payload, if it carries one.
    pub fn cookie(&self) -> Option<&str> {
        match self {
            CcmPayload::ProtoVersion { .. } => None,
            CcmPayload::ProtoVersionResp { cookie, .. }
            | CcmPayload::Join { cookie, .. }
            | CcmPayload::ReqMemlist { cookie, .. }
            | CcmPayload::ResMemlist { cookie, .. }
            | CcmPayload::FinalMemlist { cookie, .. }
            | CcmPayload::Abort { cookie, .. }
            | CcmPayload::Leave { cookie, .. }
            | CcmPayload::NodeLeave { cookie, .. }
            | CcmPayload::MemList { cookie, .. }
            | CcmPayload::Alive { cookie, .. }
            | CcmPayload::NewNode { cookie, .. }
            | CcmPayload::Timeout { cookie, .. } => Some(cookie),
        }
    }

    /// The major transition this payload was sent under.
    pub fn major(&self) -> Option<u64> {
        match self {
            CcmPayload::ProtoVersion { .. } => None,
            CcmPayload::ProtoVersionResp { major, .. }
            | CcmPayload::Join { major, .. }
            | CcmPayload::ReqMemlist { major, .. }
            | CcmPayload::ResMemlist { major, .. }
            | CcmPayload::FinalMemlist { major, .. }
            | CcmPayload::Abort { major, .. }
            | CcmPayload::Leave { major, .. }
            | CcmPayload::NodeLeave { major, .. }
            | CcmPayload::MemList { major, .. }
            | CcmPayload::Alive { major, .. }
            | CcmPayload::NewNode { major, .. }
            | CcmPayload::Timeout { major, .. } => Some(*major),
        }
    }

    /// The minor transition this payload was sent under.
    pub fn minor(&self) -> Option<u64> {
        match self {
            CcmPayload::ProtoVersion { .. } | CcmPayload::ProtoVersionResp { .. } => None,
            CcmPayload::Join { minor, .. }
            | CcmPayload::ReqMemlist { minor, .. }
            | CcmPayload::ResMemlist { minor, .. }
            | CcmPayload::FinalMemlist { minor, .. }
            | CcmPayload::Abort { minor, .. }
            | CcmPayload::Leave { minor, .. }
            | CcmPayload::NodeLeave { minor, .. }
            | CcmPayload::MemList { minor, .. }
            | CcmPayload::Alive { minor, .. }
            | CcmPayload::NewNode { minor, .. }
            | CcmPayload::Timeout { minor, .. } => Some(*minor),
        }
    }

    /// True for the synthetic timeout pseudo-message.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CcmPayload::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let p = CcmPayload::Join {
            cookie: "abc".into(),
            major: 4,
            minor: 2,
            uptime: 1,
        };
        assert_eq!(p.type_name(), "join");
        assert_eq!(p.cookie(), Some("abc"));
        assert_eq!(p.major(), Some(4));
        assert_eq!(p.minor(), Some(2));
        assert!(!p.is_timeout());

        let probe = CcmPayload::ProtoVersion { version: 1 };
        assert_eq!(probe.cookie(), None);
        assert_eq!(probe.major(), None);
        assert_eq!(probe.minor(), None);
    }

    #[test]
    fn test_bincode_round_trip() {
        let msg = CcmMessage::new(
            "nodea",
            CcmPayload::ResMemlist {
                cookie: "c".into(),
                major: 1,
                minor: 0,
                max_trans: 7,
                memlist: "00".repeat(16),
            },
        );
        let bytes = bincode::serialize(&msg).unwrap();
        let back: CcmMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.origin, "nodea");
        assert_eq!(back.payload.type_name(), "res-memlist");
    }
}
