//! Tunable operational defaults for the CCM daemon.
//!
//! Protocol-level constants (wire sizes, version numbers, MAXNODE) live in
//! [`crate::constants`]. This module centralizes the configurable defaults
//! that can be overridden via CLI flags.

// ─── Timeout Ladder ─────────────────────────────────────────────────────────
//
// All protocol timeouts are multiples of one keepalive interval, so a
// single flag retunes the whole ladder.

/// Default keepalive interval (milliseconds). Base unit of every
/// protocol timeout below.
pub const DEFAULT_KEEPALIVE_MS: u64 = 1000;

/// Update-round timeout, in keepalive intervals. Bounds how long a node
/// collects JOIN replies before electing a leader anyway.
pub const UPDATE_TIMEOUT_MULT: u32 = 9;

/// Long-update timeout, in keepalive intervals. A non-leader stuck in a
/// join round this long gives up and resets.
pub const LONG_UPDATE_TIMEOUT_MULT: u32 = 30;

/// Version-probe timeout, in keepalive intervals. Interval between
/// re-broadcasts of the bootstrap version probe.
pub const VERSION_TIMEOUT_MULT: u32 = 9;

/// Inter-follower timeout, in keepalive intervals. The leader stops
/// waiting for connectivity reports after this.
pub const IFF_TIMEOUT_MULT: u32 = 12;

/// Leader-orphan timeout, in keepalive intervals. A leader whose round ran
/// this long assumes every follower has given up on it.
pub const ITF_TIMEOUT_MULT: u32 = 18;

/// Extra slack (seconds) a follower grants the leader beyond the
/// leader-orphan timeout before restarting the round itself.
pub const FINAL_LIST_EXTRA_SECS: u64 = 5;

// ─── Retry Budgets ──────────────────────────────────────────────────────────

/// Attempts for any single outbound send before the round gives up.
pub const DEFAULT_SEND_RETRIES: u32 = 10;

/// Sleep between send retries (milliseconds).
pub const DEFAULT_SEND_RETRY_DELAY_MS: u64 = 50;

/// Version-probe responses from an undersized partition that may be
/// dropped while waiting for a reply from a majority partition.
pub const DEFAULT_MAX_RESPONSE_DROPS: u32 = 3;

/// Version-probe re-broadcasts before the highest-joiner check decides
/// whether to form a single-node cluster.
pub const DEFAULT_VERSION_PROBE_RETRIES: u32 = 3;

// ─── Channels ───────────────────────────────────────────────────────────────

/// Channel buffer size for the transport event queue.
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 512;

/// Channel buffer size for the local driver event queue.
pub const DEFAULT_LOCAL_EVENT_CHANNEL_SIZE: usize = 256;

/// Channel buffer size for per-peer write queues in the mesh driver.
pub const DEFAULT_PEER_WRITE_CHANNEL_SIZE: usize = 128;

// ─── Mesh Driver Tuning ─────────────────────────────────────────────────────

/// Interval between mesh keepalive pings (seconds).
pub const DEFAULT_MESH_PING_INTERVAL_SECS: u64 = 5;

/// Silence window after which a mesh peer is declared dead (seconds).
pub const DEFAULT_MESH_PEER_TIMEOUT_SECS: u64 = 15;

/// Maximum size of a single mesh wire message (bytes). Protocol messages
/// are small; anything larger than this is a corrupt length prefix.
pub const DEFAULT_MESH_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
