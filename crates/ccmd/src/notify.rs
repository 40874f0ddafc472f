//! Client notification surface.
//!
//! The engine reports converged membership to exactly one observer; the
//! fencing subsystem, resource managers, and anything else that cares
//! sit behind it. Callbacks run on the engine task and must not block.

use tracing::{info, warn};

/// One member of a published membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Directory UUID.
    pub uuid: usize,
    /// Node identifier.
    pub id: String,
    /// The major transition during which this member joined.
    pub born_on: u64,
}

/// A converged membership, published once per completed round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    /// Major transition identifying this membership generation.
    pub major: u64,
    /// Members in ascending UUID order.
    pub members: Vec<MemberInfo>,
    /// True when this node is alone and the directory shows no other
    /// active node.
    pub is_solo: bool,
}

/// Receiver of membership changes.
pub trait MembershipObserver: Send + Sync {
    /// A new membership has been agreed.
    fn on_new_membership(&self, event: &MembershipEvent);

    /// This node has been forced out and will rejoin from scratch.
    fn on_evicted(&self);

    /// A consensus round has started; membership is unstable until the
    /// next `on_new_membership`.
    fn on_joining(&self);
}

/// Default observer: logs the events.
pub struct LogObserver;

impl MembershipObserver for LogObserver {
    fn on_new_membership(&self, event: &MembershipEvent) {
        info!(
            "membership: transition={} members={} solo={}",
            event.major,
            event.members.len(),
            event.is_solo
        );
        for m in &event.members {
            info!("membership:   {} (uuid={}, born on {})", m.id, m.uuid, m.born_on);
        }
    }

    fn on_evicted(&self) {
        warn!("membership: evicted from the partition, rejoining from scratch");
    }

    fn on_joining(&self) {
        info!("membership: join round started");
    }
}
