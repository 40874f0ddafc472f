//! Cluster transport drivers for the ccm daemon.
//!
//! The transport delivers protocol messages between nodes (best-effort
//! broadcast, point-to-point unicast) and reports node liveness changes.
//! It makes no reliability or authentication promises; the protocol
//! engine is built to survive loss, duplication, and partition.
//!
//! Two implementations are provided:
//! - `local`: in-process driver for single-node operation and tests.
//! - `mesh`: fully-connected TCP mesh for production multi-node clusters.
//!
//! Broadcast loops back to the sender: the engine sees its own JOIN and
//! ALIVE broadcasts exactly like everyone else does.

use async_trait::async_trait;

use ccm_proto::error::CcmResult;
use ccm_proto::message::CcmMessage;
use ccm_proto::node::NodeStatus;

/// Events delivered from the transport to the protocol engine.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An inbound protocol message.
    Message(CcmMessage),
    /// A node liveness change observed by the transport.
    NodeStatus {
        node: String,
        status: NodeStatus,
        /// Transport generation; a node that died and came back carries
        /// a higher generation.
        generation: i64,
    },
}

/// Trait that all cluster transport backends must implement.
///
/// The engine interacts with the cluster only through this trait, so the
/// underlying substrate (in-process channel, TCP mesh, something else)
/// can be swapped transparently.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Human-readable name of this driver (e.g. "local", "mesh").
    fn name(&self) -> &str;

    /// Best-effort broadcast to every node, including the sender.
    async fn broadcast(&self, msg: CcmMessage) -> CcmResult<()>;

    /// Best-effort point-to-point send.
    async fn unicast(&self, node: &str, msg: CcmMessage) -> CcmResult<()>;

    /// Receive the next transport event. Blocks (async) until one is
    /// available.
    async fn recv(&self) -> CcmResult<TransportEvent>;

    /// Drain one already-queued event without waiting, if any.
    async fn try_recv(&self) -> Option<TransportEvent>;
}

pub mod local;
pub mod mesh;
