//! The CCM protocol engine.
//!
//! One engine task owns the whole protocol context exclusively and
//! processes one event at a time: a transport message, a synthesized
//! leave for a member the transport reported dead, or, when nothing is
//! pending, a synthetic timeout. There is no locking because there is
//! no concurrent mutation; all concurrency lives in the other cluster
//! nodes and in the transport's own tasks.
//!
//! The state machine itself (one handler per state) is in
//! [`states`]; this module holds the context, the event loop, the
//! generic cookie/transition gate, and the send helpers.

mod states;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use ccm_core::{Cookie, ConnectivityGraph, RespDropCounter, UpdateTable, VersionSeeker};
use ccm_proto::constants::CCM_PROTO_VER;
use ccm_proto::error::CcmResult;
use ccm_proto::message::{CcmMessage, CcmPayload};
use ccm_proto::node::{NodeDirectory, NodeStatus};
use ccm_proto::NodeBitmap;

use crate::config::EngineConfig;
use crate::notify::{MemberInfo, MembershipEvent, MembershipObserver};
use crate::transport::{ClusterTransport, TransportEvent};

/// Protocol states.
///
/// `Joined` is the steady state; every other state is a phase of getting
/// there. Per-state timers ride on the variant so entering a state
/// restarts its clock; the leader's connectivity graph and the pending
/// incremental change live on the context because several states hand
/// them to each other.
#[derive(Debug, Clone, Copy)]
pub enum CcmState {
    None,
    VersionRequest,
    Joining,
    SentMemlistReq,
    MemlistRes { since: Instant },
    Joined,
    WaitForChange { since: Instant },
    WaitForMemList { since: Instant },
    NewNodeWaitForMemList { since: Instant },
}

impl CcmState {
    pub fn name(&self) -> &'static str {
        match self {
            CcmState::None => "none",
            CcmState::VersionRequest => "version-request",
            CcmState::Joining => "joining",
            CcmState::SentMemlistReq => "sent-memlistreq",
            CcmState::MemlistRes { .. } => "memlist-res",
            CcmState::Joined => "joined",
            CcmState::WaitForChange { .. } => "wait-for-change",
            CcmState::WaitForMemList { .. } => "wait-for-mem-list",
            CcmState::NewNodeWaitForMemList { .. } => "new-node-wait-for-mem-list",
        }
    }
}

/// Kind of a pending incremental change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    NodeLeave,
    NewNode,
}

/// One in-flight incremental membership change (leader only): which node
/// is joining or leaving, and which members have confirmed seeing it.
#[derive(Debug)]
pub struct PendingChange {
    pub node: String,
    pub kind: ChangeKind,
    acked: NodeBitmap,
    remaining: usize,
}

impl PendingChange {
    /// `remaining` is the number of member acknowledgements required:
    /// every current member for a join, every member but the leaver for
    /// a leave.
    pub fn new(node: &str, kind: ChangeKind, remaining: usize) -> Self {
        Self {
            node: node.to_string(),
            kind,
            acked: NodeBitmap::new(),
            remaining,
        }
    }

    /// Record one member's acknowledgement; duplicates are no-ops.
    pub fn ack(&mut self, uuid: usize) {
        if !self.acked.test(uuid) {
            self.acked.mark(uuid);
            self.remaining = self.remaining.saturating_sub(1);
        }
    }

    pub fn complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn matches(&self, node: &str, kind: ChangeKind) -> bool {
        self.node == node && self.kind == kind
    }
}

/// The whole protocol state, owned exclusively by the engine task.
pub struct ProtocolContext {
    pub(crate) dir: NodeDirectory,
    pub(crate) state: CcmState,
    pub(crate) major: u64,
    pub(crate) minor: u64,
    /// Highest major transition ever observed. Survives resets so
    /// transition numbers only grow across the node's whole history.
    pub(crate) max_trans: u64,
    pub(crate) cookie: Option<Cookie>,
    /// The major transition during which this node joined; 0 = never.
    pub(crate) joined_transition: u64,
    /// UUID of the believed partition leader.
    pub(crate) leader: Option<usize>,
    /// Agreed members, ascending UUID order.
    pub(crate) membership: Vec<usize>,
    pub(crate) update: UpdateTable,
    /// Leader-only, present while collecting connectivity reports.
    pub(crate) graph: Option<ConnectivityGraph>,
    /// Leader-only, present while an incremental change is pending.
    pub(crate) change: Option<PendingChange>,
    /// Nodes that probed us and wait for a context reply.
    pub(crate) joiners: BTreeSet<usize>,
    /// Members the transport reported dead, pending synthetic leaves.
    pub(crate) leave_cache: NodeBitmap,
    pub(crate) seeker: VersionSeeker,
    pub(crate) resp_drops: RespDropCounter,
}

impl ProtocolContext {
    fn new(dir: NodeDirectory, cfg: &EngineConfig) -> Self {
        Self {
            dir,
            state: CcmState::None,
            major: 0,
            minor: 0,
            max_trans: 0,
            cookie: None,
            joined_transition: 0,
            leader: None,
            membership: Vec::new(),
            update: UpdateTable::new(),
            graph: None,
            change: None,
            joiners: BTreeSet::new(),
            leave_cache: NodeBitmap::new(),
            seeker: VersionSeeker::new(cfg.version_probe_retries),
            resp_drops: RespDropCounter::new(cfg.max_response_drops),
        }
    }

    pub(crate) fn already_joined(&self) -> bool {
        self.joined_transition != 0
    }

    pub(crate) fn is_member(&self, uuid: usize) -> bool {
        self.membership.contains(&uuid)
    }

    pub(crate) fn am_i_leader(&self) -> bool {
        self.leader == Some(self.dir.my_uuid())
    }
}

/// Outcome of the generic cookie/transition validation.
pub(crate) enum Gate {
    Pass { major: u64, minor: u64 },
    Drop,
}

/// The protocol engine.
pub struct CcmEngine {
    pub(crate) ctx: ProtocolContext,
    pub(crate) transport: Arc<dyn ClusterTransport>,
    pub(crate) observer: Arc<dyn MembershipObserver>,
    pub(crate) cfg: EngineConfig,
}

impl CcmEngine {
    pub fn new(
        dir: NodeDirectory,
        transport: Arc<dyn ClusterTransport>,
        observer: Arc<dyn MembershipObserver>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            ctx: ProtocolContext::new(dir, &cfg),
            transport,
            observer,
            cfg,
        }
    }

    pub(crate) fn my_uuid(&self) -> usize {
        self.ctx.dir.my_uuid()
    }

    pub(crate) fn my_id(&self) -> String {
        self.ctx.dir.my_id().to_string()
    }

    // -------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------

    /// Initial state decision: a node that is provably alone forms a
    /// single-node cluster at once, everyone else starts probing.
    pub(crate) fn bootstrap(&mut self) {
        if self.ctx.dir.active_node_count() == 1 {
            info!("only active node in the directory, forming solo cluster");
            self.init_to_joined();
        } else {
            self.ctx.state = CcmState::None;
        }
    }

    /// Run the engine until the transport goes away.
    pub async fn run(&mut self) -> CcmResult<()> {
        self.bootstrap();
        loop {
            let msg = self.next_event().await?;
            self.dispatch(msg).await;

            // Drain everything already queued before sleeping again.
            loop {
                if let Some(m) = self.take_cached_leave() {
                    self.dispatch(m).await;
                    continue;
                }
                let transport = self.transport.clone();
                match transport.try_recv().await {
                    Some(ev) => {
                        if let Some(m) = self.absorb(ev) {
                            self.dispatch(m).await;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    /// Produce the next message to process: a cached synthetic leave if
    /// any, otherwise the next transport message, otherwise (after one
    /// keepalive of silence) a synthetic timeout.
    async fn next_event(&mut self) -> CcmResult<CcmMessage> {
        loop {
            if let Some(m) = self.take_cached_leave() {
                return Ok(m);
            }
            let transport = self.transport.clone();
            match timeout(self.cfg.timeouts.keepalive, transport.recv()).await {
                Ok(Ok(ev)) => {
                    if let Some(m) = self.absorb(ev) {
                        return Ok(m);
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(self.timeout_msg()),
            }
        }
    }

    /// Turn a transport event into a protocol message, or fold it into
    /// the context (liveness updates).
    pub(crate) fn absorb(&mut self, ev: TransportEvent) -> Option<CcmMessage> {
        match ev {
            TransportEvent::Message(m) => Some(m),
            TransportEvent::NodeStatus {
                node,
                status,
                generation,
            } => {
                self.note_status(&node, status, generation);
                None
            }
        }
    }

    /// Record a liveness report. A believed member transitioning
    /// active→dead produces exactly one synthetic leave, even if the
    /// transport never delivers an explicit one.
    pub(crate) fn note_status(&mut self, node: &str, status: NodeStatus, generation: i64) {
        debug!("node {} now has status {} (gen={})", node, status, generation);
        let prev = match self.ctx.dir.mark_status(node, status, generation) {
            Some(p) => p,
            None => {
                warn!("status report for unknown node {}", node);
                return;
            }
        };
        if prev == NodeStatus::Active && status == NodeStatus::Dead {
            if let Some(uuid) = self.ctx.dir.uuid_of(node) {
                if self.ctx.is_member(uuid) {
                    self.ctx.leave_cache.mark(uuid);
                }
            }
        }
    }

    /// Pop one synthesized leave from the cache, if any.
    pub(crate) fn take_cached_leave(&mut self) -> Option<CcmMessage> {
        let uuid = self.ctx.leave_cache.uuids().next()?;
        self.ctx.leave_cache.clear(uuid);
        let origin = self.ctx.dir.id_of(uuid)?.to_string();
        Some(CcmMessage::new(
            origin,
            CcmPayload::Leave {
                cookie: self.cookie_str(),
                major: self.ctx.major,
                minor: self.ctx.minor,
            },
        ))
    }

    fn timeout_msg(&self) -> CcmMessage {
        CcmMessage::new(
            self.my_id(),
            CcmPayload::Timeout {
                cookie: self.cookie_str(),
                major: self.ctx.major,
                minor: self.ctx.minor,
            },
        )
    }

    /// Route one message to the handler for the current state.
    pub(crate) async fn dispatch(&mut self, msg: CcmMessage) {
        if !self.ctx.dir.is_valid_node(&msg.origin) {
            warn!("dropping {} from unknown host {}", msg.payload.type_name(), msg.origin);
            return;
        }
        debug!(
            "state={} message={} orig={}",
            self.ctx.state.name(),
            msg.payload.type_name(),
            msg.origin
        );

        // The bootstrap fallthrough: the first event in `None` sends the
        // version probe and the message is then handled as usual.
        if matches!(self.ctx.state, CcmState::None) {
            self.send_probe().await;
            self.ctx.seeker.probe_sent();
            self.ctx.state = CcmState::VersionRequest;
        }

        match self.ctx.state {
            CcmState::None => warn!("INTERNAL LOGIC ERROR: message in state none"),
            CcmState::VersionRequest => self.state_version_request(msg).await,
            CcmState::Joining => self.state_joining(msg).await,
            CcmState::SentMemlistReq => self.state_sent_memlistreq(msg).await,
            CcmState::MemlistRes { since } => self.state_memlist_res(msg, since).await,
            CcmState::Joined => self.state_joined(msg).await,
            CcmState::WaitForChange { since } => self.state_wait_for_change(msg, since).await,
            CcmState::WaitForMemList { since } => self.state_wait_for_mem_list(msg, since).await,
            CcmState::NewNodeWaitForMemList { since } => {
                self.state_new_node_wait_for_mem_list(msg, since).await
            }
        }
    }

    // -------------------------------------------------------------------
    // Generic validation
    // -------------------------------------------------------------------

    /// Cookie and transition gate applied by every post-bootstrap state:
    /// foreign-cookie messages and earlier-major messages are expected
    /// debris of partitioned delivery and are silently dropped. In a
    /// join round an earlier minor is stale as well.
    pub(crate) fn gate(&mut self, msg: &CcmMessage, joining: bool) -> Gate {
        let p = &msg.payload;
        if matches!(p, CcmPayload::ProtoVersion { .. }) {
            // probes carry no context yet
            return Gate::Pass { major: 0, minor: 0 };
        }
        if let (Some(incoming), Some(ours)) = (p.cookie(), self.ctx.cookie.as_ref()) {
            if !ours.matches(incoming) {
                if joining && matches!(p, CcmPayload::ProtoVersionResp { .. }) {
                    // another partition answered our long-gone probe;
                    // remember that it exists
                    self.ctx.seeker.note_foreign_response();
                }
                debug!(
                    "dropping {} from {} with foreign cookie",
                    p.type_name(),
                    msg.origin
                );
                return Gate::Drop;
            }
        }
        let major = p.major().unwrap_or(0);
        if major < self.ctx.major {
            warn!(
                "dropping {} from {} with earlier major transition ({} < {})",
                p.type_name(),
                msg.origin,
                major,
                self.ctx.major
            );
            return Gate::Drop;
        }
        let minor = p.minor().unwrap_or(0);
        if joining && minor < self.ctx.minor {
            return Gate::Drop;
        }
        Gate::Pass { major, minor }
    }

    /// Log an out-of-place message. Our own broadcast echoes are normal
    /// and stay at debug level; anything else might be a Byzantine peer.
    pub(crate) fn drop_unexpected(&self, msg: &CcmMessage) {
        if msg.origin == self.ctx.dir.my_id() {
            debug!(
                "ignoring own {} echo in state {}",
                msg.payload.type_name(),
                self.ctx.state.name()
            );
        } else {
            warn!(
                "dropping message of type {} from {} in state {}. Is this a Byzantine failure?",
                msg.payload.type_name(),
                msg.origin,
                self.ctx.state.name()
            );
        }
    }

    // -------------------------------------------------------------------
    // Context transitions shared by several states
    // -------------------------------------------------------------------

    pub(crate) fn set_major(&mut self, major: u64) {
        self.ctx.major = major;
        if major > self.ctx.max_trans {
            self.ctx.max_trans = major;
        }
    }

    pub(crate) fn cookie_str(&self) -> String {
        self.ctx
            .cookie
            .as_ref()
            .map(|c| c.as_str().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn adopt_membership(&mut self, bm: &NodeBitmap) {
        self.ctx.membership = bm.uuids().collect();
    }

    /// True when `bm` is a different node set than the current
    /// membership. Drives cookie rotation.
    pub(crate) fn membership_changed(&self, bm: &NodeBitmap) -> bool {
        self.ctx.membership.len() != bm.count()
            || self.ctx.membership.iter().any(|&u| !bm.test(u))
    }

    /// Full protocol reset: everything back to the pre-join state. The
    /// high-water transition mark survives so majors stay monotonic.
    pub(crate) fn full_reset(&mut self) {
        if self.ctx.already_joined() {
            self.observer.on_evicted();
        }
        self.ctx.membership.clear();
        self.ctx.graph = None;
        self.ctx.change = None;
        self.ctx.cookie = None;
        self.ctx.major = 0;
        self.ctx.minor = 0;
        self.ctx.leader = None;
        self.ctx.joined_transition = 0;
        self.ctx.update.reset();
        self.ctx.joiners.clear();
        self.ctx.leave_cache = NodeBitmap::new();
        self.ctx.seeker.reset();
        self.ctx.resp_drops.reset();
        self.ctx.state = CcmState::None;
    }

    /// Form a single-node cluster straight from startup.
    pub(crate) fn init_to_joined(&mut self) {
        self.ctx.membership = vec![self.my_uuid()];
        self.set_major(1);
        self.ctx.minor = 0;
        self.ctx.cookie = Some(Cookie::generate());
        self.ctx.leader = Some(self.my_uuid());
        self.ctx.joined_transition = 1;
        self.ctx.state = CcmState::Joined;
        self.report_membership();
    }

    /// A join round concluded we are alone: become a single-node
    /// cluster. Always takes a fresh cookie; we may have picked one up
    /// from a partition we never actually joined.
    pub(crate) async fn solo_rejoin(&mut self) {
        self.ctx.membership = vec![self.my_uuid()];
        self.set_major(self.ctx.major + 1);
        self.ctx.minor = 0;
        self.ctx.cookie = Some(Cookie::generate());
        info!("alone in the partition, cookie changed");
        self.answer_joiners().await;
        self.ctx.leader = Some(self.my_uuid());
        self.ctx.state = CcmState::Joined;
        if !self.ctx.already_joined() {
            self.ctx.joined_transition = 1;
        }
        self.report_membership();
        self.ctx.update.reset();
    }

    /// Enter (or re-enter) the join round: tell the observer, broadcast
    /// our JOIN, switch state. Callers adjust the update table and the
    /// minor transition first.
    pub(crate) async fn enter_joining(&mut self) {
        self.observer.on_joining();
        self.send_join().await;
        self.ctx.state = CcmState::Joining;
    }

    /// Abandon whatever is in flight and restart consensus on the next
    /// minor transition.
    pub(crate) async fn abort_to_joining(&mut self) {
        self.ctx.change = None;
        self.ctx.graph = None;
        self.ctx.update.reset();
        self.ctx.minor += 1;
        self.enter_joining().await;
    }

    /// Publish the current membership to the observer.
    pub(crate) fn report_membership(&self) {
        let ctx = &self.ctx;
        let members: Vec<MemberInfo> = ctx
            .membership
            .iter()
            .map(|&uuid| {
                let born = if ctx.membership.len() == 1 {
                    ctx.major
                } else {
                    match ctx.update.uptime_of(uuid) {
                        Some(0) | None => ctx.major,
                        Some(t) => t,
                    }
                };
                MemberInfo {
                    uuid,
                    id: ctx.dir.id_of(uuid).unwrap_or("?").to_string(),
                    born_on: born,
                }
            })
            .collect();
        let event = MembershipEvent {
            major: ctx.major,
            members,
            is_solo: ctx.membership.len() == 1 && ctx.dir.only_active_node(),
        };
        self.observer.on_new_membership(&event);
    }

    // -------------------------------------------------------------------
    // Outbound messages
    // -------------------------------------------------------------------

    pub(crate) fn msg(&self, payload: CcmPayload) -> CcmMessage {
        CcmMessage::new(self.ctx.dir.my_id(), payload)
    }

    /// Broadcast with the bounded retry budget. Returns false when the
    /// budget is exhausted; callers decide whether that dooms the round.
    pub(crate) async fn broadcast_retry(&self, msg: CcmMessage, what: &str) -> bool {
        for attempt in 0..self.cfg.send_retries {
            match self.transport.broadcast(msg.clone()).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!("failure to send {} (attempt {}): {}", what, attempt + 1, e);
                    sleep(self.cfg.send_retry_delay).await;
                }
            }
        }
        false
    }

    /// Unicast with the bounded retry budget.
    pub(crate) async fn unicast_retry(&self, node: &str, msg: CcmMessage, what: &str) -> bool {
        for attempt in 0..self.cfg.send_retries {
            match self.transport.unicast(node, msg.clone()).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        "failure to send {} to {} (attempt {}): {}",
                        what,
                        node,
                        attempt + 1,
                        e
                    );
                    sleep(self.cfg.send_retry_delay).await;
                }
            }
        }
        false
    }

    pub(crate) async fn send_probe(&self) {
        let m = self.msg(CcmPayload::ProtoVersion {
            version: CCM_PROTO_VER,
        });
        self.broadcast_retry(m, "protoversion").await;
    }

    pub(crate) async fn send_join(&self) {
        let m = self.msg(CcmPayload::Join {
            cookie: self.cookie_str(),
            major: self.ctx.major,
            minor: self.ctx.minor,
            uptime: self.ctx.joined_transition,
        });
        self.broadcast_retry(m, "join").await;
    }

    pub(crate) async fn send_alive(&self) {
        let m = self.msg(CcmPayload::Alive {
            cookie: self.cookie_str(),
            major: self.ctx.major,
            minor: self.ctx.minor,
        });
        self.broadcast_retry(m, "alive").await;
    }

    pub(crate) async fn send_leave(&self) {
        let m = self.msg(CcmPayload::Leave {
            cookie: self.cookie_str(),
            major: self.ctx.major,
            minor: self.ctx.minor,
        });
        self.broadcast_retry(m, "leave").await;
    }

    pub(crate) async fn send_abort(&self, dest: &str, major: u64, minor: u64) {
        let m = self.msg(CcmPayload::Abort {
            cookie: self.cookie_str(),
            major,
            minor,
        });
        self.unicast_retry(dest, m, "abort").await;
    }

    pub(crate) async fn send_memlist_request(&self) {
        let m = self.msg(CcmPayload::ReqMemlist {
            cookie: self.cookie_str(),
            major: self.ctx.major,
            minor: self.ctx.minor,
        });
        self.broadcast_retry(m, "req-memlist").await;
    }

    /// Send our connectivity report. `None` sends the null bitmap, the
    /// reply for someone we do not believe is the leader.
    pub(crate) async fn send_memlist_res(&self, dest: &str, memlist: Option<&NodeBitmap>) {
        let wire = memlist.cloned().unwrap_or_default().to_wire();
        let m = self.msg(CcmPayload::ResMemlist {
            cookie: self.cookie_str(),
            major: self.ctx.major,
            minor: self.ctx.minor,
            max_trans: self.ctx.max_trans,
            memlist: wire,
        });
        self.unicast_retry(dest, m, "res-memlist").await;
    }

    pub(crate) async fn send_joiner_reply(&self, dest: &str) -> bool {
        let m = self.msg(CcmPayload::ProtoVersionResp {
            version: CCM_PROTO_VER,
            cookie: self.cookie_str(),
            major: self.ctx.major,
            cluster_size: self.ctx.membership.len(),
        });
        self.unicast_retry(dest, m, "protoversion-resp").await
    }

    /// Answer every cached joiner with the context it needs, then forget
    /// them. Our own probe echo may be cached too; we do not owe
    /// ourselves a reply.
    pub(crate) async fn answer_joiners(&mut self) {
        let joiners = std::mem::take(&mut self.ctx.joiners);
        for uuid in joiners {
            if uuid == self.my_uuid() {
                continue;
            }
            if let Some(id) = self.ctx.dir.id_of(uuid).map(str::to_string) {
                self.send_joiner_reply(&id).await;
            }
        }
    }

    pub(crate) async fn send_node_leave_to_leader(&self, node: &str) {
        let leader = match self.ctx.leader.and_then(|u| self.ctx.dir.id_of(u)) {
            Some(l) => l.to_string(),
            None => return,
        };
        let m = self.msg(CcmPayload::NodeLeave {
            cookie: self.cookie_str(),
            major: self.ctx.major,
            minor: self.ctx.minor,
            uptime: self.ctx.joined_transition,
            node: node.to_string(),
        });
        self.unicast_retry(&leader, m, "node-leave").await;
    }

    pub(crate) async fn send_newnode_to_leader(&self, node: &str) {
        let leader = match self.ctx.leader.and_then(|u| self.ctx.dir.id_of(u)) {
            Some(l) => l.to_string(),
            None => return,
        };
        let m = self.msg(CcmPayload::NewNode {
            cookie: self.cookie_str(),
            major: self.ctx.major,
            minor: self.ctx.minor,
            uptime: self.ctx.joined_transition,
            node: node.to_string(),
        });
        self.unicast_retry(&leader, m, "new-node").await;
    }

    /// Broadcast the incremental membership update: bitmap plus the
    /// members' uptimes in the same ascending-UUID order.
    pub(crate) async fn send_mem_list_to_all(&self, new_cookie: &Cookie) {
        let mut bm = NodeBitmap::new();
        for &u in &self.ctx.membership {
            bm.mark(u);
        }
        let uptimes: Vec<u64> = self
            .ctx
            .membership
            .iter()
            .map(|&u| self.ctx.update.uptime_of(u).unwrap_or(0))
            .collect();
        let m = self.msg(CcmPayload::MemList {
            cookie: self.cookie_str(),
            major: self.ctx.major,
            minor: self.ctx.minor,
            memlist: bm.to_wire(),
            uptimes,
            new_cookie: Some(new_cookie.as_str().to_string()),
        });
        self.broadcast_retry(m, "mem-list").await;
    }
}
