//! Per-state message handlers.
//!
//! Each handler owns one protocol state and is a match over message
//! type, the shape the protocol is specified in. Handlers never panic on
//! bad input: anything malformed, stale, or out of place is logged and
//! dropped, and the state machine moves on.

use std::time::Instant;

use tracing::{debug, info, warn};

use ccm_core::{is_highest_joiner, ConnectivityGraph, Cookie, ProbeVerdict};
use ccm_proto::constants::{CCM_PROTO_VER, CCM_PROTO_VER_MIN};
use ccm_proto::message::{CcmMessage, CcmPayload};
use ccm_proto::NodeBitmap;

use super::{CcmEngine, CcmState, ChangeKind, Gate, PendingChange};

impl CcmEngine {
    // -------------------------------------------------------------------
    // VERSION_REQUEST
    // -------------------------------------------------------------------

    pub(crate) async fn state_version_request(&mut self, msg: CcmMessage) {
        let origin = msg.origin.clone();
        let origin_uuid = self.ctx.dir.uuid_of(&origin);

        match &msg.payload {
            CcmPayload::ProtoVersionResp {
                version,
                cookie,
                major,
                cluster_size,
            } => {
                if *version < CCM_PROTO_VER_MIN || *version > CCM_PROTO_VER {
                    warn!("unsupported protocol version {} from {}", version, origin);
                    self.full_reset();
                    return;
                }

                // Quorum seeking: an answer from a partition that would
                // still be a minority with us in it may be dropped, a
                // bounded number of times, in the hope that a bigger
                // partition answers.
                let active = self.ctx.dir.active_node_count();
                if self.ctx.resp_drops.can_drop() && (*cluster_size + 1) <= (active + 1) / 2 {
                    debug!(
                        "dropping version response from {}-node partition, waiting for a bigger one",
                        cluster_size
                    );
                    self.ctx.resp_drops.dropped();
                    self.ctx.seeker.reset();
                    self.ctx.joiners.clear();
                    self.ctx.state = CcmState::None;
                    return;
                }
                self.ctx.resp_drops.reset();

                // Adopt the partition context and announce ourselves.
                self.set_major(*major);
                self.ctx.minor = 0;
                self.ctx.cookie = Some(Cookie::new(cookie.clone()));
                self.ctx.seeker.clear_foreign_responses();
                self.send_alive().await;
                self.ctx.update.reset();
                self.ctx.joiners.clear();
                self.ctx.state = CcmState::NewNodeWaitForMemList {
                    since: Instant::now(),
                };
            }

            CcmPayload::Timeout { .. } => {
                match self.ctx.seeker.check_timeout(self.cfg.timeouts.version) {
                    ProbeVerdict::NoChange => {}
                    ProbeVerdict::TryAgain => {
                        self.ctx.state = CcmState::None;
                    }
                    ProbeVerdict::GiveUp => {
                        let highest = {
                            let ctx = &self.ctx;
                            is_highest_joiner(
                                ctx.dir.my_id(),
                                ctx.joiners.iter().filter_map(|&u| ctx.dir.id_of(u)),
                            )
                        };
                        if highest && !self.ctx.seeker.saw_activity() {
                            info!("no answer to version probes, forming solo cluster");
                            self.ctx.joiners.clear();
                            self.init_to_joined();
                        } else {
                            debug!("probe budget spent but not the highest joiner, retrying");
                            self.ctx.seeker.reset();
                            self.ctx.joiners.clear();
                            self.ctx.state = CcmState::None;
                        }
                    }
                }
            }

            // Another starting node; remember it so somebody answers it
            // once a cluster exists.
            CcmPayload::ProtoVersion { .. } => {
                if let Some(uuid) = origin_uuid {
                    self.ctx.joiners.insert(uuid);
                }
            }

            // Join-round traffic means we are not alone out here.
            CcmPayload::Join { .. }
            | CcmPayload::ReqMemlist { .. }
            | CcmPayload::ResMemlist { .. }
            | CcmPayload::FinalMemlist { .. }
            | CcmPayload::Abort { .. } => {
                self.ctx.seeker.note_activity();
            }

            _ => {}
        }
    }

    // -------------------------------------------------------------------
    // JOINING
    // -------------------------------------------------------------------

    pub(crate) async fn state_joining(&mut self, msg: CcmMessage) {
        let (major, minor) = match self.gate(&msg, true) {
            Gate::Pass { major, minor } => (major, minor),
            Gate::Drop => return,
        };
        let origin = msg.origin.clone();
        let origin_uuid = self.ctx.dir.uuid_of(&origin);

        match &msg.payload {
            CcmPayload::ProtoVersionResp { .. } => {
                if self.ctx.already_joined() {
                    warn!("BUG: version response while part of a cluster");
                }
                self.drop_unexpected(&msg);
            }

            CcmPayload::ProtoVersion { .. } => {
                if let Some(uuid) = origin_uuid {
                    self.ctx.joiners.insert(uuid);
                }
            }

            CcmPayload::Join { uptime, .. } => {
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                if minor > self.ctx.minor {
                    // a fresher sub-round supersedes ours
                    self.ctx.update.reset();
                    self.ctx.update.add(uuid, *uptime, true);
                    self.ctx.minor = minor;
                    self.send_join().await;
                } else {
                    self.ctx.update.add(uuid, *uptime, true);
                    if self.ctx.update.count() >= self.ctx.dir.active_node_count() {
                        self.update_phase_complete().await;
                    }
                }
            }

            CcmPayload::ReqMemlist { .. } => {
                // a self-declared leader wants our connectivity; cache
                // the request, answer when our own round settles
                if let Some(uuid) = origin_uuid {
                    self.ctx.update.note_memlist_request(uuid, major);
                }
                self.try_settle_round().await;
            }

            CcmPayload::Timeout { .. } => {
                self.try_settle_round().await;
            }

            CcmPayload::Abort { .. } => {
                // our JOIN was premature for somebody; restart on the
                // next sub-round
                if major == self.ctx.major && minor == self.ctx.minor {
                    self.ctx.minor += 1;
                    self.ctx.update.reset();
                    self.send_join().await;
                }
            }

            CcmPayload::Leave { .. } => {
                if let Some(uuid) = origin_uuid {
                    self.ctx.update.remove(uuid);
                    self.ctx.joiners.remove(&uuid);
                }
            }

            _ => self.drop_unexpected(&msg),
        }
    }

    /// Every active node answered the JOIN solicitation: elect and act.
    async fn update_phase_complete(&mut self) {
        if self.ctx.update.leader_candidate(&self.ctx.dir) == Some(self.my_uuid()) {
            self.become_leader_collect().await;
        } else if self.answer_cached_cl_requests().await {
            self.ctx.state = CcmState::MemlistRes {
                since: Instant::now(),
            };
        }
    }

    /// The timeout path of the join round: elect with whoever answered.
    async fn try_settle_round(&mut self) {
        if !self.ctx.update.round_timed_out(self.cfg.timeouts.update) {
            return;
        }
        if self.ctx.update.leader_candidate(&self.ctx.dir) == Some(self.my_uuid()) {
            if self.ctx.update.count() == 1 {
                // only our own JOIN came back
                if self.ctx.already_joined() || self.ctx.seeker.foreign_responses() == 0 {
                    self.solo_rejoin().await;
                } else {
                    // other partitions answered our probe once; solo-join
                    // here could split the brain
                    self.full_reset();
                }
                return;
            }
            self.become_leader_collect().await;
        } else if self.answer_cached_cl_requests().await {
            self.ctx.state = CcmState::MemlistRes {
                since: Instant::now(),
            };
        } else if self.ctx.update.round_timed_out(self.cfg.timeouts.long_update) {
            self.send_leave().await;
            self.full_reset();
        }
    }

    /// We are the elected leader: solicit connectivity reports. The
    /// leader is just another reporting source and self-reports before
    /// collection begins.
    async fn become_leader_collect(&mut self) {
        self.send_memlist_request().await;
        let mut graph = ConnectivityGraph::init(self.ctx.update.uuids().collect::<Vec<_>>());
        graph.note(
            self.my_uuid(),
            self.ctx.max_trans,
            self.ctx.update.to_bitmap(),
        );
        self.ctx.graph = Some(graph);
        self.ctx.state = CcmState::SentMemlistReq;
    }

    /// Answer the cached memlist requests: the node we believe leads
    /// gets our real connectivity, every other pretender gets the null
    /// bitmap. Returns true when the believed leader was among them.
    async fn answer_cached_cl_requests(&mut self) -> bool {
        if !self.ctx.update.has_memlist_requests() {
            return false;
        }
        let believed = self.ctx.update.leader_candidate(&self.ctx.dir);
        let mut answered = false;
        for (uuid, req_major) in self.ctx.update.take_memlist_requests() {
            let dest = match self.ctx.dir.id_of(uuid) {
                Some(d) => d.to_string(),
                None => continue,
            };
            if Some(uuid) == believed {
                if self.ctx.already_joined() && self.ctx.major != req_major {
                    info!("evicted");
                    self.full_reset();
                    return false;
                }
                let bm = self.ctx.update.to_bitmap();
                self.send_memlist_res(&dest, Some(&bm)).await;
                answered = true;
            } else {
                self.send_memlist_res(&dest, None).await;
            }
        }
        answered
    }

    // -------------------------------------------------------------------
    // SENT_MEMLISTREQ (leader)
    // -------------------------------------------------------------------

    pub(crate) async fn state_sent_memlistreq(&mut self, msg: CcmMessage) {
        let (major, minor) = match self.gate(&msg, false) {
            Gate::Pass { major, minor } => (major, minor),
            Gate::Drop => return,
        };
        let origin = msg.origin.clone();
        let origin_uuid = self.ctx.dir.uuid_of(&origin);

        match &msg.payload {
            CcmPayload::ProtoVersion { .. } => {
                if let Some(uuid) = origin_uuid {
                    self.ctx.joiners.insert(uuid);
                }
            }

            CcmPayload::Join { uptime, .. } => {
                // Too late for this round's election, but leadership is
                // not relinquished; fold the joiner into the round.
                if let Some(uuid) = origin_uuid {
                    info!("considering a late join message from orig={}", origin);
                    self.ctx.update.add(uuid, *uptime, false);
                    let me = self.my_uuid();
                    if let Some(graph) = self.ctx.graph.as_mut() {
                        graph.add_uuid(uuid);
                        graph.mark_reachable(me, uuid);
                    }
                }
            }

            CcmPayload::Timeout { .. } => {
                let waited_long = self
                    .ctx
                    .graph
                    .as_ref()
                    .map(|g| g.timed_out(self.cfg.timeouts.iff))
                    .unwrap_or(false);
                if waited_long {
                    self.finish_collection().await;
                }
            }

            CcmPayload::ReqMemlist { .. } => {
                // a rival leader in a partitioned network; null bitmap
                if origin != self.ctx.dir.my_id() {
                    self.send_memlist_res(&origin, None).await;
                }
            }

            CcmPayload::ResMemlist {
                max_trans, memlist, ..
            } => {
                if minor != self.ctx.minor {
                    return;
                }
                if major != self.ctx.major {
                    warn!(
                        "dropping res-memlist from orig={} msg_major={} mymajor={}",
                        origin, major, self.ctx.major
                    );
                    return;
                }
                let bm = match NodeBitmap::from_wire(memlist) {
                    Ok(b) => b,
                    Err(_) => {
                        warn!("malformed connectivity bitmap from {}", origin);
                        return;
                    }
                };
                if let Some(uuid) = origin_uuid {
                    if let Some(graph) = self.ctx.graph.as_mut() {
                        graph.note(uuid, *max_trans, bm);
                    }
                }
                if self.collection_done() {
                    self.finish_collection().await;
                }
            }

            CcmPayload::Leave { .. } => {
                // a solicited node died mid-round: an empty report
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                if !self.ctx.update.is_member(uuid) {
                    return;
                }
                if let Some(graph) = self.ctx.graph.as_mut() {
                    graph.note(uuid, 0, NodeBitmap::new());
                }
                if self.collection_done() {
                    self.finish_collection().await;
                }
            }

            _ => self.drop_unexpected(&msg),
        }
    }

    fn collection_done(&self) -> bool {
        self.ctx
            .graph
            .as_ref()
            .map(|g| g.all_reported())
            .unwrap_or(false)
    }

    /// Collection is over, one way or the other. A leader that ran past
    /// the orphan limit assumes every follower has already given up on
    /// it and bows out instead of publishing.
    async fn finish_collection(&mut self) {
        let orphaned = self
            .ctx
            .graph
            .as_ref()
            .map(|g| g.timed_out(self.cfg.timeouts.itf))
            .unwrap_or(true);
        if orphaned {
            self.send_leave().await;
            self.full_reset();
        } else {
            self.compute_and_send_final().await;
        }
    }

    /// Reduce the collected reports to the final membership and publish
    /// it.
    async fn compute_and_send_final(&mut self) {
        let (clique, maxt) = match self.ctx.graph.as_ref() {
            Some(g) => g.max_clique(),
            None => return,
        };
        let new_major = maxt + 1;

        if !clique.test(self.my_uuid()) {
            // we fell out of our own round's connectivity
            warn!("computed membership excludes this node, resetting");
            self.send_leave().await;
            self.full_reset();
            return;
        }

        let new_cookie = if self.membership_changed(&clique) {
            Some(Cookie::generate())
        } else {
            None
        };
        let payload = CcmPayload::FinalMemlist {
            cookie: self.cookie_str(),
            major: self.ctx.major,
            minor: self.ctx.minor,
            max_trans: new_major,
            memlist: clique.to_wire(),
            new_cookie: new_cookie.as_ref().map(|c| c.as_str().to_string()),
        };
        if !self.broadcast_retry(self.msg(payload), "final-memlist").await {
            // keep collecting; the orphan limit will clean this up
            return;
        }

        self.adopt_membership(&clique);
        self.set_major(new_major);
        self.ctx.minor = 0;
        if let Some(c) = new_cookie {
            info!("membership changed, cookie rotated");
            self.ctx.cookie = Some(c);
        }
        self.answer_joiners().await;
        self.ctx.leader = Some(self.my_uuid());
        self.report_membership(); // before the update table resets
        self.ctx.update.reset();
        self.ctx.graph = None;
        self.ctx.state = CcmState::Joined;
        if !self.ctx.already_joined() {
            self.ctx.joined_transition = new_major;
        }
    }

    // -------------------------------------------------------------------
    // MEMLIST_RES (follower)
    // -------------------------------------------------------------------

    pub(crate) async fn state_memlist_res(&mut self, msg: CcmMessage, since: Instant) {
        let (major, minor) = match self.gate(&msg, false) {
            Gate::Pass { major, minor } => (major, minor),
            Gate::Drop => return,
        };
        let origin = msg.origin.clone();
        let origin_uuid = self.ctx.dir.uuid_of(&origin);

        match &msg.payload {
            CcmPayload::ProtoVersion { .. } => {
                if let Some(uuid) = origin_uuid {
                    self.ctx.joiners.insert(uuid);
                }
            }

            CcmPayload::Join { uptime, .. } => {
                // Either the leader died and somebody restarted (higher
                // minor), or the leader's final list reached others but
                // not us and a fresh round began (higher major; the
                // late sender must restart, tell it so).
                if major > self.ctx.major {
                    self.send_abort(&origin, major, minor).await;
                } else if minor > self.ctx.minor {
                    let uuid = match origin_uuid {
                        Some(u) => u,
                        None => return,
                    };
                    self.ctx.update.reset();
                    self.ctx.update.add(uuid, *uptime, true);
                    self.ctx.minor = minor;
                    self.enter_joining().await;
                }
            }

            CcmPayload::ReqMemlist { .. } => {
                if minor == self.ctx.minor {
                    // another pretender; null bitmap
                    self.send_memlist_res(&origin, None).await;
                } else {
                    // someone is already leading a newer sub-round we
                    // never saw; something is seriously wrong with us
                    self.send_leave().await;
                    self.full_reset();
                }
            }

            CcmPayload::Timeout { .. } => {
                if since.elapsed() >= self.cfg.timeouts.final_list {
                    // the leader is taking too long; assume it died
                    self.ctx.update.reset();
                    self.ctx.minor += 1;
                    self.enter_joining().await;
                }
            }

            CcmPayload::Leave { .. } => {
                // only the believed leader's death restarts the round;
                // any other loss is the leader's to confirm
                if origin_uuid.is_some()
                    && origin_uuid == self.ctx.update.leader_candidate(&self.ctx.dir)
                {
                    self.ctx.update.reset();
                    self.ctx.minor += 1;
                    self.enter_joining().await;
                }
            }

            CcmPayload::FinalMemlist {
                max_trans,
                memlist,
                new_cookie,
                ..
            } => {
                self.handle_final_memlist(&origin, major, minor, *max_trans, memlist, new_cookie)
                    .await;
            }

            _ => self.drop_unexpected(&msg),
        }
    }

    async fn handle_final_memlist(
        &mut self,
        origin: &str,
        major: u64,
        minor: u64,
        new_major: u64,
        memlist: &str,
        new_cookie: &Option<String>,
    ) {
        let origin_uuid = self.ctx.dir.uuid_of(origin);
        if origin_uuid.is_none()
            || origin_uuid != self.ctx.update.leader_candidate(&self.ctx.dir)
        {
            warn!("received final memlist from non-leader {}, neglecting", origin);
            return;
        }
        if major != self.ctx.major || minor != self.ctx.minor {
            warn!("final memlist transition versions do not match, rejecting");
            return;
        }
        let bm = match NodeBitmap::from_wire(memlist) {
            Ok(b) => b,
            Err(_) => {
                warn!("malformed membership bitmap from {}", origin);
                return;
            }
        };
        if !bm.test(self.my_uuid()) {
            // the agreed membership does not include us
            self.full_reset();
            return;
        }
        self.adopt_membership(&bm);
        self.set_major(new_major);
        self.ctx.minor = 0;
        if let Some(c) = new_cookie {
            info!("leader changed cookie");
            self.ctx.cookie = Some(Cookie::new(c.clone()));
        }
        self.ctx.leader = origin_uuid;
        self.report_membership(); // before the update table resets
        self.ctx.update.reset();
        self.ctx.joiners.clear();
        self.ctx.state = CcmState::Joined;
        if !self.ctx.already_joined() {
            self.ctx.joined_transition = self.ctx.major;
        }
    }

    // -------------------------------------------------------------------
    // JOINED
    // -------------------------------------------------------------------

    pub(crate) async fn state_joined(&mut self, msg: CcmMessage) {
        let (major, minor) = match self.gate(&msg, false) {
            Gate::Pass { major, minor } => (major, minor),
            Gate::Drop => return,
        };
        let origin = msg.origin.clone();
        let origin_uuid = self.ctx.dir.uuid_of(&origin);

        match &msg.payload {
            CcmPayload::ProtoVersionResp { .. } => self.drop_unexpected(&msg),

            CcmPayload::ProtoVersion { .. } => {
                // the last round's leader owns the context reply
                if self.ctx.am_i_leader() {
                    self.send_joiner_reply(&origin).await;
                }
            }

            CcmPayload::Join { uptime, .. } => {
                // somebody is restarting consensus; run with it
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                self.ctx.update.reset();
                self.ctx.update.add(uuid, *uptime, true);
                self.ctx.minor = minor.max(self.ctx.minor);
                self.enter_joining().await;
            }

            CcmPayload::Leave { .. } => {
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                if !self.ctx.is_member(uuid) {
                    return; // a leave for a non-member changes nothing
                }
                if self.ctx.leader == Some(uuid) {
                    // the partition leader died: full re-election
                    self.ctx.update.reset();
                    self.enter_joining().await;
                    return;
                }
                if self.ctx.am_i_leader() {
                    self.begin_change_direct(&origin, ChangeKind::NodeLeave, major)
                        .await;
                } else {
                    self.send_node_leave_to_leader(&origin).await;
                    self.ctx.state = CcmState::WaitForMemList {
                        since: Instant::now(),
                    };
                }
            }

            CcmPayload::NodeLeave { uptime, node, .. } => {
                if !self.ctx.am_i_leader() {
                    return;
                }
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                let expected = self.ctx.membership.len().saturating_sub(1);
                let mut change = PendingChange::new(node, ChangeKind::NodeLeave, expected);
                self.ctx.update.reset();
                change.ack(uuid);
                self.ctx.update.add(uuid, *uptime, false);
                self.ctx.change = Some(change);
                self.ctx.state = CcmState::WaitForChange {
                    since: Instant::now(),
                };
            }

            CcmPayload::Alive { .. } => {
                if self.ctx.am_i_leader() {
                    self.begin_change_direct(&origin, ChangeKind::NewNode, major)
                        .await;
                } else {
                    self.send_newnode_to_leader(&origin).await;
                    self.ctx.state = CcmState::WaitForMemList {
                        since: Instant::now(),
                    };
                }
            }

            CcmPayload::NewNode { uptime, node, .. } => {
                if !self.ctx.am_i_leader() {
                    return;
                }
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                let mut change =
                    PendingChange::new(node, ChangeKind::NewNode, self.ctx.membership.len());
                self.ctx.update.reset();
                change.ack(uuid);
                self.ctx.update.add(uuid, *uptime, false);
                self.ctx.change = Some(change);
                self.ctx.state = CcmState::WaitForChange {
                    since: Instant::now(),
                };
            }

            CcmPayload::Timeout { .. } => {}

            _ => self.drop_unexpected(&msg),
        }
    }

    /// The leader saw a membership change with its own eyes: open the
    /// incremental round with our own acknowledgement already counted.
    /// A cluster small enough that ours is the only acknowledgement
    /// needed completes on the spot.
    async fn begin_change_direct(&mut self, node: &str, kind: ChangeKind, msg_major: u64) {
        let expected = match kind {
            ChangeKind::NodeLeave => self.ctx.membership.len().saturating_sub(1),
            ChangeKind::NewNode => self.ctx.membership.len(),
        };
        let mut change = PendingChange::new(node, kind, expected);
        self.ctx.update.reset();
        change.ack(self.my_uuid());
        self.ctx
            .update
            .add(self.my_uuid(), self.ctx.joined_transition, false);
        let complete = change.complete();
        self.ctx.change = Some(change);
        if complete {
            self.finalize_change(msg_major).await;
        } else {
            self.ctx.state = CcmState::WaitForChange {
                since: Instant::now(),
            };
        }
    }

    /// Every member confirmed the change: apply the delta, rotate the
    /// cookie, broadcast the updated list, bump the major transition.
    async fn finalize_change(&mut self, msg_major: u64) {
        let change = match self.ctx.change.take() {
            Some(c) => c,
            None => return,
        };
        let node_uuid = self.ctx.dir.uuid_of(&change.node);
        let new_cookie = Cookie::generate();

        match change.kind {
            ChangeKind::NodeLeave => {
                if let Some(uuid) = node_uuid {
                    self.ctx.membership.retain(|&m| m != uuid);
                }
            }
            ChangeKind::NewNode => {
                if let Some(uuid) = node_uuid {
                    if !self.ctx.is_member(uuid) {
                        self.ctx.membership.push(uuid);
                        self.ctx.membership.sort_unstable();
                    }
                    // the newcomer is born on the transition we are
                    // about to publish
                    self.ctx.update.add(uuid, msg_major + 1, false);
                }
            }
        }

        // Broadcast carries the pre-bump transition, the way receivers
        // validate it. Nothing to tell when nobody but us is left.
        if !(change.kind == ChangeKind::NodeLeave && self.ctx.membership.len() <= 1) {
            self.send_mem_list_to_all(&new_cookie).await;
        }
        self.set_major(msg_major + 1);
        self.ctx.minor = 0;
        self.ctx.cookie = Some(new_cookie);
        self.report_membership(); // before the update table resets
        self.ctx.update.reset();
        self.answer_joiners().await;
        self.ctx.state = CcmState::Joined;
    }

    // -------------------------------------------------------------------
    // WAIT_FOR_CHANGE (leader)
    // -------------------------------------------------------------------

    pub(crate) async fn state_wait_for_change(&mut self, msg: CcmMessage, since: Instant) {
        let (major, minor) = match self.gate(&msg, false) {
            Gate::Pass { major, minor } => (major, minor),
            Gate::Drop => return,
        };
        let origin = msg.origin.clone();
        let origin_uuid = self.ctx.dir.uuid_of(&origin);

        match &msg.payload {
            CcmPayload::ProtoVersion { .. } => {
                if let Some(uuid) = origin_uuid {
                    self.ctx.joiners.insert(uuid);
                }
            }

            CcmPayload::Leave { .. } => {
                // the departing node's own broadcast doubles as our
                // observation of the pending leave
                if !self.ctx.am_i_leader() {
                    warn!("non-leader in wait-for-change, dropping leave");
                    return;
                }
                self.record_change_ack(
                    &origin.clone(),
                    ChangeKind::NodeLeave,
                    self.my_uuid(),
                    self.ctx.joined_transition,
                    major,
                )
                .await;
            }

            CcmPayload::NodeLeave { uptime, node, .. } => {
                if !self.ctx.am_i_leader() {
                    warn!("non-leader in wait-for-change, dropping node-leave");
                    return;
                }
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                self.record_change_ack(&node.clone(), ChangeKind::NodeLeave, uuid, *uptime, major)
                    .await;
            }

            CcmPayload::Alive { .. } => {
                if !self.ctx.am_i_leader() {
                    warn!("non-leader in wait-for-change, dropping alive");
                    return;
                }
                self.record_change_ack(
                    &origin.clone(),
                    ChangeKind::NewNode,
                    self.my_uuid(),
                    self.ctx.joined_transition,
                    major,
                )
                .await;
            }

            CcmPayload::NewNode { uptime, node, .. } => {
                if !self.ctx.am_i_leader() {
                    warn!("non-leader in wait-for-change, dropping new-node");
                    return;
                }
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                self.record_change_ack(&node.clone(), ChangeKind::NewNode, uuid, *uptime, major)
                    .await;
            }

            CcmPayload::Timeout { .. } => {
                if since.elapsed() >= self.cfg.timeouts.update {
                    // correctness over liveness: restart consensus
                    // rather than guess at a half-confirmed change
                    self.abort_to_joining().await;
                }
            }

            CcmPayload::Join { uptime, .. } => {
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                self.ctx.change = None;
                self.ctx.update.reset();
                self.ctx.update.add(uuid, *uptime, true);
                self.ctx.minor = minor.max(self.ctx.minor);
                self.enter_joining().await;
            }

            _ => self.drop_unexpected(&msg),
        }
    }

    /// Count one acknowledgement toward the pending change; an
    /// observation of a *different* change aborts to a full round
    /// instead.
    async fn record_change_ack(
        &mut self,
        node: &str,
        kind: ChangeKind,
        reporter: usize,
        uptime: u64,
        msg_major: u64,
    ) {
        let matches = self
            .ctx
            .change
            .as_ref()
            .map(|c| c.matches(node, kind))
            .unwrap_or(false);
        if !matches {
            self.abort_to_joining().await;
            return;
        }
        if let Some(change) = self.ctx.change.as_mut() {
            change.ack(reporter);
        }
        self.ctx.update.add(reporter, uptime, false);
        let complete = self
            .ctx
            .change
            .as_ref()
            .map(|c| c.complete())
            .unwrap_or(false);
        if complete {
            self.finalize_change(msg_major).await;
        }
    }

    // -------------------------------------------------------------------
    // WAIT_FOR_MEM_LIST (follower)
    // -------------------------------------------------------------------

    pub(crate) async fn state_wait_for_mem_list(&mut self, msg: CcmMessage, since: Instant) {
        let (major, minor) = match self.gate(&msg, false) {
            Gate::Pass { major, minor } => (major, minor),
            Gate::Drop => return,
        };
        let origin = msg.origin.clone();
        let origin_uuid = self.ctx.dir.uuid_of(&origin);

        match &msg.payload {
            CcmPayload::MemList {
                memlist,
                uptimes,
                new_cookie,
                ..
            } => {
                if major != self.ctx.major || minor != self.ctx.minor {
                    warn!("mem-list transition versions do not match, rejecting");
                    return;
                }
                let bm = match NodeBitmap::from_wire(memlist) {
                    Ok(b) => b,
                    Err(_) => {
                        warn!("malformed membership bitmap from {}", origin);
                        return;
                    }
                };
                self.adopt_membership(&bm);
                self.set_major(major + 1);
                self.ctx.minor = 0;
                if let Some(c) = new_cookie {
                    info!("leader changed cookie");
                    self.ctx.cookie = Some(Cookie::new(c.clone()));
                }
                self.ctx.leader = origin_uuid;
                self.ctx.update.load(bm.uuids().zip(uptimes.iter().copied()));
                self.report_membership();
                self.ctx.state = CcmState::Joined;
            }

            CcmPayload::Timeout { .. } => {
                if since.elapsed() >= self.cfg.timeouts.update {
                    self.ctx.update.reset();
                    self.ctx.minor += 1;
                    self.enter_joining().await;
                }
            }

            CcmPayload::Join { uptime, .. } => {
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                self.ctx.update.reset();
                self.ctx.update.add(uuid, *uptime, true);
                self.ctx.minor = minor.max(self.ctx.minor);
                self.enter_joining().await;
            }

            CcmPayload::Leave { .. } => {
                // only the leader's own death matters here; the leader
                // confirms everyone else's
                if origin_uuid.is_some() && self.ctx.leader == origin_uuid {
                    self.ctx.update.reset();
                    self.ctx.minor += 1;
                    self.enter_joining().await;
                }
            }

            CcmPayload::Alive { .. } => {}

            _ => self.drop_unexpected(&msg),
        }
    }

    // -------------------------------------------------------------------
    // NEW_NODE_WAIT_FOR_MEM_LIST (joining node)
    // -------------------------------------------------------------------

    pub(crate) async fn state_new_node_wait_for_mem_list(
        &mut self,
        msg: CcmMessage,
        since: Instant,
    ) {
        let (major, minor) = match self.gate(&msg, false) {
            Gate::Pass { major, minor } => (major, minor),
            Gate::Drop => return,
        };
        let origin = msg.origin.clone();
        let origin_uuid = self.ctx.dir.uuid_of(&origin);

        match &msg.payload {
            CcmPayload::MemList {
                memlist,
                uptimes,
                new_cookie,
                ..
            } => {
                if major != self.ctx.major || minor != self.ctx.minor {
                    warn!("mem-list transition versions do not match, rejecting");
                    return;
                }
                let bm = match NodeBitmap::from_wire(memlist) {
                    Ok(b) => b,
                    Err(_) => {
                        warn!("malformed membership bitmap from {}", origin);
                        return;
                    }
                };
                if !bm.test(self.my_uuid()) {
                    // our ALIVE was not accepted; start over
                    info!("announced membership excludes this node, restarting");
                    self.ctx.seeker.reset();
                    self.ctx.joiners.clear();
                    self.ctx.state = CcmState::None;
                    return;
                }
                self.adopt_membership(&bm);
                self.set_major(major + 1);
                self.ctx.minor = 0;
                if let Some(c) = new_cookie {
                    info!("leader changed cookie");
                    self.ctx.cookie = Some(Cookie::new(c.clone()));
                }
                self.ctx.leader = origin_uuid;
                self.ctx.joined_transition = self.ctx.major;
                self.ctx.update.load(bm.uuids().zip(uptimes.iter().copied()));
                self.report_membership();
                self.ctx.state = CcmState::Joined;
            }

            CcmPayload::Timeout { .. } => {
                if since.elapsed() >= self.cfg.timeouts.update {
                    self.ctx.update.reset();
                    self.ctx.minor += 1;
                    self.enter_joining().await;
                }
            }

            CcmPayload::Join { uptime, .. } => {
                let uuid = match origin_uuid {
                    Some(u) => u,
                    None => return,
                };
                self.ctx.update.reset();
                self.ctx.update.add(uuid, *uptime, true);
                self.ctx.minor = minor.max(self.ctx.minor);
                self.enter_joining().await;
            }

            CcmPayload::Leave { .. } => {
                if origin_uuid.is_some() && self.ctx.leader == origin_uuid {
                    self.ctx.update.reset();
                    self.ctx.minor += 1;
                    self.enter_joining().await;
                }
            }

            CcmPayload::Alive { .. } => {}

            _ => self.drop_unexpected(&msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::config::{EngineConfig, TimeoutConfig};
    use crate::notify::{MembershipEvent, MembershipObserver};
    use crate::transport::local::LocalHub;
    use crate::transport::{ClusterTransport, TransportEvent};
    use ccm_proto::node::NodeDirectory;

    const CK: &str = "test-cookie-00";

    /// Observer that records every callback for assertions.
    #[derive(Default)]
    struct Recorder {
        joins: Mutex<u32>,
        evictions: Mutex<u32>,
        memberships: Mutex<Vec<MembershipEvent>>,
    }

    impl MembershipObserver for Recorder {
        fn on_new_membership(&self, event: &MembershipEvent) {
            self.memberships.lock().unwrap().push(event.clone());
        }
        fn on_evicted(&self) {
            *self.evictions.lock().unwrap() += 1;
        }
        fn on_joining(&self) {
            *self.joins.lock().unwrap() += 1;
        }
    }

    fn fast_cfg() -> EngineConfig {
        EngineConfig {
            timeouts: TimeoutConfig::from_keepalive(Duration::from_millis(10)),
            send_retries: 2,
            send_retry_delay: Duration::from_millis(1),
            version_probe_retries: 3,
            max_response_drops: 3,
        }
    }

    /// Engine for `me` plus hub endpoints for every other roster node.
    async fn engine(
        me: &str,
        roster: &[&str],
    ) -> (
        CcmEngine,
        Arc<Recorder>,
        Vec<(String, crate::transport::local::LocalTransport)>,
    ) {
        let ids: Vec<String> = roster.iter().map(|s| s.to_string()).collect();
        let dir = NodeDirectory::new(me, &ids).unwrap();
        let hub = LocalHub::new();
        let mine = hub.register(me).await;
        let mut others = Vec::new();
        for id in roster {
            if *id != me {
                others.push((id.to_string(), hub.register(id).await));
            }
        }
        let recorder = Arc::new(Recorder::default());
        let eng = CcmEngine::new(
            dir,
            Arc::new(mine),
            recorder.clone(),
            fast_cfg(),
        );
        (eng, recorder, others)
    }

    fn put_in_joined(eng: &mut CcmEngine, members: &[usize], leader: usize, major: u64) {
        eng.ctx.cookie = Some(Cookie::new(CK));
        eng.ctx.membership = members.to_vec();
        eng.ctx.leader = Some(leader);
        eng.set_major(major);
        eng.ctx.minor = 0;
        eng.ctx.joined_transition = 1;
        eng.ctx.state = CcmState::Joined;
    }

    fn leave(origin: &str, major: u64) -> CcmMessage {
        CcmMessage::new(
            origin,
            CcmPayload::Leave {
                cookie: CK.into(),
                major,
                minor: 0,
            },
        )
    }

    async fn drain_message(t: &crate::transport::local::LocalTransport) -> Option<CcmMessage> {
        loop {
            match t.try_recv().await {
                Some(TransportEvent::Message(m)) => return Some(m),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_leader_leave_forces_rejoin() {
        let (mut eng, rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        put_in_joined(&mut eng, &[0, 1, 2], 1, 3); // nodeb leads

        eng.dispatch(leave("nodeb", 3)).await;

        assert!(matches!(eng.ctx.state, CcmState::Joining));
        assert_eq!(*rec.joins.lock().unwrap(), 1);
        assert_eq!(eng.ctx.update.count(), 0);
    }

    #[tokio::test]
    async fn test_leave_for_absent_member_is_idempotent() {
        let (mut eng, _rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        put_in_joined(&mut eng, &[0, 1], 1, 3); // nodec is not a member

        eng.dispatch(leave("nodec", 3)).await;
        assert!(matches!(eng.ctx.state, CcmState::Joined));
        assert_eq!(eng.ctx.membership, vec![0, 1]);

        // the same synthetic leave again changes nothing either
        eng.dispatch(leave("nodec", 3)).await;
        assert!(matches!(eng.ctx.state, CcmState::Joined));
        assert_eq!(eng.ctx.membership, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_foreign_cookie_is_dropped() {
        let (mut eng, _rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        put_in_joined(&mut eng, &[0, 1, 2], 0, 3);

        let msg = CcmMessage::new(
            "nodeb",
            CcmPayload::Join {
                cookie: "some-other-ctx".into(),
                major: 3,
                minor: 0,
                uptime: 1,
            },
        );
        eng.dispatch(msg).await;

        assert!(matches!(eng.ctx.state, CcmState::Joined));
        assert_eq!(eng.ctx.update.count(), 0);
    }

    #[tokio::test]
    async fn test_earlier_major_is_dropped() {
        let (mut eng, _rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        put_in_joined(&mut eng, &[0, 1, 2], 1, 5);

        // a leave for the leader, but from a previous generation
        eng.dispatch(leave("nodeb", 4)).await;
        assert!(matches!(eng.ctx.state, CcmState::Joined));
    }

    #[tokio::test]
    async fn test_final_memlist_adoption() {
        let (mut eng, rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        eng.ctx.cookie = Some(Cookie::new(CK));
        eng.set_major(2);
        eng.ctx.minor = 1;
        // nodeb (uuid 1) has the lowest uptime and is the believed leader
        eng.ctx.update.add(0, 2, true);
        eng.ctx.update.add(1, 1, true);
        eng.ctx.update.add(2, 2, true);
        eng.ctx.state = CcmState::MemlistRes {
            since: Instant::now(),
        };

        let mut bm = NodeBitmap::new();
        bm.mark(0);
        bm.mark(1);
        let msg = CcmMessage::new(
            "nodeb",
            CcmPayload::FinalMemlist {
                cookie: CK.into(),
                major: 2,
                minor: 1,
                max_trans: 5,
                memlist: bm.to_wire(),
                new_cookie: Some("fresh-cookie-0".into()),
            },
        );
        eng.dispatch(msg).await;

        assert!(matches!(eng.ctx.state, CcmState::Joined));
        assert_eq!(eng.ctx.major, 5);
        assert_eq!(eng.ctx.minor, 0);
        assert_eq!(eng.ctx.membership, vec![0, 1]);
        assert_eq!(eng.ctx.leader, Some(1));
        assert_eq!(eng.ctx.joined_transition, 5);
        assert_eq!(eng.cookie_str(), "fresh-cookie-0");

        let reports = rec.memberships.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].major, 5);
        // born-on values come from the update table, before it resets
        assert_eq!(reports[0].members[0].born_on, 2);
        assert_eq!(reports[0].members[1].born_on, 1);
        assert!(!reports[0].is_solo);
    }

    #[tokio::test]
    async fn test_final_memlist_excluding_self_resets() {
        let (mut eng, rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        eng.ctx.cookie = Some(Cookie::new(CK));
        eng.set_major(2);
        eng.ctx.joined_transition = 2; // we were a member before
        eng.ctx.update.add(1, 1, true);
        eng.ctx.state = CcmState::MemlistRes {
            since: Instant::now(),
        };

        let mut bm = NodeBitmap::new();
        bm.mark(1);
        bm.mark(2);
        let msg = CcmMessage::new(
            "nodeb",
            CcmPayload::FinalMemlist {
                cookie: CK.into(),
                major: 2,
                minor: 0,
                max_trans: 3,
                memlist: bm.to_wire(),
                new_cookie: None,
            },
        );
        eng.dispatch(msg).await;

        assert!(matches!(eng.ctx.state, CcmState::None));
        assert_eq!(*rec.evictions.lock().unwrap(), 1);
        assert!(eng.ctx.membership.is_empty());
        assert_eq!(eng.ctx.joined_transition, 0);
    }

    #[tokio::test]
    async fn test_final_memlist_from_non_leader_rejected() {
        let (mut eng, _rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        eng.ctx.cookie = Some(Cookie::new(CK));
        eng.set_major(2);
        eng.ctx.update.add(1, 1, true); // nodeb is the believed leader
        eng.ctx.update.add(2, 4, true);
        eng.ctx.state = CcmState::MemlistRes {
            since: Instant::now(),
        };

        let msg = CcmMessage::new(
            "nodec",
            CcmPayload::FinalMemlist {
                cookie: CK.into(),
                major: 2,
                minor: 0,
                max_trans: 3,
                memlist: NodeBitmap::solo(0).to_wire(),
                new_cookie: None,
            },
        );
        eng.dispatch(msg).await;
        assert!(matches!(eng.ctx.state, CcmState::MemlistRes { .. }));
    }

    #[tokio::test]
    async fn test_version_response_quorum_drops() {
        let roster = ["nodea", "nodeb", "nodec", "noded", "nodee"];
        let (mut eng, _rec, _others) = engine("nodea", &roster).await;
        eng.bootstrap();
        assert!(matches!(eng.ctx.state, CcmState::None));

        let resp = || {
            CcmMessage::new(
                "nodeb",
                CcmPayload::ProtoVersionResp {
                    version: CCM_PROTO_VER,
                    cookie: CK.into(),
                    major: 4,
                    cluster_size: 1,
                },
            )
        };

        // a 1-node partition in a 5-node cluster is not worth joining
        // yet; the response is dropped up to the budget
        for _ in 0..3 {
            eng.dispatch(resp()).await;
            assert!(matches!(eng.ctx.state, CcmState::None));
            assert!(eng.ctx.cookie.is_none());
        }

        // budget spent: the next one is accepted
        eng.dispatch(resp()).await;
        assert!(matches!(
            eng.ctx.state,
            CcmState::NewNodeWaitForMemList { .. }
        ));
        assert_eq!(eng.cookie_str(), CK);
        assert_eq!(eng.ctx.major, 4);
    }

    #[tokio::test]
    async fn test_leader_incremental_join_round() {
        let roster = ["nodea", "nodeb", "nodec", "noded"];
        let (mut eng, rec, others) = engine("nodea", &roster).await;
        put_in_joined(&mut eng, &[0, 1, 2], 0, 7); // we lead {a,b,c}

        // noded announces itself
        let alive = CcmMessage::new(
            "noded",
            CcmPayload::Alive {
                cookie: CK.into(),
                major: 7,
                minor: 0,
            },
        );
        eng.dispatch(alive).await;
        assert!(matches!(eng.ctx.state, CcmState::WaitForChange { .. }));

        // the other members confirm the same observation
        for member in ["nodeb", "nodec"] {
            let confirm = CcmMessage::new(
                member,
                CcmPayload::NewNode {
                    cookie: CK.into(),
                    major: 7,
                    minor: 0,
                    uptime: 1,
                    node: "noded".into(),
                },
            );
            eng.dispatch(confirm).await;
        }

        assert!(matches!(eng.ctx.state, CcmState::Joined));
        assert_eq!(eng.ctx.major, 8); // exactly one increment
        assert_eq!(eng.ctx.membership, vec![0, 1, 2, 3]);
        assert_ne!(eng.cookie_str(), CK); // cookie rotated

        let reports = rec.memberships.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].major, 8);
        let d = reports[0].members.iter().find(|m| m.id == "noded").unwrap();
        assert_eq!(d.born_on, 8);

        // the members got the broadcast list including noded
        let (_, td) = others.iter().find(|(n, _)| n == "noded").unwrap();
        let m = drain_message(td).await.expect("mem-list broadcast");
        match &m.payload {
            CcmPayload::MemList { memlist, uptimes, .. } => {
                let bm = NodeBitmap::from_wire(memlist).unwrap();
                assert!(bm.test(3));
                assert_eq!(uptimes.len(), 4);
            }
            other => panic!("expected mem-list, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_mismatched_change_aborts_to_joining() {
        let (mut eng, rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        put_in_joined(&mut eng, &[0, 1, 2], 0, 7);
        eng.ctx.change = Some(PendingChange::new("nodeb", ChangeKind::NodeLeave, 2));
        eng.ctx.state = CcmState::WaitForChange {
            since: Instant::now(),
        };

        // a confirmation for a different node than the pending change
        let confirm = CcmMessage::new(
            "nodec",
            CcmPayload::NodeLeave {
                cookie: CK.into(),
                major: 7,
                minor: 0,
                uptime: 1,
                node: "nodec".into(),
            },
        );
        eng.dispatch(confirm).await;

        assert!(matches!(eng.ctx.state, CcmState::Joining));
        assert_eq!(eng.ctx.minor, 1);
        assert!(eng.ctx.change.is_none());
        assert_eq!(*rec.joins.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_change_timeout_restarts_consensus() {
        let (mut eng, _rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        put_in_joined(&mut eng, &[0, 1, 2], 0, 7);
        eng.ctx.change = Some(PendingChange::new("nodeb", ChangeKind::NodeLeave, 2));
        eng.ctx.state = CcmState::WaitForChange {
            since: Instant::now(),
        };

        // outlive the change-collection window (9 keepalives of 10ms)
        tokio::time::sleep(Duration::from_millis(150)).await;

        let tick = CcmMessage::new(
            "nodea",
            CcmPayload::Timeout {
                cookie: CK.into(),
                major: 7,
                minor: 0,
            },
        );
        eng.dispatch(tick).await;

        assert!(matches!(eng.ctx.state, CcmState::Joining));
        assert_eq!(eng.ctx.minor, 1);
    }

    #[tokio::test]
    async fn test_new_node_excluded_from_mem_list_restarts() {
        let (mut eng, _rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        eng.ctx.cookie = Some(Cookie::new(CK));
        eng.set_major(7);
        eng.ctx.state = CcmState::NewNodeWaitForMemList {
            since: Instant::now(),
        };

        let mut bm = NodeBitmap::new();
        bm.mark(1);
        bm.mark(2);
        let msg = CcmMessage::new(
            "nodeb",
            CcmPayload::MemList {
                cookie: CK.into(),
                major: 7,
                minor: 0,
                memlist: bm.to_wire(),
                uptimes: vec![1, 2],
                new_cookie: None,
            },
        );
        eng.dispatch(msg).await;

        assert!(matches!(eng.ctx.state, CcmState::None));
        assert!(eng.ctx.membership.is_empty());
    }

    #[tokio::test]
    async fn test_new_node_adopts_mem_list() {
        let (mut eng, rec, _others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        eng.ctx.cookie = Some(Cookie::new(CK));
        eng.set_major(7);
        eng.ctx.state = CcmState::NewNodeWaitForMemList {
            since: Instant::now(),
        };

        let mut bm = NodeBitmap::new();
        bm.mark(0);
        bm.mark(1);
        bm.mark(2);
        let msg = CcmMessage::new(
            "nodeb",
            CcmPayload::MemList {
                cookie: CK.into(),
                major: 7,
                minor: 0,
                memlist: bm.to_wire(),
                uptimes: vec![8, 1, 2],
                new_cookie: Some("rotated-cook-0".into()),
            },
        );
        eng.dispatch(msg).await;

        assert!(matches!(eng.ctx.state, CcmState::Joined));
        assert_eq!(eng.ctx.major, 8);
        assert_eq!(eng.ctx.joined_transition, 8);
        assert_eq!(eng.ctx.leader, Some(1));
        assert_eq!(eng.ctx.membership, vec![0, 1, 2]);
        assert_eq!(eng.cookie_str(), "rotated-cook-0");
        assert_eq!(rec.memberships.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_round_as_leader() {
        let (mut eng, rec, others) = engine("nodea", &["nodea", "nodeb", "nodec"]).await;
        eng.ctx.cookie = Some(Cookie::new(CK));
        eng.set_major(2);
        eng.ctx.joined_transition = 1; // most senior: we will lead
        eng.ctx.state = CcmState::Joining;
        eng.ctx.update.reset();

        // every node's JOIN arrives (ours comes back too)
        for (node, uptime) in [("nodea", 1), ("nodeb", 2), ("nodec", 2)] {
            let join = CcmMessage::new(
                node,
                CcmPayload::Join {
                    cookie: CK.into(),
                    major: 2,
                    minor: 0,
                    uptime,
                },
            );
            eng.dispatch(join).await;
        }
        assert!(matches!(eng.ctx.state, CcmState::SentMemlistReq));

        // connectivity reports: everyone sees everyone
        let mut bm = NodeBitmap::new();
        bm.mark(0);
        bm.mark(1);
        bm.mark(2);
        for node in ["nodeb", "nodec"] {
            let res = CcmMessage::new(
                node,
                CcmPayload::ResMemlist {
                    cookie: CK.into(),
                    major: 2,
                    minor: 0,
                    max_trans: 2,
                    memlist: bm.to_wire(),
                },
            );
            eng.dispatch(res).await;
        }

        assert!(matches!(eng.ctx.state, CcmState::Joined));
        assert_eq!(eng.ctx.major, 3);
        assert_eq!(eng.ctx.membership, vec![0, 1, 2]);
        assert_eq!(eng.ctx.leader, Some(0));
        assert!(eng.ctx.graph.is_none());
        assert_eq!(rec.memberships.lock().unwrap().len(), 1);

        // the followers saw the request and the final list
        let (_, tb) = others.iter().find(|(n, _)| n == "nodeb").unwrap();
        let mut saw_req = false;
        let mut saw_final = false;
        while let Some(m) = drain_message(tb).await {
            match m.payload {
                CcmPayload::ReqMemlist { .. } => saw_req = true,
                CcmPayload::FinalMemlist { max_trans, .. } => {
                    saw_final = true;
                    assert_eq!(max_trans, 3);
                }
                _ => {}
            }
        }
        assert!(saw_req && saw_final);
    }
}
