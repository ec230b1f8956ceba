//! The consensus state machine: role transitions, message dispatch, log
//! replication, elections, snapshot installation, and leadership transfer.
//!
//! A [`RaftNode`] is a pure state machine. It consumes ticks and messages,
//! mutates its log and per-peer progress, and pushes outgoing messages into
//! an outbound buffer that the driver drains through the `Ready` bundle. It
//! performs no I/O and holds no locks; the embedding process must not step
//! it concurrently.

use std::collections::BTreeMap;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use skiff_core::{LogIndex, NodeId, TermId, NO_LIMIT};
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::entry::{ConfChange, ConfChangeKind, Entry, EntryKind};
use crate::log::RaftLog;
use crate::message::{
    AppendRequest, AppendResponse, HeartbeatRequest, HeartbeatResponse, InstallSnapshotRequest,
    Message, ProposeRequest, ReadIndexRequest, ReadIndexResponse, SnapshotStatusReport,
    TimeoutNowRequest, TransferLeaderRequest, UnreachableReport, VoteRequest, VoteResponse,
};
use crate::progress::{Progress, ProgressMode};
use crate::ready::{ReadState, Ready, SoftState};
use crate::snapshot::{ConfState, Snapshot};
use crate::storage::{HardState, Storage, StorageError};

/// The role a node currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    /// Passive: answers RPCs, forwards proposals.
    Follower,
    /// Actively collecting votes.
    Candidate,
    /// Replicating the log and driving commits.
    Leader,
}

impl Default for RaftRole {
    fn default() -> Self {
        Self::Follower
    }
}

/// A Raft consensus node.
///
/// All mutation flows through [`RaftNode::step`] and [`RaftNode::tick`]; the
/// driver observes the results through [`RaftNode::ready`] and acknowledges
/// them with [`RaftNode::advance`].
#[derive(Debug)]
pub struct RaftNode<S: Storage> {
    id: NodeId,
    term: TermId,
    vote: Option<NodeId>,

    log: RaftLog<S>,

    max_inflight: usize,
    max_msg_size: u64,
    prs: BTreeMap<NodeId, Progress>,

    role: RaftRole,
    leader: Option<NodeId>,
    votes: BTreeMap<NodeId, bool>,
    msgs: Vec<Message>,

    /// Target of an in-flight leadership transfer.
    lead_transferee: Option<NodeId>,
    /// True while an uncommitted membership change sits in the log. At most
    /// one may be pending at a time.
    pending_conf: bool,

    /// An answered read-index request awaiting pickup through `ready`.
    read_state: Option<ReadState>,

    election_elapsed: u32,
    heartbeat_elapsed: u32,
    check_quorum: bool,
    heartbeat_timeout: u32,
    election_timeout: u32,
    /// Drawn from `[election_timeout, 2 * election_timeout - 1]` on every
    /// role reset.
    randomized_election_timeout: u32,

    rng: ChaCha8Rng,

    prev_soft_state: SoftState,
    prev_hard_state: HardState,
}

impl<S: Storage> RaftNode<S> {
    /// Creates a node from a configuration and the state recorded in
    /// `storage`, starting as a follower at the restored term.
    ///
    /// # Errors
    /// Refuses construction on an invalid configuration.
    ///
    /// # Panics
    /// Panics if `config.peers` is set while storage already records a
    /// membership, or if the restored hard state is internally inconsistent.
    pub fn new(config: Config, storage: S) -> Result<Self, ConfigError> {
        config.validate()?;
        let (hard_state, conf_state) = storage.initial_state();
        let log = RaftLog::new(storage);

        let peers = if conf_state.is_empty() {
            config.peers.clone()
        } else {
            assert!(
                config.peers.is_empty(),
                "cannot specify both Config.peers and a membership recorded in storage"
            );
            conf_state.nodes
        };

        let mut node = Self {
            id: config.id,
            term: TermId::new(0),
            vote: None,
            log,
            max_inflight: config.max_inflight_msgs,
            max_msg_size: config.max_size_per_msg,
            prs: BTreeMap::new(),
            role: RaftRole::Follower,
            leader: None,
            votes: BTreeMap::new(),
            msgs: Vec::new(),
            lead_transferee: None,
            pending_conf: false,
            read_state: None,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            check_quorum: config.check_quorum,
            heartbeat_timeout: config.heartbeat_tick,
            election_timeout: config.election_tick,
            randomized_election_timeout: 0,
            rng: ChaCha8Rng::seed_from_u64(config.id.get()),
            prev_soft_state: SoftState {
                leader: None,
                role: RaftRole::Follower,
            },
            prev_hard_state: HardState::default(),
        };

        for peer in peers {
            node.prs
                .insert(peer, Progress::new(LogIndex::new(1), node.max_inflight));
        }
        if !hard_state.is_empty() {
            node.load_state(&hard_state);
        }
        if config.applied.get() > 0 {
            node.log.applied_to(config.applied);
        }

        let term = node.term;
        node.become_follower(term, None);
        node.prev_soft_state = node.soft_state();
        node.prev_hard_state = node.hard_state();

        info!(
            id = %node.id,
            term = node.term.get(),
            commit = node.log.committed.get(),
            applied = node.log.applied.get(),
            last_index = node.log.last_index().get(),
            peers = ?node.nodes(),
            "started raft node"
        );
        Ok(node)
    }

    /// This node's id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The current term.
    #[must_use]
    pub const fn term(&self) -> TermId {
        self.term
    }

    /// Who holds this node's vote in the current term.
    #[must_use]
    pub const fn vote(&self) -> Option<NodeId> {
        self.vote
    }

    /// The current role.
    #[must_use]
    pub const fn role(&self) -> RaftRole {
        self.role
    }

    /// The known leader, if any.
    #[must_use]
    pub const fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// The replicated log.
    #[must_use]
    pub const fn log(&self) -> &RaftLog<S> {
        &self.log
    }

    /// Replication progress for `id`, while this node leads.
    #[must_use]
    pub fn progress(&self, id: NodeId) -> Option<&Progress> {
        self.prs.get(&id)
    }

    /// The target of an in-flight leadership transfer.
    #[must_use]
    pub const fn lead_transferee(&self) -> Option<NodeId> {
        self.lead_transferee
    }

    /// True while an uncommitted membership change is in the log.
    #[must_use]
    pub const fn pending_conf(&self) -> bool {
        self.pending_conf
    }

    /// Current cluster members, ascending.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeId> {
        self.prs.keys().copied().collect()
    }

    /// True if this node is in the current configuration and may campaign.
    #[must_use]
    pub fn promotable(&self) -> bool {
        self.prs.contains_key(&self.id)
    }

    /// The election timeout currently in force, in ticks.
    #[must_use]
    pub const fn randomized_election_timeout(&self) -> u32 {
        self.randomized_election_timeout
    }

    fn quorum(&self) -> usize {
        self.prs.len() / 2 + 1
    }

    /// Volatile role/leader information.
    #[must_use]
    pub const fn soft_state(&self) -> SoftState {
        SoftState {
            leader: self.leader,
            role: self.role,
        }
    }

    /// The state that must be persisted before sending messages.
    #[must_use]
    pub const fn hard_state(&self) -> HardState {
        HardState::new(self.term, self.vote, self.log.committed)
    }

    // ------------------------------------------------------------------
    // Ready / advance
    // ------------------------------------------------------------------

    /// Returns true if a [`Ready`] bundle would carry work for the driver.
    #[must_use]
    pub fn has_ready(&self) -> bool {
        self.soft_state() != self.prev_soft_state
            || self.hard_state() != self.prev_hard_state
            || self.log.unstable_snapshot().is_some()
            || !self.log.unstable_entries().is_empty()
            || self.log.has_next_entries()
            || !self.msgs.is_empty()
            || self.read_state.is_some()
    }

    /// Drains the current batch of driver work.
    ///
    /// The node must not be stepped again until the returned bundle has been
    /// acknowledged with [`RaftNode::advance`].
    pub fn ready(&mut self) -> Ready {
        let mut rd = Ready::default();

        let soft = self.soft_state();
        if soft != self.prev_soft_state {
            rd.soft_state = Some(soft);
            self.prev_soft_state = soft;
        }
        let hard = self.hard_state();
        if hard != self.prev_hard_state {
            rd.hard_state = Some(hard);
        }
        rd.entries = self.log.unstable_entries().to_vec();
        rd.committed_entries = self.log.next_entries();
        rd.snapshot = self.log.unstable_snapshot().cloned();
        rd.messages = std::mem::take(&mut self.msgs);
        rd.read_state = self.read_state.take();
        rd
    }

    /// Acknowledges a [`Ready`] bundle: marks its entries and snapshot
    /// stable and its committed entries applied.
    pub fn advance(&mut self, rd: &Ready) {
        if let Some(hard) = rd.hard_state {
            self.prev_hard_state = hard;
        }
        if let Some(entry) = rd.entries.last() {
            self.log.stable_to(entry.index, entry.term);
        }
        if let Some(snapshot) = &rd.snapshot {
            self.log.stable_snap_to(snapshot.meta.index);
            self.log.applied_to(snapshot.meta.index);
        }
        if let Some(entry) = rd.committed_entries.last() {
            self.log.applied_to(entry.index);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) {
        match self.role {
            RaftRole::Leader => self.tick_heartbeat(),
            RaftRole::Follower | RaftRole::Candidate => self.tick_election(),
        }
    }

    fn tick_election(&mut self) {
        self.election_elapsed += 1;

        if self.promotable() && self.past_election_timeout() {
            self.election_elapsed = 0;
            self.step(Message::Hup);
        }
    }

    fn tick_heartbeat(&mut self) {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_elapsed >= self.election_timeout {
            self.election_elapsed = 0;
            if self.check_quorum {
                self.step(Message::CheckQuorum);
            }
            // A transfer that cannot finish within one election timeout is
            // abandoned and the leader resumes normal duty.
            if self.role == RaftRole::Leader && self.lead_transferee.is_some() {
                self.abort_leader_transfer();
            }
        }

        if self.role != RaftRole::Leader {
            return;
        }

        if self.heartbeat_elapsed >= self.heartbeat_timeout {
            self.heartbeat_elapsed = 0;
            self.step(Message::Beat);
        }
    }

    fn past_election_timeout(&self) -> bool {
        self.election_elapsed >= self.randomized_election_timeout
    }

    fn reset_randomized_election_timeout(&mut self) {
        self.randomized_election_timeout =
            self.election_timeout + self.rng.gen_range(0..self.election_timeout);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// The single entry point for all non-tick events.
    ///
    /// Normalizes terms (stepping down on a higher term, answering or
    /// dropping a lower one), then routes to the current role's handler.
    pub fn step(&mut self, msg: Message) {
        if matches!(msg, Message::Hup) {
            if self.role == RaftRole::Leader {
                debug!(id = %self.id, "ignoring election request while already leader");
            } else {
                info!(id = %self.id, term = self.term.get(), "starting a new election");
                self.campaign();
            }
            return;
        }
        if matches!(msg, Message::TransferLeader(_)) && self.role != RaftRole::Leader {
            debug!(
                id = %self.id,
                role = ?self.role,
                "ignoring leadership transfer request while not leader"
            );
        }

        match msg.term() {
            None => {
                // Local message: no term to normalize.
            }
            Some(msg_term) if msg_term > self.term => {
                let mut lead = msg.from();
                if let Message::Vote(req) = &msg {
                    if self.check_quorum
                        && self.role != RaftRole::Candidate
                        && self.election_elapsed < self.election_timeout
                    {
                        // Within the leader lease a disruptive vote is
                        // refused without even updating our term.
                        info!(
                            id = %self.id,
                            from = %req.from,
                            msg_term = msg_term.get(),
                            remaining_ticks = self.election_timeout - self.election_elapsed,
                            "ignored higher-term vote request: lease has not expired"
                        );
                        return;
                    }
                    lead = None;
                }
                info!(
                    id = %self.id,
                    term = self.term.get(),
                    msg_term = msg_term.get(),
                    "received a message with higher term"
                );
                self.become_follower(msg_term, lead);
            }
            Some(msg_term) if msg_term < self.term => {
                match &msg {
                    Message::Append(req) if self.check_quorum => {
                        // With check_quorum we never advanced our term for
                        // the stale leader's votes, so nudge it down with a
                        // response at our term instead.
                        let resp =
                            AppendResponse::accept(self.term, self.id, req.from, LogIndex::new(0));
                        self.send(Message::AppendResponse(resp));
                    }
                    Message::Heartbeat(req) if self.check_quorum => {
                        let resp =
                            AppendResponse::accept(self.term, self.id, req.from, LogIndex::new(0));
                        self.send(Message::AppendResponse(resp));
                    }
                    _ => {
                        debug!(
                            id = %self.id,
                            term = self.term.get(),
                            msg_term = msg_term.get(),
                            "ignored a message with lower term"
                        );
                    }
                }
                return;
            }
            Some(_) => {
                // Same term: handled by the role below.
            }
        }

        match self.role {
            RaftRole::Leader => self.step_leader(msg),
            RaftRole::Candidate => self.step_candidate(msg),
            RaftRole::Follower => self.step_follower(msg),
        }
    }

    // ------------------------------------------------------------------
    // Role handlers
    // ------------------------------------------------------------------

    fn step_leader(&mut self, msg: Message) {
        match msg {
            Message::Beat => self.bcast_heartbeat(),
            Message::CheckQuorum => {
                if !self.check_quorum_active() {
                    warn!(id = %self.id, "stepping down to follower: quorum is not active");
                    let term = self.term;
                    self.become_follower(term, None);
                }
            }
            Message::Propose(req) => self.handle_propose(req),
            Message::Vote(req) => {
                // A leader never grants a vote at its own term.
                info!(
                    id = %self.id,
                    from = %req.from,
                    term = self.term.get(),
                    "rejected vote request while leading"
                );
                let resp = VoteResponse::new(self.term, self.id, req.from, true);
                self.send(Message::VoteResponse(resp));
            }
            Message::ReadIndex(req) => self.handle_read_index(req),
            Message::AppendResponse(resp) => self.handle_append_response(resp),
            Message::HeartbeatResponse(resp) => self.handle_heartbeat_response(resp),
            Message::SnapshotStatus(report) => self.handle_snapshot_status(report),
            Message::Unreachable(report) => self.handle_unreachable(report),
            Message::TransferLeader(req) => self.handle_transfer_leader(req),
            _ => {}
        }
    }

    fn step_candidate(&mut self, msg: Message) {
        match msg {
            Message::Propose(_) => {
                info!(id = %self.id, term = self.term.get(), "no leader; dropping proposal");
            }
            Message::Append(req) => {
                // An equal-term append means a leader won this election.
                let term = self.term;
                self.become_follower(term, Some(req.from));
                self.handle_append_entries(&req);
            }
            Message::Heartbeat(req) => {
                let term = self.term;
                self.become_follower(term, Some(req.from));
                self.handle_heartbeat(&req);
            }
            Message::InstallSnapshot(req) => {
                let term = self.term;
                self.become_follower(term, Some(req.from));
                self.handle_snapshot(req);
            }
            Message::Vote(req) => {
                // Already voted for self this term.
                info!(
                    id = %self.id,
                    from = %req.from,
                    term = self.term.get(),
                    "rejected vote request while campaigning"
                );
                let resp = VoteResponse::new(self.term, self.id, req.from, true);
                self.send(Message::VoteResponse(resp));
            }
            Message::VoteResponse(resp) => {
                let granted = self.poll(resp.from, !resp.reject);
                let rejected = self.votes.len() - granted;
                info!(
                    id = %self.id,
                    granted,
                    rejected,
                    quorum = self.quorum(),
                    "vote tally"
                );
                if granted == self.quorum() {
                    self.become_leader();
                    self.bcast_append();
                } else if rejected == self.quorum() {
                    let term = self.term;
                    self.become_follower(term, None);
                }
            }
            Message::TimeoutNow(req) => {
                debug!(
                    id = %self.id,
                    from = %req.from,
                    "ignored timeout-now while already campaigning"
                );
            }
            _ => {}
        }
    }

    fn step_follower(&mut self, msg: Message) {
        match msg {
            Message::Propose(mut req) => {
                let Some(leader) = self.leader else {
                    info!(id = %self.id, term = self.term.get(), "no leader; dropping proposal");
                    return;
                };
                req.to = Some(leader);
                self.send(Message::Propose(req));
            }
            Message::Append(req) => {
                self.election_elapsed = 0;
                self.leader = Some(req.from);
                self.handle_append_entries(&req);
            }
            Message::Heartbeat(req) => {
                self.election_elapsed = 0;
                self.leader = Some(req.from);
                self.handle_heartbeat(&req);
            }
            Message::InstallSnapshot(req) => {
                self.election_elapsed = 0;
                self.handle_snapshot(req);
            }
            Message::Vote(req) => {
                if (self.vote.is_none() || self.vote == Some(req.from))
                    && self.log.is_up_to_date(req.last_index, req.last_term)
                {
                    self.election_elapsed = 0;
                    info!(
                        id = %self.id,
                        candidate = %req.from,
                        term = self.term.get(),
                        "granted vote"
                    );
                    self.vote = Some(req.from);
                    let resp = VoteResponse::new(self.term, self.id, req.from, false);
                    self.send(Message::VoteResponse(resp));
                } else {
                    info!(
                        id = %self.id,
                        candidate = %req.from,
                        vote = ?self.vote,
                        term = self.term.get(),
                        "rejected vote request"
                    );
                    let resp = VoteResponse::new(self.term, self.id, req.from, true);
                    self.send(Message::VoteResponse(resp));
                }
            }
            Message::TimeoutNow(req) => {
                info!(
                    id = %self.id,
                    from = %req.from,
                    term = self.term.get(),
                    "received timeout-now; campaigning for leadership"
                );
                self.campaign();
            }
            Message::ReadIndex(mut req) => {
                let Some(leader) = self.leader else {
                    info!(id = %self.id, term = self.term.get(), "no leader; dropping read request");
                    return;
                };
                req.to = Some(leader);
                self.send(Message::ReadIndex(req));
            }
            Message::ReadIndexResponse(resp) => {
                self.read_state = Some(ReadState {
                    index: resp.index,
                    request_ctx: resp.ctx,
                });
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Leader internals
    // ------------------------------------------------------------------

    fn handle_propose(&mut self, req: ProposeRequest) {
        assert!(!req.entries.is_empty(), "stepped an empty proposal");
        if !self.prs.contains_key(&self.id) {
            // Removed from the configuration while leading: drop proposals
            // rather than replicate from outside the membership.
            return;
        }
        if self.lead_transferee.is_some() {
            debug!(
                id = %self.id,
                transferee = ?self.lead_transferee,
                "dropping proposal: leadership transfer in progress"
            );
            return;
        }

        let mut entries = req.entries;
        for entry in &mut entries {
            if entry.kind == EntryKind::ConfChange {
                if self.pending_conf {
                    // Only one membership change may be in flight; demote
                    // the extra one to an empty entry.
                    debug!(id = %self.id, "dropping additional config change entry");
                    *entry = Entry::default();
                } else {
                    self.pending_conf = true;
                }
            }
        }
        self.append_entry(entries);
        self.bcast_append();
    }

    fn handle_read_index(&mut self, req: ReadIndexRequest) {
        // Without check_quorum a leader cannot be sure it still is one, so
        // it answers with no index and the requester surfaces `None`.
        let index = if self.check_quorum {
            Some(self.log.committed)
        } else {
            None
        };
        if req.from == self.id {
            self.read_state = Some(ReadState {
                index,
                request_ctx: req.ctx,
            });
        } else {
            let resp = ReadIndexResponse::new(self.term, self.id, req.from, index, req.ctx);
            self.send(Message::ReadIndexResponse(resp));
        }
    }

    fn handle_append_response(&mut self, resp: AppendResponse) {
        let Some(pr) = self.prs.get_mut(&resp.from) else {
            debug!(id = %self.id, from = %resp.from, "no progress available for peer");
            return;
        };
        pr.recent_active = true;

        if resp.reject {
            debug!(
                id = %self.id,
                from = %resp.from,
                index = resp.index.get(),
                hint = resp.reject_hint.get(),
                "append rejected by peer"
            );
            if pr.maybe_decr_to(resp.index, resp.reject_hint) {
                if pr.mode == ProgressMode::Replicate {
                    pr.become_probe();
                }
                debug!(id = %self.id, from = %resp.from, progress = %pr, "decreased progress of peer");
                self.send_append(resp.from);
            }
            return;
        }

        let old_paused = pr.is_paused();
        if !pr.maybe_update(resp.index) {
            return;
        }
        match pr.mode {
            ProgressMode::Probe => pr.become_replicate(),
            ProgressMode::Snapshot if pr.need_snapshot_abort() => {
                debug!(
                    id = %self.id,
                    from = %resp.from,
                    "snapshot aborted: peer caught up; resuming replication"
                );
                pr.become_probe();
            }
            ProgressMode::Replicate => pr.inflights.free_to(resp.index),
            ProgressMode::Snapshot => {}
        }
        let matched = pr.matched;

        if self.maybe_commit() {
            self.bcast_append();
        } else if old_paused {
            // The ack unpaused this peer; send the append we held back.
            self.send_append(resp.from);
        }
        if self.lead_transferee == Some(resp.from) && matched == self.log.last_index() {
            info!(
                id = %self.id,
                to = %resp.from,
                "transferee log is up to date; telling it to campaign now"
            );
            self.send_timeout_now(resp.from);
        }
    }

    fn handle_heartbeat_response(&mut self, resp: HeartbeatResponse) {
        let Some(pr) = self.prs.get_mut(&resp.from) else {
            debug!(id = %self.id, from = %resp.from, "no progress available for peer");
            return;
        };
        pr.recent_active = true;

        // A heartbeat ack frees one slot of a clogged window so replication
        // can make progress even when append acks are lost.
        if pr.mode == ProgressMode::Replicate && pr.inflights.full() {
            pr.inflights.free_first();
        }
        let matched = pr.matched;
        if matched < self.log.last_index() {
            self.send_append(resp.from);
        }
    }

    fn handle_snapshot_status(&mut self, report: SnapshotStatusReport) {
        let Some(pr) = self.prs.get_mut(&report.from) else {
            debug!(id = %self.id, from = %report.from, "no progress available for peer");
            return;
        };
        if pr.mode != ProgressMode::Snapshot {
            return;
        }
        if report.reject {
            pr.snapshot_failure();
            pr.become_probe();
            debug!(id = %self.id, from = %report.from, "snapshot send failed; probing again");
        } else {
            pr.become_probe();
            debug!(
                id = %self.id,
                from = %report.from,
                "snapshot send succeeded; waiting for append response"
            );
        }
        // On success, wait for the peer's append response before sending
        // more; on failure, wait out a heartbeat interval before retrying.
        pr.pause();
    }

    fn handle_unreachable(&mut self, report: UnreachableReport) {
        let Some(pr) = self.prs.get_mut(&report.from) else {
            debug!(id = %self.id, from = %report.from, "no progress available for peer");
            return;
        };
        // An optimistic append has likely been lost; fall back to probing.
        if pr.mode == ProgressMode::Replicate {
            pr.become_probe();
        }
        debug!(id = %self.id, from = %report.from, progress = %pr, "peer reported unreachable");
    }

    fn handle_transfer_leader(&mut self, req: TransferLeaderRequest) {
        let target = req.from;
        if !self.prs.contains_key(&target) {
            debug!(id = %self.id, target = %target, "no progress available for transfer target");
            return;
        }
        if let Some(last) = self.lead_transferee {
            if last == target {
                info!(
                    id = %self.id,
                    target = %target,
                    "leadership transfer already in progress to this target"
                );
                return;
            }
            self.abort_leader_transfer();
            info!(id = %self.id, aborted = %last, "aborted previous leadership transfer");
        }
        if target == self.id {
            debug!(id = %self.id, "already leader; ignoring transfer to self");
            return;
        }

        info!(id = %self.id, target = %target, term = self.term.get(), "starting leadership transfer");
        // The transfer must finish within one election timeout.
        self.election_elapsed = 0;
        self.lead_transferee = Some(target);

        let matched = self.prs.get(&target).map(|pr| pr.matched);
        if matched == Some(self.log.last_index()) {
            self.send_timeout_now(target);
            info!(
                id = %self.id,
                target = %target,
                "transferee already has an up-to-date log; sent timeout-now immediately"
            );
        } else {
            self.send_append(target);
        }
    }

    /// Emits an append (or snapshot, if the needed entries were compacted)
    /// to one peer.
    fn send_append(&mut self, to: NodeId) {
        let Some(pr) = self.prs.get(&to) else {
            return;
        };
        if pr.is_paused() {
            return;
        }
        let next = pr.next;
        let recent_active = pr.recent_active;

        let prev_index = LogIndex::new(next.get() - 1);
        let term_result = self.log.term(prev_index);
        let entries_result = self.log.entries(next, self.max_msg_size);

        let (prev_term, entries) = match (term_result, entries_result) {
            (Ok(prev_term), Ok(entries)) => (prev_term, entries),
            _ => {
                // The entries this peer needs were compacted: fall back to a
                // snapshot transfer.
                self.send_snapshot(to, recent_active);
                return;
            }
        };

        if !entries.is_empty() {
            let last = entries[entries.len() - 1].index;
            if let Some(pr) = self.prs.get_mut(&to) {
                match pr.mode {
                    ProgressMode::Replicate => {
                        pr.optimistic_update(last);
                        pr.inflights.add(last);
                    }
                    ProgressMode::Probe => pr.pause(),
                    ProgressMode::Snapshot => {
                        panic!("node {} is sending append to {} in snapshot state", self.id, to)
                    }
                }
            }
        }
        let msg = AppendRequest::new(
            self.term,
            self.id,
            to,
            prev_index,
            prev_term,
            entries,
            self.log.committed,
        );
        self.send(Message::Append(msg));
    }

    fn send_snapshot(&mut self, to: NodeId, recent_active: bool) {
        if !recent_active {
            debug!(
                id = %self.id,
                to = %to,
                "not sending snapshot: peer is not recently active"
            );
            return;
        }
        let snapshot = match self.log.snapshot() {
            Ok(snapshot) => snapshot,
            Err(StorageError::SnapshotTemporarilyUnavailable) => {
                debug!(
                    id = %self.id,
                    to = %to,
                    "not sending snapshot: temporarily unavailable"
                );
                return;
            }
            Err(e) => panic!("unexpected error loading snapshot: {e}"),
        };
        assert!(!snapshot.is_empty(), "need a non-empty snapshot to send");

        let index = snapshot.meta.index;
        debug!(
            id = %self.id,
            to = %to,
            snapshot_index = index.get(),
            snapshot_term = snapshot.meta.term.get(),
            first_index = self.log.first_index().get(),
            commit = self.log.committed.get(),
            "sending snapshot to lagging peer"
        );
        let msg = InstallSnapshotRequest::new(self.term, self.id, to, snapshot);
        self.send(Message::InstallSnapshot(msg));

        if let Some(pr) = self.prs.get_mut(&to) {
            pr.become_snapshot(index);
            debug!(id = %self.id, to = %to, progress = %pr, "paused replication during snapshot");
        }
    }

    fn send_heartbeat(&mut self, to: NodeId) {
        let Some(pr) = self.prs.get(&to) else {
            return;
        };
        // Never push a follower's commit past what it has acknowledged.
        let commit = LogIndex::new(u64::min(pr.matched.get(), self.log.committed.get()));
        let msg = HeartbeatRequest::new(self.term, self.id, to, commit);
        self.send(Message::Heartbeat(msg));
    }

    fn bcast_append(&mut self) {
        let peers: Vec<NodeId> = self
            .prs
            .keys()
            .copied()
            .filter(|id| *id != self.id)
            .collect();
        for peer in peers {
            self.send_append(peer);
        }
    }

    fn bcast_heartbeat(&mut self) {
        let peers: Vec<NodeId> = self
            .prs
            .keys()
            .copied()
            .filter(|id| *id != self.id)
            .collect();
        for peer in peers {
            self.send_heartbeat(peer);
            if let Some(pr) = self.prs.get_mut(&peer) {
                pr.resume();
            }
        }
    }

    /// Advances the commit index from the quorum's matched indices.
    ///
    /// Only entries of the current term commit by replica count; this is
    /// what rules out the Raft figure-8 anomaly.
    fn maybe_commit(&mut self) -> bool {
        let mut matched: Vec<u64> = self.prs.values().map(|pr| pr.matched.get()).collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = matched[self.quorum() - 1];
        self.log
            .maybe_commit(LogIndex::new(quorum_index), self.term)
    }

    fn append_entry(&mut self, mut entries: Vec<Entry>) {
        let last = self.log.last_index().get();
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.term = self.term;
            entry.index = LogIndex::new(last + 1 + i as u64);
        }
        self.log.append(&entries);

        let last_index = self.log.last_index();
        if let Some(pr) = self.prs.get_mut(&self.id) {
            pr.maybe_update(last_index);
        }
        // Regardless of the outcome our caller broadcasts the append.
        self.maybe_commit();
    }

    /// Counts peers seen since the last quorum check, clearing the flags.
    /// Self always counts.
    fn check_quorum_active(&mut self) -> bool {
        let mut active = 0;
        let self_id = self.id;
        for (id, pr) in &mut self.prs {
            if *id == self_id {
                active += 1;
                continue;
            }
            if pr.recent_active {
                active += 1;
            }
            pr.recent_active = false;
        }
        active >= self.quorum()
    }

    fn send_timeout_now(&mut self, to: NodeId) {
        let msg = TimeoutNowRequest::new(self.term, self.id, to);
        self.send(Message::TimeoutNow(msg));
    }

    fn abort_leader_transfer(&mut self) {
        self.lead_transferee = None;
    }

    // ------------------------------------------------------------------
    // Follower internals
    // ------------------------------------------------------------------

    fn handle_append_entries(&mut self, req: &AppendRequest) {
        if req.prev_index < self.log.committed {
            // A stale or duplicate append: everything it carries is already
            // committed here, so just report where we are.
            let resp = AppendResponse::accept(self.term, self.id, req.from, self.log.committed);
            self.send(Message::AppendResponse(resp));
            return;
        }

        match self
            .log
            .maybe_append(req.prev_index, req.prev_term, req.commit, &req.entries)
        {
            Some(last_index) => {
                let resp = AppendResponse::accept(self.term, self.id, req.from, last_index);
                self.send(Message::AppendResponse(resp));
            }
            None => {
                debug!(
                    id = %self.id,
                    from = %req.from,
                    prev_index = req.prev_index.get(),
                    prev_term = req.prev_term.get(),
                    last_index = self.log.last_index().get(),
                    "rejected append: no matching entry at prev_index"
                );
                let resp = AppendResponse::reject(
                    self.term,
                    self.id,
                    req.from,
                    req.prev_index,
                    self.log.last_index(),
                );
                self.send(Message::AppendResponse(resp));
            }
        }
    }

    fn handle_heartbeat(&mut self, req: &HeartbeatRequest) {
        self.log.commit_to(req.commit);
        let resp = HeartbeatResponse::new(self.term, self.id, req.from);
        self.send(Message::HeartbeatResponse(resp));
    }

    fn handle_snapshot(&mut self, req: InstallSnapshotRequest) {
        let index = req.snapshot.meta.index;
        let term = req.snapshot.meta.term;
        let from = req.from;
        if self.restore(req.snapshot) {
            info!(
                id = %self.id,
                snapshot_index = index.get(),
                snapshot_term = term.get(),
                commit = self.log.committed.get(),
                "restored snapshot"
            );
            let resp = AppendResponse::accept(self.term, self.id, from, self.log.last_index());
            self.send(Message::AppendResponse(resp));
        } else {
            info!(
                id = %self.id,
                snapshot_index = index.get(),
                snapshot_term = term.get(),
                commit = self.log.committed.get(),
                "ignored snapshot"
            );
            let resp = AppendResponse::accept(self.term, self.id, from, self.log.committed);
            self.send(Message::AppendResponse(resp));
        }
    }

    /// Recovers log and membership from a snapshot.
    ///
    /// Returns false if the snapshot brings nothing new; when the log
    /// already holds the matching entry, commit is fast-forwarded instead
    /// of restoring.
    fn restore(&mut self, snapshot: Snapshot) -> bool {
        if snapshot.meta.index <= self.log.committed {
            return false;
        }
        if self
            .log
            .match_term(snapshot.meta.index, snapshot.meta.term)
        {
            info!(
                id = %self.id,
                snapshot_index = snapshot.meta.index.get(),
                commit = self.log.committed.get(),
                "fast-forwarded commit to snapshot index"
            );
            self.log.commit_to(snapshot.meta.index);
            return false;
        }

        let nodes = snapshot.meta.conf_state.nodes.clone();
        self.log.restore(snapshot);
        self.prs.clear();
        let next = self.log.last_index().get() + 1;
        for node in nodes {
            let matched = if node == self.id { next - 1 } else { 0 };
            self.set_progress(node, LogIndex::new(matched), LogIndex::new(next));
            debug!(id = %self.id, peer = %node, "restored progress from snapshot membership");
        }
        true
    }

    // ------------------------------------------------------------------
    // Elections and role transitions
    // ------------------------------------------------------------------

    fn campaign(&mut self) {
        self.become_candidate();
        let granted = self.poll(self.id, true);
        if granted == self.quorum() {
            // A quorum of one: leader immediately.
            self.become_leader();
            return;
        }

        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        let peers: Vec<NodeId> = self
            .prs
            .keys()
            .copied()
            .filter(|id| *id != self.id)
            .collect();
        for peer in peers {
            info!(
                id = %self.id,
                to = %peer,
                term = self.term.get(),
                last_index = last_index.get(),
                last_term = last_term.get(),
                "sent vote request"
            );
            let req = VoteRequest::new(self.term, self.id, peer, last_index, last_term);
            self.send(Message::Vote(req));
        }
    }

    /// Records one vote (first answer per node wins) and returns the
    /// current number of grants.
    fn poll(&mut self, id: NodeId, granted: bool) -> usize {
        if granted {
            info!(id = %self.id, from = %id, term = self.term.get(), "received vote");
        } else {
            info!(id = %self.id, from = %id, term = self.term.get(), "received vote rejection");
        }
        self.votes.entry(id).or_insert(granted);
        self.votes.values().filter(|v| **v).count()
    }

    fn become_follower(&mut self, term: TermId, leader: Option<NodeId>) {
        self.reset(term);
        self.leader = leader;
        self.role = RaftRole::Follower;
        info!(id = %self.id, term = self.term.get(), leader = ?self.leader, "became follower");
    }

    fn become_candidate(&mut self) {
        assert!(
            self.role != RaftRole::Leader,
            "invalid transition [leader -> candidate]"
        );
        let term = TermId::new(self.term.get() + 1);
        self.reset(term);
        self.vote = Some(self.id);
        self.role = RaftRole::Candidate;
        info!(id = %self.id, term = self.term.get(), "became candidate");
    }

    fn become_leader(&mut self) {
        assert!(
            self.role != RaftRole::Follower,
            "invalid transition [follower -> leader]"
        );
        let term = self.term;
        self.reset(term);
        self.leader = Some(self.id);
        self.role = RaftRole::Leader;

        // Re-arm the pending-conf guard from any inherited uncommitted
        // membership change.
        let uncommitted = match self
            .log
            .entries(LogIndex::new(self.log.committed.get() + 1), NO_LIMIT)
        {
            Ok(entries) => entries,
            Err(e) => panic!("unexpected error getting uncommitted entries: {e}"),
        };
        for entry in &uncommitted {
            if entry.kind != EntryKind::ConfChange {
                continue;
            }
            assert!(
                !self.pending_conf,
                "unexpected double uncommitted config entry"
            );
            self.pending_conf = true;
        }

        // An empty entry at the new term forces commit of everything the
        // leader inherited.
        self.append_entry(vec![Entry::default()]);
        info!(id = %self.id, term = self.term.get(), "became leader");
    }

    fn reset(&mut self, term: TermId) {
        if self.term != term {
            self.term = term;
            self.vote = None;
        }
        self.leader = None;

        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.reset_randomized_election_timeout();

        self.abort_leader_transfer();
        self.votes.clear();

        let last_index = self.log.last_index();
        let next = LogIndex::new(last_index.get() + 1);
        let max_inflight = self.max_inflight;
        let self_id = self.id;
        let peers: Vec<NodeId> = self.prs.keys().copied().collect();
        for peer in peers {
            let mut pr = Progress::new(next, max_inflight);
            if peer == self_id {
                pr.matched = last_index;
            }
            self.prs.insert(peer, pr);
        }
        self.pending_conf = false;
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Applies a committed membership change and returns the resulting
    /// configuration.
    pub fn apply_conf_change(&mut self, change: &ConfChange) -> ConfState {
        match change.kind {
            ConfChangeKind::AddNode => self.add_node(change.node_id),
            ConfChangeKind::RemoveNode => self.remove_node(change.node_id),
        }
        ConfState::new(self.nodes())
    }

    /// Adds `id` to the configuration. Redundant adds are no-ops (bootstrap
    /// entries can be applied twice).
    pub fn add_node(&mut self, id: NodeId) {
        if self.prs.contains_key(&id) {
            return;
        }
        let next = LogIndex::new(self.log.last_index().get() + 1);
        self.set_progress(id, LogIndex::new(0), next);
        self.pending_conf = false;
    }

    /// Removes `id` from the configuration.
    pub fn remove_node(&mut self, id: NodeId) {
        self.prs.remove(&id);
        self.pending_conf = false;

        // Nothing left to commit against or transfer to.
        if self.prs.is_empty() {
            return;
        }

        // The quorum shrank; pending entries may commit now.
        if self.maybe_commit() {
            self.bcast_append();
        }
        if self.role == RaftRole::Leader && self.lead_transferee == Some(id) {
            self.abort_leader_transfer();
        }
    }

    fn set_progress(&mut self, id: NodeId, matched: LogIndex, next: LogIndex) {
        let mut pr = Progress::new(next, self.max_inflight);
        pr.matched = matched;
        self.prs.insert(id, pr);
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn send(&mut self, msg: Message) {
        self.msgs.push(msg);
    }

    fn load_state(&mut self, state: &HardState) {
        assert!(
            state.commit >= self.log.committed && state.commit <= self.log.last_index(),
            "restored commit {} is out of range [{}, {}]",
            state.commit.get(),
            self.log.committed.get(),
            self.log.last_index().get()
        );
        self.log.committed = state.commit;
        self.term = state.term;
        self.vote = state.vote;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::storage::MemStorage;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId::new).collect()
    }

    fn make_node(id: u64, peers: &[u64]) -> RaftNode<MemStorage> {
        let config = Config::new(NodeId::new(id))
            .with_peers(ids(peers))
            .with_ticks(10, 1);
        RaftNode::new(config, MemStorage::new()).unwrap()
    }

    fn vote_from(node: &mut RaftNode<MemStorage>, from: u64, reject: bool) {
        let resp = VoteResponse::new(node.term(), NodeId::new(from), node.id(), reject);
        node.step(Message::VoteResponse(resp));
    }

    fn elect(node: &mut RaftNode<MemStorage>) {
        node.step(Message::Hup);
        vote_from(node, 2, false);
        assert_eq!(node.role(), RaftRole::Leader);
        node.msgs.clear();
    }

    #[test]
    fn test_new_node_is_follower() {
        let node = make_node(1, &[1, 2, 3]);

        assert_eq!(node.role(), RaftRole::Follower);
        assert_eq!(node.term(), TermId::new(0));
        assert!(node.leader().is_none());
        assert!(node.promotable());
    }

    #[test]
    fn test_invalid_config_refused() {
        let config = Config::new(NodeId::new(0));
        assert!(RaftNode::new(config, MemStorage::new()).is_err());
    }

    #[test]
    fn test_hup_starts_campaign() {
        let mut node = make_node(1, &[1, 2, 3]);

        node.step(Message::Hup);

        assert_eq!(node.role(), RaftRole::Candidate);
        assert_eq!(node.term(), TermId::new(1));
        assert_eq!(node.vote(), Some(NodeId::new(1)));

        let votes: Vec<_> = node
            .msgs
            .iter()
            .filter_map(|m| match m {
                Message::Vote(req) => Some(req),
                _ => None,
            })
            .collect();
        assert_eq!(votes.len(), 2);
        for req in votes {
            assert_eq!(req.last_index.get(), 0);
            assert_eq!(req.last_term.get(), 0);
        }
    }

    #[test]
    fn test_becomes_leader_with_quorum() {
        let mut node = make_node(1, &[1, 2, 3]);

        node.step(Message::Hup);
        node.msgs.clear();
        vote_from(&mut node, 2, false);

        assert_eq!(node.role(), RaftRole::Leader);
        assert_eq!(node.leader(), Some(NodeId::new(1)));
        // The no-op entry at the new term goes out to both peers.
        let appends: Vec<_> = node
            .msgs
            .iter()
            .filter_map(|m| match m {
                Message::Append(req) => Some(req),
                _ => None,
            })
            .collect();
        assert_eq!(appends.len(), 2);
        assert_eq!(appends[0].entries.len(), 1);
        assert_eq!(node.log().last_index().get(), 1);
    }

    #[test]
    fn test_candidate_steps_down_on_vote_rejections() {
        let mut node = make_node(1, &[1, 2, 3]);

        node.step(Message::Hup);
        vote_from(&mut node, 2, true);
        assert_eq!(node.role(), RaftRole::Candidate);

        vote_from(&mut node, 3, true);
        assert_eq!(node.role(), RaftRole::Follower);
        assert_eq!(node.term(), TermId::new(1));
    }

    #[test]
    fn test_duplicate_vote_responses_do_not_double_count() {
        let mut node = make_node(1, &[1, 2, 3, 4, 5]);

        node.step(Message::Hup);
        vote_from(&mut node, 2, false);
        vote_from(&mut node, 2, false);

        // Two grants (self + node 2) out of a quorum of three.
        assert_eq!(node.role(), RaftRole::Candidate);

        vote_from(&mut node, 3, false);
        assert_eq!(node.role(), RaftRole::Leader);
    }

    #[test]
    fn test_single_node_cluster_elects_and_commits_immediately() {
        let mut node = make_node(1, &[1]);

        node.step(Message::Hup);
        assert_eq!(node.role(), RaftRole::Leader);
        // The no-op commits on its own quorum of one.
        assert_eq!(node.log().committed.get(), 1);

        let entries = vec![Entry::normal(
            TermId::new(0),
            LogIndex::new(0),
            Bytes::from_static(b"cmd"),
        )];
        node.step(Message::Propose(ProposeRequest::new(node.id(), entries)));
        assert_eq!(node.log().committed.get(), 2);
    }

    #[test]
    fn test_vote_granted_to_up_to_date_candidate() {
        let mut node = make_node(1, &[1, 2, 3]);

        let req = VoteRequest::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
        );
        node.step(Message::Vote(req));

        assert_eq!(node.vote(), Some(NodeId::new(2)));
        let resp = node.msgs.iter().find_map(|m| match m {
            Message::VoteResponse(r) => Some(r),
            _ => None,
        });
        assert!(!resp.unwrap().reject);
    }

    #[test]
    fn test_vote_rejected_when_already_voted() {
        let mut node = make_node(1, &[1, 2, 3]);

        node.step(Message::Vote(VoteRequest::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
        )));
        node.msgs.clear();

        node.step(Message::Vote(VoteRequest::new(
            TermId::new(1),
            NodeId::new(3),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
        )));

        let resp = node.msgs.iter().find_map(|m| match m {
            Message::VoteResponse(r) => Some(r),
            _ => None,
        });
        assert!(resp.unwrap().reject);
        assert_eq!(node.vote(), Some(NodeId::new(2)));
    }

    #[test]
    fn test_vote_rejected_for_stale_log() {
        let mut node = make_node(1, &[1, 2, 3]);
        elect(&mut node);
        // Leader holds the term-1 no-op at index 1; step down via higher term.
        node.step(Message::Heartbeat(HeartbeatRequest::new(
            TermId::new(2),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
        )));
        node.msgs.clear();

        // A candidate with an empty log must not win our vote.
        node.step(Message::Vote(VoteRequest::new(
            TermId::new(3),
            NodeId::new(3),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
        )));

        let resp = node.msgs.iter().find_map(|m| match m {
            Message::VoteResponse(r) => Some(r),
            _ => None,
        });
        assert!(resp.unwrap().reject);
    }

    #[test]
    fn test_steps_down_on_higher_term() {
        let mut node = make_node(1, &[1, 2, 3]);
        elect(&mut node);

        node.step(Message::Heartbeat(HeartbeatRequest::new(
            TermId::new(5),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
        )));

        assert_eq!(node.role(), RaftRole::Follower);
        assert_eq!(node.term(), TermId::new(5));
        assert_eq!(node.leader(), Some(NodeId::new(2)));
    }

    #[test]
    fn test_randomized_timeout_stays_in_range() {
        let mut node = make_node(1, &[1, 2, 3]);

        for _ in 0..100 {
            node.become_follower(node.term(), None);
            let timeout = node.randomized_election_timeout();
            assert!((10..20).contains(&timeout), "timeout {timeout} out of range");
        }
    }

    #[test]
    fn test_election_fires_after_randomized_timeout() {
        let mut node = make_node(1, &[1, 2, 3]);

        let timeout = node.randomized_election_timeout();
        for _ in 0..timeout - 1 {
            node.tick();
            assert_eq!(node.role(), RaftRole::Follower);
        }
        node.tick();
        assert_eq!(node.role(), RaftRole::Candidate);
    }

    #[test]
    fn test_lease_protects_against_disruptive_vote() {
        let config = Config::new(NodeId::new(1))
            .with_peers(ids(&[1, 2, 3]))
            .with_ticks(10, 1)
            .with_check_quorum(true);
        let mut node = RaftNode::new(config, MemStorage::new()).unwrap();

        // Hear from a live leader; the lease clock starts.
        node.step(Message::Heartbeat(HeartbeatRequest::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
        )));
        node.msgs.clear();

        // A higher-term vote inside the lease window is dropped outright.
        node.step(Message::Vote(VoteRequest::new(
            TermId::new(2),
            NodeId::new(3),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
        )));

        assert_eq!(node.term(), TermId::new(1));
        assert!(node.msgs.is_empty());
    }

    #[test]
    fn test_stale_leader_is_nudged_under_check_quorum() {
        let config = Config::new(NodeId::new(1))
            .with_peers(ids(&[1, 2, 3]))
            .with_ticks(10, 1)
            .with_check_quorum(true);
        let mut node = RaftNode::new(config, MemStorage::new()).unwrap();

        node.step(Message::Heartbeat(HeartbeatRequest::new(
            TermId::new(2),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
        )));
        node.msgs.clear();

        // An append from a deposed term-1 leader gets an answer at our term
        // so that leader can step down.
        node.step(Message::Append(AppendRequest::new(
            TermId::new(1),
            NodeId::new(3),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
            Vec::new(),
            LogIndex::new(0),
        )));

        let resp = node.msgs.iter().find_map(|m| match m {
            Message::AppendResponse(r) => Some(r),
            _ => None,
        });
        let resp = resp.unwrap();
        assert_eq!(resp.term, TermId::new(2));
        assert_eq!(resp.to, NodeId::new(3));
    }

    #[test]
    fn test_proposal_dropped_without_leader() {
        let mut node = make_node(1, &[1, 2, 3]);

        let entries = vec![Entry::normal(
            TermId::new(0),
            LogIndex::new(0),
            Bytes::from_static(b"cmd"),
        )];
        node.step(Message::Propose(ProposeRequest::new(node.id(), entries)));

        assert!(node.msgs.is_empty());
        assert_eq!(node.log().last_index().get(), 0);
    }

    #[test]
    fn test_proposal_forwarded_to_leader() {
        let mut node = make_node(1, &[1, 2, 3]);

        node.step(Message::Heartbeat(HeartbeatRequest::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
        )));
        node.msgs.clear();

        let entries = vec![Entry::normal(
            TermId::new(0),
            LogIndex::new(0),
            Bytes::from_static(b"cmd"),
        )];
        node.step(Message::Propose(ProposeRequest::new(node.id(), entries)));

        let forwarded = node.msgs.iter().find_map(|m| match m {
            Message::Propose(p) => Some(p),
            _ => None,
        });
        assert_eq!(forwarded.unwrap().to, Some(NodeId::new(2)));
    }

    #[test]
    fn test_second_pending_conf_change_is_demoted() {
        let mut node = make_node(1, &[1]);
        node.step(Message::Hup);
        assert_eq!(node.role(), RaftRole::Leader);

        let conf_entry = || {
            vec![Entry::new(
                TermId::new(0),
                LogIndex::new(0),
                EntryKind::ConfChange,
                ConfChange::new(ConfChangeKind::AddNode, NodeId::new(2)).to_bytes(),
            )]
        };
        node.step(Message::Propose(ProposeRequest::new(node.id(), conf_entry())));
        assert!(node.pending_conf());

        node.step(Message::Propose(ProposeRequest::new(node.id(), conf_entry())));

        // Index 2 is the real change, index 3 the demoted spare.
        let entries = node.log().entries(LogIndex::new(2), NO_LIMIT).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::ConfChange);
        assert_eq!(entries[1].kind, EntryKind::Normal);
        assert!(node.pending_conf());
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut node = make_node(1, &[1, 2, 3]);

        node.add_node(NodeId::new(2));
        assert_eq!(node.nodes(), ids(&[1, 2, 3]));
    }

    #[test]
    fn test_remove_then_add_resets_progress() {
        let mut node = make_node(1, &[1, 2, 3]);
        elect(&mut node);

        node.remove_node(NodeId::new(3));
        assert_eq!(node.nodes(), ids(&[1, 2]));

        node.add_node(NodeId::new(3));
        let pr = node.progress(NodeId::new(3)).unwrap();
        assert_eq!(pr.matched.get(), 0);
        assert_eq!(pr.next.get(), node.log().last_index().get() + 1);
    }

    #[test]
    fn test_apply_conf_change_returns_membership() {
        let mut node = make_node(1, &[1, 2, 3]);

        let cs = node.apply_conf_change(&ConfChange::new(
            ConfChangeKind::RemoveNode,
            NodeId::new(2),
        ));
        assert_eq!(cs.nodes, ids(&[1, 3]));

        let cs = node.apply_conf_change(&ConfChange::new(
            ConfChangeKind::AddNode,
            NodeId::new(4),
        ));
        assert_eq!(cs.nodes, ids(&[1, 3, 4]));
    }

    #[test]
    fn test_read_index_needs_check_quorum() {
        let mut node = make_node(1, &[1]);
        node.step(Message::Hup);

        node.step(Message::ReadIndex(ReadIndexRequest::new(
            node.id(),
            Bytes::from_static(b"ctx"),
        )));
        let state = node.read_state.take().unwrap();
        assert_eq!(state.index, None);
        assert_eq!(state.request_ctx, Bytes::from_static(b"ctx"));
    }

    #[test]
    fn test_read_index_answers_commit_under_check_quorum() {
        let config = Config::new(NodeId::new(1))
            .with_peers(ids(&[1]))
            .with_ticks(10, 1)
            .with_check_quorum(true);
        let mut node = RaftNode::new(config, MemStorage::new()).unwrap();
        node.step(Message::Hup);
        assert_eq!(node.role(), RaftRole::Leader);

        node.step(Message::ReadIndex(ReadIndexRequest::new(
            node.id(),
            Bytes::from_static(b"ctx"),
        )));
        let state = node.read_state.take().unwrap();
        assert_eq!(state.index, Some(node.log().committed));
    }

    #[test]
    fn test_ready_carries_messages_and_entries() {
        let storage = MemStorage::new();
        let config = Config::new(NodeId::new(1))
            .with_peers(ids(&[1]))
            .with_ticks(10, 1);
        let mut node = RaftNode::new(config, storage.clone()).unwrap();
        node.step(Message::Hup);

        assert!(node.has_ready());
        let rd = node.ready();
        assert!(rd.soft_state.is_some());
        assert!(rd.hard_state.is_some());
        assert_eq!(rd.entries.len(), 1);
        assert_eq!(rd.committed_entries.len(), 1);

        storage.append(&rd.entries);
        node.advance(&rd);

        assert!(node.log().unstable_entries().is_empty());
        assert_eq!(node.log().applied.get(), 1);
        assert!(!node.has_ready());
    }

    #[test]
    fn test_restart_restores_hard_state() {
        let storage = MemStorage::new();
        let config = Config::new(NodeId::new(1))
            .with_peers(ids(&[1]))
            .with_ticks(10, 1);
        let mut node = RaftNode::new(config, storage.clone()).unwrap();
        node.step(Message::Hup);

        let rd = node.ready();
        storage.append(&rd.entries);
        storage.set_hard_state(rd.hard_state.unwrap());
        node.advance(&rd);
        drop(node);

        // Restart from the same storage: membership comes from the config
        // again (nothing recorded in a snapshot yet), state from storage.
        let config = Config::new(NodeId::new(1))
            .with_peers(ids(&[1]))
            .with_ticks(10, 1);
        let node = RaftNode::new(config, storage).unwrap();
        assert_eq!(node.term(), TermId::new(1));
        assert_eq!(node.vote(), Some(NodeId::new(1)));
        assert_eq!(node.log().committed.get(), 1);
        assert_eq!(node.role(), RaftRole::Follower);
    }

    #[test]
    fn test_unreachable_drops_replicate_to_probe() {
        let mut node = make_node(1, &[1, 2, 3]);
        elect(&mut node);

        // An ack moves the peer into Replicate mode.
        node.step(Message::AppendResponse(AppendResponse::accept(
            node.term(),
            NodeId::new(2),
            node.id(),
            LogIndex::new(1),
        )));
        assert_eq!(
            node.progress(NodeId::new(2)).unwrap().mode,
            ProgressMode::Replicate
        );

        node.step(Message::Unreachable(UnreachableReport::new(NodeId::new(2))));
        assert_eq!(
            node.progress(NodeId::new(2)).unwrap().mode,
            ProgressMode::Probe
        );
    }

    #[test]
    fn test_transfer_to_self_is_ignored() {
        let mut node = make_node(1, &[1, 2, 3]);
        elect(&mut node);

        node.step(Message::TransferLeader(TransferLeaderRequest::new(
            NodeId::new(1),
        )));
        assert_eq!(node.lead_transferee(), None);
        assert_eq!(node.role(), RaftRole::Leader);
    }

    #[test]
    fn test_transfer_aborts_after_election_timeout() {
        let mut node = make_node(1, &[1, 2, 3]);
        elect(&mut node);

        node.step(Message::TransferLeader(TransferLeaderRequest::new(
            NodeId::new(2),
        )));
        assert_eq!(node.lead_transferee(), Some(NodeId::new(2)));

        for _ in 0..10 {
            node.tick();
        }
        assert_eq!(node.lead_transferee(), None);
        assert_eq!(node.role(), RaftRole::Leader);
    }

    #[test]
    fn test_transfer_leader_ignored_by_follower() {
        let mut node = make_node(1, &[1, 2, 3]);

        node.step(Message::TransferLeader(TransferLeaderRequest::new(
            NodeId::new(2),
        )));
        assert_eq!(node.role(), RaftRole::Follower);
        assert!(node.msgs.is_empty());
    }
}
