//! Messages stepped through the consensus state machine.
//!
//! Everything that can happen to a node arrives as a [`Message`]: peer RPCs,
//! client proposals, and the local nudges produced by timers and the
//! transport (`Hup`, `Beat`, snapshot status, unreachable reports).
//!
//! Local messages carry no term field at all; [`Message::term`] returns
//! `None` for them and the dispatcher skips term normalization. This keeps
//! the local/remote distinction in the type rather than in a magic value.

use bytes::Bytes;
use skiff_core::{LogIndex, NodeId, TermId};

use crate::entry::Entry;
use crate::snapshot::Snapshot;

/// A message consumed by `RaftNode::step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Local: start a campaign (election timeout fired).
    Hup,
    /// Local: the leader should broadcast a heartbeat.
    Beat,
    /// Local: the leader should verify quorum activity.
    CheckQuorum,
    /// A client proposal, possibly forwarded by a follower.
    Propose(ProposeRequest),
    /// Log replication from the leader.
    Append(AppendRequest),
    /// A follower's reply to an append.
    AppendResponse(AppendResponse),
    /// Leader liveness ping.
    Heartbeat(HeartbeatRequest),
    /// A follower's reply to a heartbeat.
    HeartbeatResponse(HeartbeatResponse),
    /// A candidate asking for a vote.
    Vote(VoteRequest),
    /// A voter's reply.
    VoteResponse(VoteResponse),
    /// Bulk state transfer to a follower that fell behind the snapshot.
    InstallSnapshot(InstallSnapshotRequest),
    /// Local: the transport reports the outcome of a snapshot send.
    SnapshotStatus(SnapshotStatusReport),
    /// Local: the transport reports a peer as unreachable.
    Unreachable(UnreachableReport),
    /// Local: an administrator asks the leader to hand off leadership.
    TransferLeader(TransferLeaderRequest),
    /// The old leader tells the transfer target to campaign immediately.
    TimeoutNow(TimeoutNowRequest),
    /// A linearizable-read index request, possibly forwarded by a follower.
    ReadIndex(ReadIndexRequest),
    /// The leader's answer to a read-index request.
    ReadIndexResponse(ReadIndexResponse),
}

impl Message {
    /// Returns the term this message was sent at, or `None` for local
    /// messages (which bypass term normalization).
    #[must_use]
    pub const fn term(&self) -> Option<TermId> {
        match self {
            Self::Append(m) => Some(m.term),
            Self::AppendResponse(m) => Some(m.term),
            Self::Heartbeat(m) => Some(m.term),
            Self::HeartbeatResponse(m) => Some(m.term),
            Self::Vote(m) => Some(m.term),
            Self::VoteResponse(m) => Some(m.term),
            Self::InstallSnapshot(m) => Some(m.term),
            Self::TimeoutNow(m) => Some(m.term),
            Self::ReadIndexResponse(m) => Some(m.term),
            Self::Hup
            | Self::Beat
            | Self::CheckQuorum
            | Self::Propose(_)
            | Self::SnapshotStatus(_)
            | Self::Unreachable(_)
            | Self::TransferLeader(_)
            | Self::ReadIndex(_) => None,
        }
    }

    /// Returns the sender, where one exists.
    #[must_use]
    pub const fn from(&self) -> Option<NodeId> {
        match self {
            Self::Propose(m) => Some(m.from),
            Self::Append(m) => Some(m.from),
            Self::AppendResponse(m) => Some(m.from),
            Self::Heartbeat(m) => Some(m.from),
            Self::HeartbeatResponse(m) => Some(m.from),
            Self::Vote(m) => Some(m.from),
            Self::VoteResponse(m) => Some(m.from),
            Self::InstallSnapshot(m) => Some(m.from),
            Self::SnapshotStatus(m) => Some(m.from),
            Self::Unreachable(m) => Some(m.from),
            Self::TransferLeader(m) => Some(m.from),
            Self::TimeoutNow(m) => Some(m.from),
            Self::ReadIndex(m) => Some(m.from),
            Self::ReadIndexResponse(m) => Some(m.from),
            Self::Hup | Self::Beat | Self::CheckQuorum => None,
        }
    }

    /// Returns the destination, where one exists.
    ///
    /// Messages without a destination never leave the node that stepped
    /// them.
    #[must_use]
    pub const fn to(&self) -> Option<NodeId> {
        match self {
            Self::Propose(m) => m.to,
            Self::Append(m) => Some(m.to),
            Self::AppendResponse(m) => Some(m.to),
            Self::Heartbeat(m) => Some(m.to),
            Self::HeartbeatResponse(m) => Some(m.to),
            Self::Vote(m) => Some(m.to),
            Self::VoteResponse(m) => Some(m.to),
            Self::InstallSnapshot(m) => Some(m.to),
            Self::TimeoutNow(m) => Some(m.to),
            Self::ReadIndex(m) => m.to,
            Self::ReadIndexResponse(m) => Some(m.to),
            Self::Hup
            | Self::Beat
            | Self::CheckQuorum
            | Self::SnapshotStatus(_)
            | Self::Unreachable(_)
            | Self::TransferLeader(_) => None,
        }
    }

    /// Returns true if this message never crosses the wire.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.term().is_none()
    }
}

/// A client proposal.
///
/// Carries no term: a proposal forwarded by a follower must be treated by
/// the leader exactly as a local one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposeRequest {
    /// The node the proposal entered the cluster at.
    pub from: NodeId,
    /// The known leader, once a follower forwards the proposal.
    pub to: Option<NodeId>,
    /// The entries to replicate. Term and index are stamped by the leader.
    pub entries: Vec<Entry>,
}

impl ProposeRequest {
    /// Creates a proposal originating at `from`.
    #[must_use]
    pub const fn new(from: NodeId, entries: Vec<Entry>) -> Self {
        Self {
            from,
            to: None,
            entries,
        }
    }
}

/// Log replication request (also the carrier for commit advancement).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    /// Leader's term.
    pub term: TermId,
    /// The leader.
    pub from: NodeId,
    /// Target follower.
    pub to: NodeId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_index: LogIndex,
    /// Term of the entry at `prev_index`.
    pub prev_term: TermId,
    /// Entries to store; empty for a pure commit/probe message.
    pub entries: Vec<Entry>,
    /// Leader's commit index.
    pub commit: LogIndex,
}

impl AppendRequest {
    /// Creates a new append request.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        term: TermId,
        from: NodeId,
        to: NodeId,
        prev_index: LogIndex,
        prev_term: TermId,
        entries: Vec<Entry>,
        commit: LogIndex,
    ) -> Self {
        Self {
            term,
            from,
            to,
            prev_index,
            prev_term,
            entries,
            commit,
        }
    }
}

/// A follower's reply to an [`AppendRequest`] or [`InstallSnapshotRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResponse {
    /// Responder's term.
    pub term: TermId,
    /// The responding follower.
    pub from: NodeId,
    /// The leader.
    pub to: NodeId,
    /// On accept: the follower's new last index. On reject: the probed
    /// `prev_index` that failed to match.
    pub index: LogIndex,
    /// True if the append was rejected at `prev_index`.
    pub reject: bool,
    /// On reject: the follower's last index, hinting where to resume.
    pub reject_hint: LogIndex,
}

impl AppendResponse {
    /// Creates an accepting response.
    #[must_use]
    pub const fn accept(term: TermId, from: NodeId, to: NodeId, index: LogIndex) -> Self {
        Self {
            term,
            from,
            to,
            index,
            reject: false,
            reject_hint: LogIndex::new(0),
        }
    }

    /// Creates a rejecting response.
    #[must_use]
    pub const fn reject(
        term: TermId,
        from: NodeId,
        to: NodeId,
        index: LogIndex,
        hint: LogIndex,
    ) -> Self {
        Self {
            term,
            from,
            to,
            index,
            reject: true,
            reject_hint: hint,
        }
    }
}

/// Leader liveness ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRequest {
    /// Leader's term.
    pub term: TermId,
    /// The leader.
    pub from: NodeId,
    /// Target follower.
    pub to: NodeId,
    /// Commit index, capped at the follower's matched index.
    pub commit: LogIndex,
}

impl HeartbeatRequest {
    /// Creates a new heartbeat.
    #[must_use]
    pub const fn new(term: TermId, from: NodeId, to: NodeId, commit: LogIndex) -> Self {
        Self {
            term,
            from,
            to,
            commit,
        }
    }
}

/// A follower's reply to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Responder's term.
    pub term: TermId,
    /// The responding follower.
    pub from: NodeId,
    /// The leader.
    pub to: NodeId,
}

impl HeartbeatResponse {
    /// Creates a new heartbeat response.
    #[must_use]
    pub const fn new(term: TermId, from: NodeId, to: NodeId) -> Self {
        Self { term, from, to }
    }
}

/// A candidate asking for a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteRequest {
    /// Candidate's (already incremented) term.
    pub term: TermId,
    /// The candidate.
    pub from: NodeId,
    /// The voter being asked.
    pub to: NodeId,
    /// Index of the candidate's last log entry.
    pub last_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_term: TermId,
}

impl VoteRequest {
    /// Creates a new vote request.
    #[must_use]
    pub const fn new(
        term: TermId,
        from: NodeId,
        to: NodeId,
        last_index: LogIndex,
        last_term: TermId,
    ) -> Self {
        Self {
            term,
            from,
            to,
            last_index,
            last_term,
        }
    }
}

/// A voter's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteResponse {
    /// Voter's term.
    pub term: TermId,
    /// The voter.
    pub from: NodeId,
    /// The candidate.
    pub to: NodeId,
    /// True if the vote was withheld.
    pub reject: bool,
}

impl VoteResponse {
    /// Creates a new vote response.
    #[must_use]
    pub const fn new(term: TermId, from: NodeId, to: NodeId, reject: bool) -> Self {
        Self {
            term,
            from,
            to,
            reject,
        }
    }
}

/// Bulk state transfer for a follower whose needed entries were compacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: TermId,
    /// The leader.
    pub from: NodeId,
    /// Target follower.
    pub to: NodeId,
    /// The snapshot to install.
    pub snapshot: Snapshot,
}

impl InstallSnapshotRequest {
    /// Creates a new snapshot install request.
    #[must_use]
    pub const fn new(term: TermId, from: NodeId, to: NodeId, snapshot: Snapshot) -> Self {
        Self {
            term,
            from,
            to,
            snapshot,
        }
    }
}

/// Local report from the transport about a snapshot send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStatusReport {
    /// The peer the snapshot was sent to.
    pub from: NodeId,
    /// True if the send failed and should be retried later.
    pub reject: bool,
}

impl SnapshotStatusReport {
    /// Creates a new snapshot status report.
    #[must_use]
    pub const fn new(from: NodeId, reject: bool) -> Self {
        Self { from, reject }
    }
}

/// Local report from the transport that a peer could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreachableReport {
    /// The unreachable peer.
    pub from: NodeId,
}

impl UnreachableReport {
    /// Creates a new unreachable report.
    #[must_use]
    pub const fn new(from: NodeId) -> Self {
        Self { from }
    }
}

/// Local request that the leader hand leadership to `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLeaderRequest {
    /// The node that should become leader.
    pub from: NodeId,
}

impl TransferLeaderRequest {
    /// Creates a new transfer request targeting `from`.
    #[must_use]
    pub const fn new(from: NodeId) -> Self {
        Self { from }
    }
}

/// Tells the transfer target to start a campaign immediately, bypassing its
/// election timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutNowRequest {
    /// The old leader's term.
    pub term: TermId,
    /// The old leader.
    pub from: NodeId,
    /// The transfer target.
    pub to: NodeId,
}

impl TimeoutNowRequest {
    /// Creates a new timeout-now request.
    #[must_use]
    pub const fn new(term: TermId, from: NodeId, to: NodeId) -> Self {
        Self { term, from, to }
    }
}

/// A linearizable-read index request.
///
/// Like proposals, read requests carry no term and are forwarded to the
/// leader by followers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadIndexRequest {
    /// The node the request entered the cluster at.
    pub from: NodeId,
    /// The known leader, once a follower forwards the request.
    pub to: Option<NodeId>,
    /// Opaque request context, echoed back in the response.
    pub ctx: Bytes,
}

impl ReadIndexRequest {
    /// Creates a read-index request originating at `from`.
    #[must_use]
    pub const fn new(from: NodeId, ctx: Bytes) -> Self {
        Self {
            from,
            to: None,
            ctx,
        }
    }
}

/// The leader's answer to a [`ReadIndexRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadIndexResponse {
    /// Leader's term.
    pub term: TermId,
    /// The leader.
    pub from: NodeId,
    /// The requester.
    pub to: NodeId,
    /// The commit index the read must wait for, or `None` when the leader
    /// could not confirm its quorum.
    pub index: Option<LogIndex>,
    /// The request context, echoed back.
    pub ctx: Bytes,
}

impl ReadIndexResponse {
    /// Creates a new read-index response.
    #[must_use]
    pub const fn new(
        term: TermId,
        from: NodeId,
        to: NodeId,
        index: Option<LogIndex>,
        ctx: Bytes,
    ) -> Self {
        Self {
            term,
            from,
            to,
            index,
            ctx,
        }
    }
}
