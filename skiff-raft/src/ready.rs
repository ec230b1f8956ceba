//! The hand-off bundle between the consensus core and its driver.
//!
//! The core performs no I/O. Each driver iteration pulls a [`Ready`] bundle,
//! persists and sends what it contains, then acknowledges with
//! `RaftNode::advance` so the core can shrink its unstable suffix and hand
//! out the next batch of committed entries. The node must not be stepped
//! between the two calls.

use bytes::Bytes;
use skiff_core::{LogIndex, NodeId};

use crate::entry::Entry;
use crate::message::Message;
use crate::raft::RaftRole;
use crate::snapshot::Snapshot;
use crate::storage::HardState;

/// Volatile role information, for observability only. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftState {
    /// The known leader, if any.
    pub leader: Option<NodeId>,
    /// This node's current role.
    pub role: RaftRole,
}

/// The answer to a read-index request.
///
/// A read served at `index` is linearizable once the application has applied
/// through `index`. `None` means the leader could not confirm its quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    /// Commit index the read must wait for, if the leader could answer.
    pub index: Option<LogIndex>,
    /// The request context, echoed back for correlation.
    pub request_ctx: Bytes,
}

/// Everything the driver must act on for one iteration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ready {
    /// New role/leader information, when it changed.
    pub soft_state: Option<SoftState>,
    /// Hard state to persist before sending `messages`, when it changed.
    pub hard_state: Option<HardState>,
    /// Entries to persist to durable storage.
    pub entries: Vec<Entry>,
    /// Entries now committed, to hand to the application in order.
    pub committed_entries: Vec<Entry>,
    /// A snapshot to persist and hand to the application, if one arrived.
    pub snapshot: Option<Snapshot>,
    /// Messages to hand to the transport, in order, after persistence.
    pub messages: Vec<Message>,
    /// An answered read-index request, if any.
    pub read_state: Option<ReadState>,
}

impl Ready {
    /// Returns true if nothing in the bundle requires driver action.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.soft_state.is_none()
            && self.hard_state.is_none()
            && self.entries.is_empty()
            && self.committed_entries.is_empty()
            && self.snapshot.is_none()
            && self.messages.is_empty()
            && self.read_state.is_none()
    }
}
