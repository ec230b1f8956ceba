//! Snapshots of the applied state machine.
//!
//! A snapshot stands in for the compacted log prefix: it carries the index
//! and term of the last entry it covers, plus the cluster membership as of
//! that index so a restored node can rebuild its peer set.

use bytes::Bytes;
use skiff_core::{LogIndex, NodeId, TermId};

/// Cluster membership as of a snapshot boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfState {
    /// The ids of all voting members.
    pub nodes: Vec<NodeId>,
}

impl ConfState {
    /// Creates a membership set from node ids.
    #[must_use]
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self { nodes }
    }

    /// Returns true if no members are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Metadata describing what a snapshot covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Last log index covered by the snapshot.
    pub index: LogIndex,
    /// Term of the entry at `index`.
    pub term: TermId,
    /// Membership as of `index`.
    pub conf_state: ConfState,
}

/// A point-in-time snapshot of the applied state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// What this snapshot covers.
    pub meta: SnapshotMeta,
    /// Opaque state machine payload.
    pub data: Bytes,
}

impl Snapshot {
    /// Creates a new snapshot.
    #[must_use]
    pub fn new(index: LogIndex, term: TermId, conf_state: ConfState, data: Bytes) -> Self {
        Self {
            meta: SnapshotMeta {
                index,
                term,
                conf_state,
            },
            data,
        }
    }

    /// Returns true if this is the empty snapshot (covers nothing).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meta.index.get() == 0
    }
}
