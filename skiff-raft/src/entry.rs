//! Replicated log entries and the configuration-change payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use skiff_core::{LogIndex, NodeId, TermId, ENTRY_OVERHEAD_BYTES, NO_LIMIT};

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// An opaque application command.
    Normal,
    /// A single-node membership change (see [`ConfChange`]).
    ConfChange,
}

impl Default for EntryKind {
    fn default() -> Self {
        Self::Normal
    }
}

/// A single entry in the replicated log.
///
/// Indices are strictly increasing and contiguous within a log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    /// The term in which this entry was proposed.
    pub term: TermId,
    /// The log position of this entry.
    pub index: LogIndex,
    /// Whether this is a command or a membership change.
    pub kind: EntryKind,
    /// The payload.
    pub data: Bytes,
}

impl Entry {
    /// Creates a new entry.
    #[must_use]
    pub const fn new(term: TermId, index: LogIndex, kind: EntryKind, data: Bytes) -> Self {
        Self {
            term,
            index,
            kind,
            data,
        }
    }

    /// Creates a normal (application command) entry.
    #[must_use]
    pub const fn normal(term: TermId, index: LogIndex, data: Bytes) -> Self {
        Self::new(term, index, EntryKind::Normal, data)
    }

    /// The size this entry is charged against an append batch budget.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        ENTRY_OVERHEAD_BYTES + self.data.len() as u64
    }
}

/// Returns the longest prefix of `entries` whose total size stays within
/// `max_size`, but never fewer than one entry.
#[must_use]
pub(crate) fn limit_entries(mut entries: Vec<Entry>, max_size: u64) -> Vec<Entry> {
    if max_size == NO_LIMIT || entries.len() <= 1 {
        return entries;
    }

    let mut size = 0u64;
    let mut keep = 0usize;
    for entry in &entries {
        size = size.saturating_add(entry.size_bytes());
        if keep > 0 && size > max_size {
            break;
        }
        keep += 1;
    }
    entries.truncate(keep);
    entries
}

/// The direction of a single-node membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfChangeKind {
    /// Add a node to the configuration.
    AddNode,
    /// Remove a node from the configuration.
    RemoveNode,
}

/// A single-node configuration change, carried as the payload of an
/// [`EntryKind::ConfChange`] entry.
///
/// The driver decodes this from a committed entry and hands it back to the
/// node through `apply_conf_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfChange {
    /// Add or remove.
    pub kind: ConfChangeKind,
    /// The node being added or removed.
    pub node_id: NodeId,
}

impl ConfChange {
    /// Creates a new configuration change.
    #[must_use]
    pub const fn new(kind: ConfChangeKind, node_id: NodeId) -> Self {
        Self { kind, node_id }
    }

    /// Encodes the change into a payload buffer.
    ///
    /// Format: kind (1 byte) + `node_id` (8 bytes LE).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self.kind {
            ConfChangeKind::AddNode => buf.put_u8(0),
            ConfChangeKind::RemoveNode => buf.put_u8(1),
        }
        buf.put_u64_le(self.node_id.get());
    }

    /// Encodes the change into a fresh payload.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a change from an entry payload.
    ///
    /// Returns `None` if the buffer is truncated or the kind tag is unknown.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 9 {
            return None;
        }
        let kind = match buf.get_u8() {
            0 => ConfChangeKind::AddNode,
            1 => ConfChangeKind::RemoveNode,
            _ => return None,
        };
        let node_id = NodeId::new(buf.get_u64_le());
        Some(Self { kind, node_id })
    }
}
