//! The unstable suffix of the log: entries and snapshots the driver has not
//! yet acknowledged as durable.

use skiff_core::TermId;
use tracing::debug;

use crate::entry::Entry;
use crate::snapshot::Snapshot;

/// Entries (and possibly a snapshot) awaiting persistence.
///
/// `entries[i]` has log index `offset + i`. A pending snapshot, if present,
/// precedes the entries: its index is `offset - 1`.
#[derive(Debug, Default)]
pub(crate) struct Unstable {
    /// An incoming snapshot that has not reached durable storage yet.
    pub snapshot: Option<Snapshot>,
    /// Log entries not yet acknowledged as durable.
    pub entries: Vec<Entry>,
    /// Log index of `entries[0]`.
    pub offset: u64,
}

impl Unstable {
    pub(crate) fn new(offset: u64) -> Self {
        Self {
            snapshot: None,
            entries: Vec::new(),
            offset,
        }
    }

    /// The first index covered here, if a pending snapshot defines one.
    pub(crate) fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.meta.index.get() + 1)
    }

    /// The last index covered here, from entries or the pending snapshot.
    pub(crate) fn maybe_last_index(&self) -> Option<u64> {
        if !self.entries.is_empty() {
            return Some(self.offset + self.entries.len() as u64 - 1);
        }
        self.snapshot.as_ref().map(|s| s.meta.index.get())
    }

    /// The term at `index`, if this suffix covers it.
    pub(crate) fn maybe_term(&self, index: u64) -> Option<TermId> {
        if index < self.offset {
            return match &self.snapshot {
                Some(s) if s.meta.index.get() == index => Some(s.meta.term),
                _ => None,
            };
        }
        let last = self.maybe_last_index()?;
        if index > last {
            return None;
        }
        Some(self.entries[(index - self.offset) as usize].term)
    }

    /// Drops entries now known durable up to `index` (at `term`).
    ///
    /// The term check guards against marking stable an entry that was
    /// truncated and replaced after the persistence request went out.
    pub(crate) fn stable_to(&mut self, index: u64, term: TermId) {
        let Some(t) = self.maybe_term(index) else {
            return;
        };
        if t == term && index >= self.offset {
            let keep_from = (index + 1 - self.offset) as usize;
            self.entries.drain(..keep_from);
            self.offset = index + 1;
        } else {
            debug!(
                index,
                "ignoring stale stable-to: entry was truncated after persistence started"
            );
        }
    }

    /// Clears the pending snapshot once durable at `index`.
    pub(crate) fn stable_snap_to(&mut self, index: u64) {
        if let Some(s) = &self.snapshot {
            if s.meta.index.get() == index {
                self.snapshot = None;
            }
        }
    }

    /// Replaces everything with an incoming snapshot.
    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.offset = snapshot.meta.index.get() + 1;
        self.entries.clear();
        self.snapshot = Some(snapshot);
    }

    /// Appends `incoming`, truncating any conflicting suffix first.
    pub(crate) fn truncate_and_append(&mut self, incoming: &[Entry]) {
        let Some(first) = incoming.first() else {
            return;
        };
        let after = first.index.get();

        if after == self.offset + self.entries.len() as u64 {
            // Directly after the current suffix.
            self.entries.extend_from_slice(incoming);
        } else if after <= self.offset {
            // The whole suffix is being replaced.
            debug!(offset = after, "replacing the unstable entries from index");
            self.offset = after;
            self.entries = incoming.to_vec();
        } else {
            // Keep [offset, after), replace the rest.
            debug!(offset = after, "truncating the unstable entries to index");
            self.entries.truncate((after - self.offset) as usize);
            self.entries.extend_from_slice(incoming);
        }
    }

    /// Returns entries in `[lo, hi)`.
    ///
    /// # Panics
    /// Panics if the range is not fully inside the unstable suffix.
    pub(crate) fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        assert!(lo <= hi, "invalid unstable slice {lo} > {hi}");
        let upper = self.offset + self.entries.len() as u64;
        assert!(
            lo >= self.offset && hi <= upper,
            "unstable slice [{lo}, {hi}) out of bound [{}, {upper})",
            self.offset
        );
        &self.entries[(lo - self.offset) as usize..(hi - self.offset) as usize]
    }
}
