//! The unified log view: durable storage plus the unstable suffix, with
//! commit and apply tracking.

use skiff_core::{LogIndex, TermId, NO_LIMIT};
use tracing::debug;

use crate::entry::{limit_entries, Entry};
use crate::snapshot::Snapshot;
use crate::storage::{Storage, StorageError, StorageResult};
use crate::unstable::Unstable;

/// The replicated log as seen by the consensus state machine.
///
/// The stable prefix lives in the [`Storage`] collaborator; entries the
/// driver has not yet persisted live in the unstable suffix. Readers see one
/// contiguous log.
#[derive(Debug)]
pub struct RaftLog<S: Storage> {
    /// The durable prefix.
    storage: S,
    /// Entries and snapshots awaiting persistence.
    unstable: Unstable,
    /// Highest index known committed on a quorum.
    pub committed: LogIndex,
    /// Highest index the application has consumed. Always `<= committed`.
    pub applied: LogIndex,
}

impl<S: Storage> RaftLog<S> {
    /// Creates a log resuming from whatever `storage` holds.
    pub fn new(storage: S) -> Self {
        let first = storage.first_index().get();
        let last = storage.last_index().get();
        Self {
            storage,
            unstable: Unstable::new(last + 1),
            committed: LogIndex::new(first - 1),
            applied: LogIndex::new(first - 1),
        }
    }

    /// Returns the storage collaborator.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// First index above the snapshot boundary.
    #[must_use]
    pub fn first_index(&self) -> LogIndex {
        let first = self
            .unstable
            .maybe_first_index()
            .unwrap_or_else(|| self.storage.first_index().get());
        LogIndex::new(first)
    }

    /// Last index of the log.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        let last = self
            .unstable
            .maybe_last_index()
            .unwrap_or_else(|| self.storage.last_index().get());
        LogIndex::new(last)
    }

    /// Term of the last entry.
    #[must_use]
    pub fn last_term(&self) -> TermId {
        match self.term(self.last_index()) {
            Ok(t) => t,
            Err(e) => panic!("unexpected error getting the term of the last index: {e}"),
        }
    }

    /// Term of the entry at `index`, consulting the unstable suffix first.
    ///
    /// # Errors
    /// `Compacted` below the snapshot boundary, `Unavailable` past the end.
    pub fn term(&self, index: LogIndex) -> StorageResult<TermId> {
        let i = index.get();
        // The snapshot boundary itself still answers with the snapshot term.
        let boundary = self.first_index().get() - 1;
        if i < boundary {
            return Err(StorageError::Compacted { index });
        }
        if i > self.last_index().get() {
            return Err(StorageError::Unavailable { index });
        }
        if let Some(t) = self.unstable.maybe_term(i) {
            return Ok(t);
        }
        self.storage.term(index)
    }

    /// Returns true if the entry at `index` has term `term`.
    #[must_use]
    pub fn match_term(&self, index: LogIndex, term: TermId) -> bool {
        self.term(index).is_ok_and(|t| t == term)
    }

    /// Entries from `index` to the end, size-capped at `max_size`.
    ///
    /// # Errors
    /// `Compacted` if `index` is below the snapshot boundary.
    pub fn entries(&self, index: LogIndex, max_size: u64) -> StorageResult<Vec<Entry>> {
        if index > self.last_index() {
            return Ok(Vec::new());
        }
        self.slice(index, LogIndex::new(self.last_index().get() + 1), max_size)
    }

    /// Entries in `[lo, hi)`, size-capped at `max_size` but never fewer
    /// than one.
    ///
    /// # Errors
    /// `Compacted` if `lo` is below the snapshot boundary.
    ///
    /// # Panics
    /// Panics on an inverted range or a range past the end (caller bugs).
    pub fn slice(&self, lo: LogIndex, hi: LogIndex, max_size: u64) -> StorageResult<Vec<Entry>> {
        self.check_bounds(lo, hi)?;
        if lo == hi {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        if lo.get() < self.unstable.offset {
            // Stable part, up to where the unstable suffix starts.
            let stable_hi = u64::min(hi.get(), self.unstable.offset);
            entries = self
                .storage
                .entries(lo, LogIndex::new(stable_hi), max_size)?;
            // Storage truncated for size; don't fetch more than it returned.
            if (entries.len() as u64) < stable_hi - lo.get() {
                return Ok(entries);
            }
        }
        if hi.get() > self.unstable.offset {
            let unstable_lo = u64::max(lo.get(), self.unstable.offset);
            entries.extend_from_slice(self.unstable.slice(unstable_lo, hi.get()));
        }
        Ok(limit_entries(entries, max_size))
    }

    fn check_bounds(&self, lo: LogIndex, hi: LogIndex) -> StorageResult<()> {
        assert!(lo <= hi, "invalid slice {} > {}", lo.get(), hi.get());
        if lo < self.first_index() {
            return Err(StorageError::Compacted { index: lo });
        }
        let upper = self.last_index().get() + 1;
        assert!(
            hi.get() <= upper,
            "slice[{}, {}) out of bound [{}, {})",
            lo.get(),
            hi.get(),
            self.first_index().get(),
            upper
        );
        Ok(())
    }

    /// The entries still awaiting persistence.
    #[must_use]
    pub fn unstable_entries(&self) -> &[Entry] {
        &self.unstable.entries
    }

    /// A snapshot awaiting persistence, if one arrived.
    #[must_use]
    pub fn unstable_snapshot(&self) -> Option<&Snapshot> {
        self.unstable.snapshot.as_ref()
    }

    /// Committed entries the application has not consumed yet.
    #[must_use]
    pub fn next_entries(&self) -> Vec<Entry> {
        let off = u64::max(self.applied.get() + 1, self.first_index().get());
        if self.committed.get() + 1 <= off {
            return Vec::new();
        }
        match self.slice(
            LogIndex::new(off),
            LogIndex::new(self.committed.get() + 1),
            NO_LIMIT,
        ) {
            Ok(entries) => entries,
            Err(e) => panic!("unexpected error getting unapplied entries: {e}"),
        }
    }

    /// Returns true if committed entries are waiting to be applied.
    #[must_use]
    pub fn has_next_entries(&self) -> bool {
        let off = u64::max(self.applied.get() + 1, self.first_index().get());
        self.committed.get() + 1 > off
    }

    /// The most recent snapshot: a pending one if present, else storage's.
    ///
    /// # Errors
    /// `SnapshotTemporarilyUnavailable` if storage is still preparing one.
    pub fn snapshot(&self) -> StorageResult<Snapshot> {
        if let Some(snapshot) = &self.unstable.snapshot {
            return Ok(snapshot.clone());
        }
        self.storage.snapshot()
    }

    /// Appends entries after verifying the `(prev_index, prev_term)` probe,
    /// truncating at the first conflict.
    ///
    /// On success, advances commit to `min(committed_hint, last new index)`
    /// and returns the last new index. Returns `None` on probe mismatch.
    pub fn maybe_append(
        &mut self,
        prev_index: LogIndex,
        prev_term: TermId,
        committed_hint: LogIndex,
        entries: &[Entry],
    ) -> Option<LogIndex> {
        if !self.match_term(prev_index, prev_term) {
            return None;
        }

        let last_new = prev_index.get() + entries.len() as u64;
        match self.find_conflict(entries) {
            None => {}
            Some(conflict) if conflict.get() <= self.committed.get() => {
                panic!(
                    "entry {} conflicts with committed entry [committed({})]",
                    conflict.get(),
                    self.committed.get()
                );
            }
            Some(conflict) => {
                let offset = prev_index.get() + 1;
                self.append(&entries[(conflict.get() - offset) as usize..]);
            }
        }
        self.commit_to(LogIndex::new(u64::min(committed_hint.get(), last_new)));
        Some(LogIndex::new(last_new))
    }

    /// Appends entries to the unstable suffix and returns the new last index.
    ///
    /// # Panics
    /// Panics if the entries would truncate below the commit index.
    pub fn append(&mut self, entries: &[Entry]) -> LogIndex {
        let Some(first) = entries.first() else {
            return self.last_index();
        };
        assert!(
            first.index.get() > self.committed.get(),
            "appending at {} would truncate committed entries [committed({})]",
            first.index.get(),
            self.committed.get()
        );
        self.unstable.truncate_and_append(entries);
        self.last_index()
    }

    /// Finds the first incoming entry whose term disagrees with ours (or
    /// which lies past our end). `None` means nothing new.
    fn find_conflict(&self, entries: &[Entry]) -> Option<LogIndex> {
        for entry in entries {
            if !self.match_term(entry.index, entry.term) {
                if entry.index <= self.last_index() {
                    debug!(
                        index = entry.index.get(),
                        existing_term = self.term(entry.index).map_or(0, TermId::get),
                        conflicting_term = entry.term.get(),
                        "found conflict at index"
                    );
                }
                return Some(entry.index);
            }
        }
        None
    }

    /// Advances the commit index to `to`.
    ///
    /// # Panics
    /// Panics if `to` is past the last index (a leader never commits what it
    /// does not have).
    pub fn commit_to(&mut self, to: LogIndex) {
        if self.committed < to {
            assert!(
                to <= self.last_index(),
                "commit target {} is out of range [last index {}]",
                to.get(),
                self.last_index().get()
            );
            self.committed = to;
        }
    }

    /// Commits through `index` if the entry there carries `term`.
    ///
    /// The term check is the Raft figure-8 guard: a leader only commits by
    /// replica count entries from its own term.
    pub fn maybe_commit(&mut self, index: LogIndex, term: TermId) -> bool {
        if index > self.committed && self.match_term(index, term) {
            self.commit_to(index);
            return true;
        }
        false
    }

    /// Records that the application consumed entries through `to`.
    ///
    /// # Panics
    /// Panics if `to` moves backwards or past the commit index.
    pub fn applied_to(&mut self, to: LogIndex) {
        if to.get() == 0 {
            return;
        }
        assert!(
            to <= self.committed && to >= self.applied,
            "applied target {} is out of range [applied {}, committed {}]",
            to.get(),
            self.applied.get(),
            self.committed.get()
        );
        self.applied = to;
    }

    /// Marks unstable entries through `(index, term)` as durable.
    pub fn stable_to(&mut self, index: LogIndex, term: TermId) {
        self.unstable.stable_to(index.get(), term);
    }

    /// Marks the pending snapshot at `index` as durable.
    pub fn stable_snap_to(&mut self, index: LogIndex) {
        self.unstable.stable_snap_to(index.get());
    }

    /// Resets the whole log to an incoming snapshot.
    pub fn restore(&mut self, snapshot: Snapshot) {
        debug!(
            index = snapshot.meta.index.get(),
            term = snapshot.meta.term.get(),
            committed = self.committed.get(),
            "log starts to restore snapshot"
        );
        self.committed = snapshot.meta.index;
        self.unstable.restore(snapshot);
    }

    /// Returns true if a candidate with `(last_index, last_term)` is at
    /// least as up-to-date as this log.
    #[must_use]
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: TermId) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use skiff_core::NodeId;

    use crate::snapshot::ConfState;
    use crate::storage::MemStorage;

    fn make_entry(term: u64, index: u64) -> Entry {
        Entry::normal(TermId::new(term), LogIndex::new(index), Bytes::new())
    }

    fn log_with(stable: &[Entry]) -> RaftLog<MemStorage> {
        let storage = MemStorage::new();
        storage.append(stable);
        RaftLog::new(storage)
    }

    #[test]
    fn test_fresh_log() {
        let log = log_with(&[]);

        assert_eq!(log.first_index().get(), 1);
        assert_eq!(log.last_index().get(), 0);
        assert_eq!(log.committed.get(), 0);
        assert_eq!(log.last_term().get(), 0);
    }

    #[test]
    fn test_term_spans_stable_and_unstable() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(2, 2)]);
        log.append(&[make_entry(3, 3)]);

        assert_eq!(log.term(LogIndex::new(1)).unwrap().get(), 1);
        assert_eq!(log.term(LogIndex::new(3)).unwrap().get(), 3);
        assert_eq!(
            log.term(LogIndex::new(4)),
            Err(StorageError::Unavailable {
                index: LogIndex::new(4)
            })
        );
    }

    #[test]
    fn test_maybe_append_accepts_matching_prev() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(1, 2)]);

        let last = log.maybe_append(
            LogIndex::new(2),
            TermId::new(1),
            LogIndex::new(1),
            &[make_entry(2, 3)],
        );

        assert_eq!(last, Some(LogIndex::new(3)));
        assert_eq!(log.last_index().get(), 3);
        assert_eq!(log.committed.get(), 1);
    }

    #[test]
    fn test_maybe_append_rejects_term_mismatch() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(1, 2)]);

        let result = log.maybe_append(
            LogIndex::new(2),
            TermId::new(9),
            LogIndex::new(0),
            &[make_entry(2, 3)],
        );

        assert_eq!(result, None);
        assert_eq!(log.last_index().get(), 2);
    }

    #[test]
    fn test_maybe_append_truncates_conflict() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(1, 2), make_entry(1, 3)]);

        let last = log.maybe_append(
            LogIndex::new(1),
            TermId::new(1),
            LogIndex::new(0),
            &[make_entry(2, 2), make_entry(2, 3)],
        );

        assert_eq!(last, Some(LogIndex::new(3)));
        assert_eq!(log.term(LogIndex::new(2)).unwrap().get(), 2);
        assert_eq!(log.term(LogIndex::new(3)).unwrap().get(), 2);
    }

    #[test]
    fn test_maybe_append_empty_advances_commit_only() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(1, 2)]);

        let last = log.maybe_append(LogIndex::new(2), TermId::new(1), LogIndex::new(2), &[]);

        assert_eq!(last, Some(LogIndex::new(2)));
        assert_eq!(log.committed.get(), 2);
        assert_eq!(log.last_index().get(), 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_commit_past_last_index_panics() {
        let mut log = log_with(&[make_entry(1, 1)]);
        log.commit_to(LogIndex::new(5));
    }

    #[test]
    fn test_commit_is_monotonic() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(1, 2)]);

        log.commit_to(LogIndex::new(2));
        log.commit_to(LogIndex::new(1));
        assert_eq!(log.committed.get(), 2);
    }

    #[test]
    fn test_maybe_commit_requires_term_match() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(2, 2)]);

        // Figure-8 guard: an older-term entry is not committed by count.
        assert!(!log.maybe_commit(LogIndex::new(1), TermId::new(2)));
        assert_eq!(log.committed.get(), 0);

        assert!(log.maybe_commit(LogIndex::new(2), TermId::new(2)));
        assert_eq!(log.committed.get(), 2);
    }

    #[test]
    fn test_next_entries_tracks_applied() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(1, 2), make_entry(1, 3)]);
        log.commit_to(LogIndex::new(2));

        let next = log.next_entries();
        assert_eq!(next.len(), 2);
        assert!(log.has_next_entries());

        log.applied_to(LogIndex::new(2));
        assert!(log.next_entries().is_empty());
        assert!(!log.has_next_entries());
    }

    #[test]
    fn test_restore_resets_log() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(1, 2)]);

        let snap = Snapshot::new(
            LogIndex::new(10),
            TermId::new(4),
            ConfState::new(vec![NodeId::new(1), NodeId::new(2)]),
            Bytes::new(),
        );
        log.restore(snap);

        assert_eq!(log.committed.get(), 10);
        assert_eq!(log.last_index().get(), 10);
        assert_eq!(log.first_index().get(), 11);
        assert_eq!(log.last_term().get(), 4);
        assert!(log.unstable_snapshot().is_some());
    }

    #[test]
    fn test_is_up_to_date() {
        let mut log = log_with(&[make_entry(1, 1)]);
        log.append(&[make_entry(2, 2)]);

        // Higher term wins regardless of length.
        assert!(log.is_up_to_date(LogIndex::new(1), TermId::new(3)));
        // Same term needs at least our length.
        assert!(log.is_up_to_date(LogIndex::new(2), TermId::new(2)));
        assert!(!log.is_up_to_date(LogIndex::new(1), TermId::new(2)));
        // Lower term loses.
        assert!(!log.is_up_to_date(LogIndex::new(9), TermId::new(1)));
    }

    #[test]
    fn test_slice_merges_stable_and_unstable() {
        let mut log = log_with(&[make_entry(1, 1), make_entry(1, 2)]);
        log.append(&[make_entry(2, 3), make_entry(2, 4)]);

        let all = log
            .slice(LogIndex::new(1), LogIndex::new(5), NO_LIMIT)
            .unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[3].index.get(), 4);
    }

    #[test]
    fn test_stable_to_shrinks_unstable() {
        let mut log = log_with(&[]);
        log.append(&[make_entry(1, 1), make_entry(1, 2)]);
        assert_eq!(log.unstable_entries().len(), 2);

        log.stable_to(LogIndex::new(1), TermId::new(1));
        assert_eq!(log.unstable_entries().len(), 1);
    }
}
