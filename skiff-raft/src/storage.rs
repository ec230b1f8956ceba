//! Durable-state collaborator consumed by the log.
//!
//! The consensus core never performs I/O: it reads the stable prefix of the
//! log through the [`Storage`] trait and reports what must be persisted
//! through the `Ready` bundle. Implementations must guarantee that anything
//! acknowledged as stable survives a crash.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use skiff_core::{LogIndex, NodeId, TermId};
use thiserror::Error;

use crate::entry::{limit_entries, Entry};
use crate::snapshot::{ConfState, Snapshot};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Expected failures surfaced by a [`Storage`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The requested position was compacted into a snapshot. Callers
    /// downgrade to a snapshot send or reject the request.
    #[error("index {index} has been compacted into a snapshot")]
    Compacted {
        /// The compacted position.
        index: LogIndex,
    },

    /// The requested position is past the end of the log.
    #[error("index {index} is past the last index of the log")]
    Unavailable {
        /// The out-of-range position.
        index: LogIndex,
    },

    /// A snapshot is being prepared; skip this send attempt and retry later.
    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,

    /// An older snapshot was offered than the one already applied.
    #[error("snapshot at index {index} is out of date")]
    SnapshotOutOfDate {
        /// The stale snapshot's position.
        index: LogIndex,
    },
}

/// The state that must reach durable storage before messages are sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardState {
    /// Latest term this node has seen.
    pub term: TermId,
    /// Who received this node's vote in `term`, if anyone.
    pub vote: Option<NodeId>,
    /// Highest committed log index.
    pub commit: LogIndex,
}

impl HardState {
    /// Creates a hard state with the given values.
    #[must_use]
    pub const fn new(term: TermId, vote: Option<NodeId>, commit: LogIndex) -> Self {
        Self { term, vote, commit }
    }

    /// Returns true if nothing has ever been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Read-only view of the durable log and snapshot, consumed by the core.
pub trait Storage {
    /// Returns the persisted hard state and membership to boot from.
    fn initial_state(&self) -> (HardState, ConfState);

    /// Returns entries in `[lo, hi)`, total size capped at `max_size` bytes
    /// but never fewer than one entry.
    ///
    /// # Errors
    /// `Compacted` if `lo` is at or below the snapshot boundary.
    fn entries(&self, lo: LogIndex, hi: LogIndex, max_size: u64) -> StorageResult<Vec<Entry>>;

    /// Returns the term of the entry at `index`.
    ///
    /// The snapshot boundary itself is answerable: `term(snap_index)` is the
    /// snapshot's term.
    ///
    /// # Errors
    /// `Compacted` below the boundary, `Unavailable` past the end.
    fn term(&self, index: LogIndex) -> StorageResult<TermId>;

    /// Returns the first index available through `entries` (one past the
    /// snapshot boundary).
    fn first_index(&self) -> LogIndex;

    /// Returns the last index held in storage.
    fn last_index(&self) -> LogIndex;

    /// Returns the most recent snapshot.
    ///
    /// # Errors
    /// `SnapshotTemporarilyUnavailable` if one is still being prepared; the
    /// caller skips this send attempt and retries later.
    fn snapshot(&self) -> StorageResult<Snapshot>;
}

#[derive(Debug, Default)]
struct MemStorageCore {
    hard_state: HardState,
    snapshot: Snapshot,
    /// Entries above the snapshot boundary; `entries[0]` (if any) is at
    /// index `snapshot.meta.index + 1`.
    entries: Vec<Entry>,
}

impl MemStorageCore {
    fn snap_index(&self) -> u64 {
        self.snapshot.meta.index.get()
    }

    fn first_index(&self) -> u64 {
        self.snap_index() + 1
    }

    fn last_index(&self) -> u64 {
        self.snap_index() + self.entries.len() as u64
    }
}

/// In-memory [`Storage`] for tests and drivers that persist elsewhere.
///
/// Cloning is shallow: clones share one backing store, so the driver can
/// keep appending entries while the node holds its own handle.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    core: Arc<RwLock<MemStorageCore>>,
}

impl MemStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose snapshot boundary already records the given
    /// membership, the way a bootstrapped cluster starts.
    #[must_use]
    pub fn with_conf_state(conf_state: ConfState) -> Self {
        let store = Self::new();
        store.wl().snapshot.meta.conf_state = conf_state;
        store
    }

    fn rl(&self) -> RwLockReadGuard<'_, MemStorageCore> {
        self.core.read().expect("storage lock poisoned")
    }

    fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.core.write().expect("storage lock poisoned")
    }

    /// Persists the hard state.
    pub fn set_hard_state(&self, hard_state: HardState) {
        self.wl().hard_state = hard_state;
    }

    /// Overwrites the store with `snapshot`, dropping all entries.
    ///
    /// # Errors
    /// `SnapshotOutOfDate` if the store already covers a higher index.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> StorageResult<()> {
        let mut core = self.wl();
        if snapshot.meta.index.get() <= core.snap_index() {
            return Err(StorageError::SnapshotOutOfDate {
                index: snapshot.meta.index,
            });
        }
        core.hard_state.commit = snapshot.meta.index;
        core.snapshot = snapshot;
        core.entries.clear();
        Ok(())
    }

    /// Discards entries up to and including `index`, moving the snapshot
    /// boundary forward.
    ///
    /// # Errors
    /// `Compacted` if already compacted past `index`.
    ///
    /// # Panics
    /// Panics if `index` is past the last index (caller bug).
    pub fn compact(&self, index: LogIndex) -> StorageResult<()> {
        let mut core = self.wl();
        let i = index.get();
        if i <= core.snap_index() {
            return Err(StorageError::Compacted { index });
        }
        assert!(
            i <= core.last_index(),
            "compact {} is out of bound (last index {})",
            i,
            core.last_index()
        );

        let offset = (i - core.first_index()) as usize;
        core.snapshot.meta.term = core.entries[offset].term;
        core.snapshot.meta.index = index;
        core.entries.drain(..=offset);
        Ok(())
    }

    /// Appends entries, overwriting any overlapping suffix.
    ///
    /// Entries at or below the snapshot boundary are silently dropped.
    ///
    /// # Panics
    /// Panics if the entries would leave a gap after the current last index.
    pub fn append(&self, entries: &[Entry]) {
        if entries.is_empty() {
            return;
        }
        let mut core = self.wl();
        let first = core.first_index();
        let last = entries[0].index.get() + entries.len() as u64 - 1;

        if last < first {
            return;
        }
        // Drop the prefix that was already compacted.
        let entries = if entries[0].index.get() < first {
            &entries[(first - entries[0].index.get()) as usize..]
        } else {
            entries
        };

        let offset = entries[0].index.get();
        assert!(
            core.last_index() + 1 >= offset,
            "append leaves a gap: last index {}, incoming offset {}",
            core.last_index(),
            offset
        );

        let keep = (offset - core.first_index()) as usize;
        core.entries.truncate(keep);
        core.entries.extend_from_slice(entries);
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> (HardState, ConfState) {
        let core = self.rl();
        (core.hard_state, core.snapshot.meta.conf_state.clone())
    }

    fn entries(&self, lo: LogIndex, hi: LogIndex, max_size: u64) -> StorageResult<Vec<Entry>> {
        let core = self.rl();
        if lo.get() < core.first_index() {
            return Err(StorageError::Compacted { index: lo });
        }
        assert!(
            hi.get() <= core.last_index() + 1,
            "entries hi {} is out of bound (last index {})",
            hi.get(),
            core.last_index()
        );

        let offset = core.first_index();
        let slice =
            core.entries[(lo.get() - offset) as usize..(hi.get() - offset) as usize].to_vec();
        Ok(limit_entries(slice, max_size))
    }

    fn term(&self, index: LogIndex) -> StorageResult<TermId> {
        let core = self.rl();
        let i = index.get();
        if i < core.snap_index() {
            return Err(StorageError::Compacted { index });
        }
        if i == core.snap_index() {
            return Ok(core.snapshot.meta.term);
        }
        if i > core.last_index() {
            return Err(StorageError::Unavailable { index });
        }
        Ok(core.entries[(i - core.first_index()) as usize].term)
    }

    fn first_index(&self) -> LogIndex {
        LogIndex::new(self.rl().first_index())
    }

    fn last_index(&self) -> LogIndex {
        LogIndex::new(self.rl().last_index())
    }

    fn snapshot(&self) -> StorageResult<Snapshot> {
        Ok(self.rl().snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use skiff_core::NO_LIMIT;

    fn make_entry(term: u64, index: u64) -> Entry {
        Entry::normal(
            TermId::new(term),
            LogIndex::new(index),
            Bytes::from(format!("entry-{index}")),
        )
    }

    fn store_with(entries: &[Entry]) -> MemStorage {
        let store = MemStorage::new();
        store.append(entries);
        store
    }

    #[test]
    fn test_empty_store() {
        let store = MemStorage::new();

        assert_eq!(store.first_index().get(), 1);
        assert_eq!(store.last_index().get(), 0);
        assert_eq!(store.term(LogIndex::new(0)).unwrap().get(), 0);
        assert_eq!(
            store.term(LogIndex::new(1)),
            Err(StorageError::Unavailable {
                index: LogIndex::new(1)
            })
        );
    }

    #[test]
    fn test_entries_and_term() {
        let store = store_with(&[make_entry(1, 1), make_entry(1, 2), make_entry(2, 3)]);

        assert_eq!(store.last_index().get(), 3);
        assert_eq!(store.term(LogIndex::new(2)).unwrap().get(), 1);
        assert_eq!(store.term(LogIndex::new(3)).unwrap().get(), 2);

        let ents = store
            .entries(LogIndex::new(1), LogIndex::new(4), NO_LIMIT)
            .unwrap();
        assert_eq!(ents.len(), 3);
    }

    #[test]
    fn test_append_overwrites_suffix() {
        let store = store_with(&[make_entry(1, 1), make_entry(1, 2), make_entry(1, 3)]);

        store.append(&[make_entry(2, 2), make_entry(2, 3), make_entry(2, 4)]);

        assert_eq!(store.last_index().get(), 4);
        assert_eq!(store.term(LogIndex::new(2)).unwrap().get(), 2);
    }

    #[test]
    fn test_compact_moves_boundary() {
        let store = store_with(&[make_entry(1, 1), make_entry(2, 2), make_entry(3, 3)]);

        store.compact(LogIndex::new(2)).unwrap();

        assert_eq!(store.first_index().get(), 3);
        assert_eq!(store.term(LogIndex::new(2)).unwrap().get(), 2);
        assert_eq!(
            store.term(LogIndex::new(1)),
            Err(StorageError::Compacted {
                index: LogIndex::new(1)
            })
        );
        assert_eq!(
            store.entries(LogIndex::new(2), LogIndex::new(4), NO_LIMIT),
            Err(StorageError::Compacted {
                index: LogIndex::new(2)
            })
        );
    }

    #[test]
    fn test_apply_snapshot() {
        let store = store_with(&[make_entry(1, 1), make_entry(1, 2)]);

        let snap = Snapshot::new(
            LogIndex::new(5),
            TermId::new(3),
            ConfState::new(vec![NodeId::new(1), NodeId::new(2)]),
            Bytes::from_static(b"state"),
        );
        store.apply_snapshot(snap.clone()).unwrap();

        assert_eq!(store.first_index().get(), 6);
        assert_eq!(store.last_index().get(), 5);
        assert_eq!(store.term(LogIndex::new(5)).unwrap().get(), 3);

        // A stale snapshot is refused.
        let stale = Snapshot::new(LogIndex::new(4), TermId::new(3), ConfState::default(), Bytes::new());
        assert_eq!(
            store.apply_snapshot(stale),
            Err(StorageError::SnapshotOutOfDate {
                index: LogIndex::new(4)
            })
        );
    }

    #[test]
    fn test_shared_handles_see_writes() {
        let store = MemStorage::new();
        let other = store.clone();

        store.append(&[make_entry(1, 1)]);
        assert_eq!(other.last_index().get(), 1);
    }
}
