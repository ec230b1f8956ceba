//! Per-peer replication progress, tracked by the leader.

use std::fmt;

use skiff_core::LogIndex;

use crate::inflights::Inflights;

/// How the leader is currently feeding one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Exploring where the peer's log diverges: one append at a time, paused
    /// until the peer answers.
    Probe,
    /// Streaming optimistically: `next` runs ahead of acknowledgements,
    /// bounded by the inflight window.
    Replicate,
    /// Waiting for a snapshot transfer to finish; appends are suppressed.
    Snapshot,
}

/// Replication state for a single peer.
///
/// `matched` is ground truth (highest index known replicated); `next` is
/// where the next append starts and may run ahead optimistically while
/// replicating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Highest log index known to be replicated on the peer.
    pub matched: LogIndex,
    /// Index of the next entry to send.
    pub next: LogIndex,
    /// Current feeding mode.
    pub mode: ProgressMode,
    /// In Probe mode, set after a send until the peer answers. In Snapshot
    /// mode, set while waiting for the transport's status report.
    pub paused: bool,
    /// The index of the snapshot being transferred, while in Snapshot mode.
    pub pending_snapshot: Option<LogIndex>,
    /// True if the peer has responded since the last quorum check.
    pub recent_active: bool,
    /// Outstanding optimistic append batches.
    pub inflights: Inflights,
}

impl Progress {
    /// Creates a fresh progress in Probe mode.
    #[must_use]
    pub const fn new(next: LogIndex, max_inflight: usize) -> Self {
        Self {
            matched: LogIndex::new(0),
            next,
            mode: ProgressMode::Probe,
            paused: false,
            pending_snapshot: None,
            recent_active: false,
            inflights: Inflights::new(max_inflight),
        }
    }

    fn reset_mode(&mut self, mode: ProgressMode) {
        self.paused = false;
        self.pending_snapshot = None;
        self.mode = mode;
        self.inflights.reset();
    }

    /// Drops to Probe mode: after a rejection, an unreachable report while
    /// replicating, or a finished/failed snapshot.
    pub fn become_probe(&mut self) {
        // When coming out of a snapshot transfer, the peer is assumed to hold
        // everything up to the pending snapshot's index.
        if self.mode == ProgressMode::Snapshot {
            let pending = self.pending_snapshot.unwrap_or(LogIndex::new(0));
            self.reset_mode(ProgressMode::Probe);
            self.next = LogIndex::new(u64::max(self.matched.get() + 1, pending.get() + 1));
        } else {
            self.reset_mode(ProgressMode::Probe);
            self.next = LogIndex::new(self.matched.get() + 1);
        }
    }

    /// Switches to optimistic streaming after a successful append ack.
    pub fn become_replicate(&mut self) {
        self.reset_mode(ProgressMode::Replicate);
        self.next = LogIndex::new(self.matched.get() + 1);
    }

    /// Enters Snapshot mode for a transfer covering up to `index`.
    pub fn become_snapshot(&mut self, index: LogIndex) {
        self.reset_mode(ProgressMode::Snapshot);
        self.pending_snapshot = Some(index);
    }

    /// Records a successful acknowledgement up to `n`.
    ///
    /// Returns true if the acknowledgement moved `matched` forward (a stale
    /// or duplicate ack returns false).
    pub fn maybe_update(&mut self, n: LogIndex) -> bool {
        let updated = n > self.matched;
        if updated {
            self.matched = n;
            self.resume();
        }
        if self.next.get() < n.get() + 1 {
            self.next = LogIndex::new(n.get() + 1);
        }
        updated
    }

    /// Advances `next` past a just-sent batch ending at `last`.
    ///
    /// Only meaningful while replicating; `matched` is untouched.
    pub fn optimistic_update(&mut self, last: LogIndex) {
        debug_assert!(
            self.mode == ProgressMode::Replicate,
            "optimistic update outside Replicate mode"
        );
        self.next = LogIndex::new(last.get() + 1);
    }

    /// Backs `next` off after the peer rejected the append probing at
    /// `rejected`, with the peer's last index as `hint`.
    ///
    /// Returns false if the rejection is stale and `next` was left alone.
    pub fn maybe_decr_to(&mut self, rejected: LogIndex, hint: LogIndex) -> bool {
        if self.mode == ProgressMode::Replicate {
            // An ack may already have moved matched past the rejected probe.
            if rejected < self.matched {
                return false;
            }
            self.next = LogIndex::new(u64::max(
                self.matched.get() + 1,
                u64::min(rejected.get(), hint.get() + 1),
            ));
            self.resume();
            return true;
        }

        // In Probe mode only the reply to the outstanding probe counts.
        if rejected.get() + 1 != self.next.get() {
            return false;
        }
        self.next = LogIndex::new(u64::max(self.matched.get() + 1, hint.get() + 1));
        self.resume();
        true
    }

    /// Clears a failed snapshot transfer so the next probe can restart it.
    pub fn snapshot_failure(&mut self) {
        self.pending_snapshot = None;
    }

    /// Returns true when the peer's acknowledged log has caught up with the
    /// pending snapshot, making the transfer pointless.
    #[must_use]
    pub fn need_snapshot_abort(&self) -> bool {
        self.mode == ProgressMode::Snapshot
            && self.pending_snapshot.is_some_and(|ps| self.matched >= ps)
    }

    /// Suspends sends to this peer.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes sends to this peer.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Returns true if the leader should not send an append right now.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
            || self.mode == ProgressMode::Snapshot
            || (self.mode == ProgressMode::Replicate && self.inflights.full())
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} match={} next={}",
            self.mode,
            self.matched.get(),
            self.next.get()
        )?;
        if let Some(ps) = self.pending_snapshot {
            write!(f, " pending_snapshot={}", ps.get())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_at(matched: u64, next: u64) -> Progress {
        let mut pr = Progress::new(LogIndex::new(next), 8);
        pr.matched = LogIndex::new(matched);
        pr
    }

    #[test]
    fn test_maybe_update_advances() {
        let mut pr = probe_at(3, 4);

        assert!(pr.maybe_update(LogIndex::new(5)));
        assert_eq!(pr.matched.get(), 5);
        assert_eq!(pr.next.get(), 6);

        // Stale ack: no movement.
        assert!(!pr.maybe_update(LogIndex::new(4)));
        assert_eq!(pr.matched.get(), 5);
        assert_eq!(pr.next.get(), 6);
    }

    #[test]
    fn test_maybe_update_clears_pause() {
        let mut pr = probe_at(0, 1);
        pr.pause();
        assert!(pr.is_paused());

        assert!(pr.maybe_update(LogIndex::new(1)));
        assert!(!pr.is_paused());
    }

    #[test]
    fn test_probe_decr_requires_matching_probe() {
        let mut pr = probe_at(2, 6);

        // Reply to an older probe: ignored.
        assert!(!pr.maybe_decr_to(LogIndex::new(3), LogIndex::new(2)));
        assert_eq!(pr.next.get(), 6);

        // Reply to the outstanding probe at next-1 = 5.
        assert!(pr.maybe_decr_to(LogIndex::new(5), LogIndex::new(3)));
        assert_eq!(pr.next.get(), 4);
    }

    #[test]
    fn test_probe_decr_never_below_matched() {
        let mut pr = probe_at(4, 6);

        assert!(pr.maybe_decr_to(LogIndex::new(5), LogIndex::new(0)));
        assert_eq!(pr.next.get(), 5);
    }

    #[test]
    fn test_replicate_decr_stale_rejection() {
        let mut pr = probe_at(5, 6);
        pr.become_replicate();
        pr.optimistic_update(LogIndex::new(9));

        assert!(!pr.maybe_decr_to(LogIndex::new(4), LogIndex::new(3)));
        assert_eq!(pr.next.get(), 10);
    }

    #[test]
    fn test_replicate_decr_rewinds() {
        let mut pr = probe_at(5, 6);
        pr.become_replicate();
        pr.optimistic_update(LogIndex::new(9));

        assert!(pr.maybe_decr_to(LogIndex::new(9), LogIndex::new(7)));
        assert_eq!(pr.next.get(), 8);
    }

    #[test]
    fn test_become_probe_from_snapshot() {
        let mut pr = probe_at(1, 2);
        pr.become_snapshot(LogIndex::new(10));
        assert!(pr.is_paused());
        assert_eq!(pr.pending_snapshot, Some(LogIndex::new(10)));

        pr.become_probe();
        assert_eq!(pr.mode, ProgressMode::Probe);
        assert_eq!(pr.next.get(), 11);
        assert_eq!(pr.pending_snapshot, None);
    }

    #[test]
    fn test_become_replicate_resets_next() {
        let mut pr = probe_at(7, 12);

        pr.become_replicate();
        assert_eq!(pr.mode, ProgressMode::Replicate);
        assert_eq!(pr.next.get(), 8);
    }

    #[test]
    fn test_need_snapshot_abort() {
        let mut pr = probe_at(0, 1);
        pr.become_snapshot(LogIndex::new(5));
        assert!(!pr.need_snapshot_abort());

        // The peer caught up past the pending snapshot through other means.
        pr.matched = LogIndex::new(5);
        assert!(pr.need_snapshot_abort());
    }

    #[test]
    fn test_is_paused_per_mode() {
        let mut pr = probe_at(0, 1);
        assert!(!pr.is_paused());
        pr.pause();
        assert!(pr.is_paused());

        pr.become_replicate();
        assert!(!pr.is_paused());

        let mut full = Progress::new(LogIndex::new(1), 1);
        full.become_replicate();
        full.inflights.add(LogIndex::new(1));
        assert!(full.is_paused());

        pr.become_snapshot(LogIndex::new(3));
        assert!(pr.is_paused());
    }
}
