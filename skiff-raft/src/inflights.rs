//! Bounded window of in-flight append batches for one peer.

use skiff_core::LogIndex;

/// A fixed-capacity FIFO of ascending log indices.
///
/// Each element records the last index of one in-flight append batch. When
/// the window is full the leader stops sending optimistic appends to the
/// peer; acknowledgements release the prefix of the window they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inflights {
    /// Position of the oldest in-flight batch in `buffer`.
    start: usize,
    /// Number of in-flight batches.
    count: usize,
    /// Ring capacity.
    capacity: usize,
    /// Ring storage, grown on demand up to `capacity`.
    buffer: Vec<u64>,
}

impl Inflights {
    /// Creates an empty window holding at most `capacity` batches.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            count: 0,
            capacity,
            buffer: Vec::new(),
        }
    }

    /// Returns true if no further batches may be sent.
    #[must_use]
    pub const fn full(&self) -> bool {
        self.count == self.capacity
    }

    /// Returns the number of in-flight batches.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Records `last` as the tail index of a newly sent batch.
    ///
    /// # Panics
    /// Panics if the window is full, or if `last` is not beyond the most
    /// recently added index (both are dispatcher bugs).
    pub fn add(&mut self, last: LogIndex) {
        assert!(!self.full(), "cannot add into a full inflights window");

        if self.count > 0 {
            let newest = (self.start + self.count - 1) % self.capacity;
            assert!(
                last.get() > self.buffer[newest],
                "inflight index regressed: {} <= {}",
                last.get(),
                self.buffer[newest]
            );
        }

        let next = (self.start + self.count) % self.capacity;
        if next >= self.buffer.len() {
            self.buffer.push(last.get());
        } else {
            self.buffer[next] = last.get();
        }
        self.count += 1;
    }

    /// Releases every batch whose tail index is `<= to`.
    pub fn free_to(&mut self, to: LogIndex) {
        if self.count == 0 || to.get() < self.buffer[self.start] {
            return;
        }

        let mut idx = self.start;
        let mut freed = 0;
        while freed < self.count {
            if to.get() < self.buffer[idx] {
                break;
            }
            freed += 1;
            idx = (idx + 1) % self.capacity;
        }
        self.count -= freed;
        self.start = idx;
        if self.count == 0 {
            // Window drained; rewind so the buffer can shrink its hot range.
            self.start = 0;
        }
    }

    /// Releases the oldest batch only.
    pub fn free_first(&mut self) {
        if self.count > 0 {
            let first = self.buffer[self.start];
            self.free_to(LogIndex::new(first));
        }
    }

    /// Forgets all in-flight batches.
    pub fn reset(&mut self) {
        self.start = 0;
        self.count = 0;
    }
}
