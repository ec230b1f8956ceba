//! Protocol limits and defaults.
//!
//! Put limits on everything: every window, batch, and timer has an explicit
//! bound so the consensus core stays predictable under load.

/// Sentinel for "no byte limit" when fetching log entries.
pub const NO_LIMIT: u64 = u64::MAX;

/// Fixed per-entry overhead, in bytes, charged on top of the payload when
/// sizing an append batch: term (8) + index (8) + kind tag (8).
pub const ENTRY_OVERHEAD_BYTES: u64 = 24;

/// Default election timeout, in ticks.
///
/// The effective timeout is randomized in `[election, 2 * election - 1]`
/// ticks on every role change. With a 100ms tick this gives a 1-2 second
/// election timeout.
pub const ELECTION_TICK_DEFAULT: u32 = 10;

/// Default heartbeat interval, in ticks.
pub const HEARTBEAT_TICK_DEFAULT: u32 = 1;

/// Default cap on optimistic in-flight append messages per peer.
pub const MAX_INFLIGHT_DEFAULT: usize = 256;

/// Default cap on the serialized size of one append message (1 MB).
pub const MAX_MSG_SIZE_DEFAULT: u64 = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        assert!(ELECTION_TICK_DEFAULT > HEARTBEAT_TICK_DEFAULT);
        assert!(HEARTBEAT_TICK_DEFAULT > 0);
        assert!(MAX_INFLIGHT_DEFAULT > 0);
    }
}
