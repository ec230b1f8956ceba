//! Node configuration and validation.

use skiff_core::{
    LogIndex, NodeId, ELECTION_TICK_DEFAULT, HEARTBEAT_TICK_DEFAULT, MAX_INFLIGHT_DEFAULT,
    MAX_MSG_SIZE_DEFAULT,
};
use thiserror::Error;

/// Rejected configurations, reported at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The node id zero is the "no node" sentinel and cannot be used.
    #[error("node id cannot be zero")]
    ZeroNodeId,

    /// The heartbeat interval must be at least one tick.
    #[error("heartbeat tick must be greater than 0")]
    ZeroHeartbeatTick,

    /// Elections must fire strictly less often than heartbeats.
    #[error("election tick ({election}) must be greater than heartbeat tick ({heartbeat})")]
    ElectionTickTooSmall {
        /// Configured election timeout in ticks.
        election: u32,
        /// Configured heartbeat interval in ticks.
        heartbeat: u32,
    },

    /// At least one optimistic append must be allowed in flight.
    #[error("max inflight messages must be greater than 0")]
    ZeroMaxInflight,
}

/// Parameters for starting a consensus node.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's identifier. Must be nonzero.
    pub id: NodeId,

    /// Ids of all cluster members (including this node) when bootstrapping a
    /// brand-new cluster. Must be empty when restarting from storage that
    /// already records a membership; the recorded one wins.
    pub peers: Vec<NodeId>,

    /// Election timeout in ticks: a follower campaigns after going this long
    /// (randomized up to 2x) without hearing from a leader.
    pub election_tick: u32,

    /// Heartbeat interval in ticks.
    pub heartbeat_tick: u32,

    /// Index the application had already consumed before restarting. The
    /// node will not hand back entries at or below this index.
    pub applied: LogIndex,

    /// Cap on the serialized size of the entries in one append message.
    /// Zero means at most one entry per append.
    pub max_size_per_msg: u64,

    /// Cap on optimistic in-flight append messages per peer.
    pub max_inflight_msgs: usize,

    /// When set, the leader steps down after an election timeout without
    /// quorum contact, and followers refuse disruptive higher-term votes
    /// while their leader lease holds.
    pub check_quorum: bool,
}

impl Config {
    /// Creates a configuration with defaults for node `id`.
    #[must_use]
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            peers: Vec::new(),
            election_tick: ELECTION_TICK_DEFAULT,
            heartbeat_tick: HEARTBEAT_TICK_DEFAULT,
            applied: LogIndex::new(0),
            max_size_per_msg: MAX_MSG_SIZE_DEFAULT,
            max_inflight_msgs: MAX_INFLIGHT_DEFAULT,
            check_quorum: false,
        }
    }

    /// Sets the bootstrap peer list.
    #[must_use]
    pub fn with_peers(mut self, peers: Vec<NodeId>) -> Self {
        self.peers = peers;
        self
    }

    /// Sets the election and heartbeat intervals, in ticks.
    #[must_use]
    pub const fn with_ticks(mut self, election: u32, heartbeat: u32) -> Self {
        self.election_tick = election;
        self.heartbeat_tick = heartbeat;
        self
    }

    /// Enables or disables quorum checking.
    #[must_use]
    pub const fn with_check_quorum(mut self, on: bool) -> Self {
        self.check_quorum = on;
        self
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    /// Returns the first violated constraint; construction refuses invalid
    /// configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.get() == 0 {
            return Err(ConfigError::ZeroNodeId);
        }
        if self.heartbeat_tick == 0 {
            return Err(ConfigError::ZeroHeartbeatTick);
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(ConfigError::ElectionTickTooSmall {
                election: self.election_tick,
                heartbeat: self.heartbeat_tick,
            });
        }
        if self.max_inflight_msgs == 0 {
            return Err(ConfigError::ZeroMaxInflight);
        }
        Ok(())
    }
}
