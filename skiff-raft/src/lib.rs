//! Skiff Raft - a deterministic Raft consensus core.
//!
//! This crate implements the per-node Raft state machine: leader election,
//! log replication with per-peer progress tracking, snapshot installation,
//! single-node membership changes, and leadership transfer.
//!
//! # Design Principles
//!
//! - **Pure state machine**: the node consumes ticks and messages and
//!   produces a [`Ready`] bundle; transport, durable storage, and the
//!   applied state machine live behind narrow interfaces
//! - **Deterministic**: all randomness comes from an RNG seeded by the
//!   node id, so tests replay exactly
//! - **Single-threaded**: no locks, no suspension; every `step` runs to
//!   completion
//! - **No unsafe code**: Safety > Performance
//!
//! # Driving a node
//!
//! ```ignore
//! let mut node = RaftNode::new(config, storage.clone())?;
//!
//! loop {
//!     for msg in transport.recv() {
//!         node.step(msg);
//!     }
//!     if clock.tick_due() {
//!         node.tick();
//!     }
//!     if node.has_ready() {
//!         let rd = node.ready();
//!         storage.append(&rd.entries);          // persist first
//!         transport.send_all(&rd.messages);     // then send
//!         apply(&rd.committed_entries);         // then apply
//!         node.advance(&rd);
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod entry;
mod inflights;
mod log;
mod message;
mod progress;
mod raft;
mod ready;
mod snapshot;
mod storage;
mod unstable;

pub use config::{Config, ConfigError};
pub use entry::{ConfChange, ConfChangeKind, Entry, EntryKind};
pub use inflights::Inflights;
pub use log::RaftLog;
pub use message::{
    AppendRequest, AppendResponse, HeartbeatRequest, HeartbeatResponse, InstallSnapshotRequest,
    Message, ProposeRequest, ReadIndexRequest, ReadIndexResponse, SnapshotStatusReport,
    TimeoutNowRequest, TransferLeaderRequest, UnreachableReport, VoteRequest, VoteResponse,
};
pub use progress::{Progress, ProgressMode};
pub use raft::{RaftNode, RaftRole};
pub use ready::{ReadState, Ready, SoftState};
pub use snapshot::{ConfState, Snapshot, SnapshotMeta};
pub use storage::{HardState, MemStorage, Storage, StorageError, StorageResult};
