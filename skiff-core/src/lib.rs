//! Skiff Core - Strongly-typed identifiers and protocol limits for Skiff.
//!
//! This crate provides the vocabulary types shared by the Skiff consensus
//! machinery. It does NOT provide clocks, transports, or storage - those are
//! collaborators supplied by the embedding process.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up a `NodeId` with a `LogIndex`
//! - **Explicit limits**: Every buffer and window has a bounded maximum
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod limits;
mod types;

pub use limits::{
    ELECTION_TICK_DEFAULT, ENTRY_OVERHEAD_BYTES, HEARTBEAT_TICK_DEFAULT, MAX_INFLIGHT_DEFAULT,
    MAX_MSG_SIZE_DEFAULT, NO_LIMIT,
};
pub use types::{LogIndex, NodeId, TermId};
