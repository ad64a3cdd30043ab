//! # Lane Relay
//!
//! Commit and execution reporting engines of a consensus-driven cross-chain message relay.
//!
//! The [`commit`] engine agrees on the next interval of source messages and on price
//! updates, committing the interval as a merkle root. The [`execution`] engine agrees on
//! batches of committed messages and proves their inclusion in a blessed root.

pub mod batching;
pub mod cli;
pub mod commit;
pub mod config;
pub mod consensus;
pub mod constants;
pub mod error;
pub mod execution;
pub mod inflight;
pub mod merkle;
pub mod metrics;
pub mod plugin;
pub mod prices;
pub mod readers;
pub mod serde;
pub mod snooze;
pub mod time;
pub mod types;
pub mod version;
