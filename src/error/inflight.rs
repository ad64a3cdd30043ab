use alloy::primitives::{Address, B256};
use thiserror::Error;

/// Errors returned by the inflight caches.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InflightError {
    /// A commit report with this root is already in flight.
    #[error("report is already in flight: {0}")]
    RootAlreadyInflight(B256),
    /// The interval of a commit report overlaps an interval already in flight.
    #[error("report is already in flight: interval [{min}, {max}] overlaps [{inflight_min}, {inflight_max}]")]
    IntervalAlreadyInflight {
        /// Lower bound of the rejected interval.
        min: u64,
        /// Upper bound of the rejected interval.
        max: u64,
        /// Lower bound of the inflight interval.
        inflight_min: u64,
        /// Upper bound of the inflight interval.
        inflight_max: u64,
    },
    /// A message of the batch is already tracked by another inflight batch.
    #[error("report is already in flight: sequence number {0}")]
    SeqNrAlreadyInflight(u64),
    /// A message with the same sender nonce is already tracked by another inflight batch.
    #[error("report is already in flight: sender {sender} nonce {nonce}")]
    NonceAlreadyInflight {
        /// The sender.
        sender: Address,
        /// The duplicated nonce.
        nonce: u64,
    },
}
