use alloy::primitives::Address;
use thiserror::Error;

/// Errors returned by the commit engine.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Source messages are not contiguous.
    #[error("unexpected gap in seq nums: expected {expected}, got {got}")]
    SequenceGap {
        /// The sequence number that should have followed.
        expected: u64,
        /// The sequence number that was found.
        got: u64,
    },
    /// Interval consensus produced an upper bound below the lower bound.
    #[error("interval max {max} below min {min}")]
    MaxBelowMin {
        /// Agreed lower bound.
        min: u64,
        /// Agreed upper bound.
        max: u64,
    },
    /// The number of messages read for an interval does not match its size.
    #[error("interval [{min}, {max}] has {got} messages")]
    MessageCountMismatch {
        /// Interval lower bound.
        min: u64,
        /// Interval upper bound.
        max: u64,
        /// Number of messages read.
        got: usize,
    },
    /// The price getter did not quote a token.
    #[error("missing token price: {0}")]
    MissingTokenPrice(Address),
    /// The price registry returned a different number of decimals than tokens requested.
    #[error("expected {expected} token decimals, got {got}")]
    DecimalsMismatch {
        /// Number of tokens requested.
        expected: usize,
        /// Number of decimals returned.
        got: usize,
    },
}
