use alloy::primitives::{Address, B256, U256};
use thiserror::Error;

/// Errors returned by the execution engine.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A consensus sequence number has not been committed yet.
    #[error("sequence number {seq_nr} not committed (commit store expects {next})")]
    SequenceNumberNotCommitted {
        /// The offending sequence number.
        seq_nr: u64,
        /// The commit store's expected next sequence number.
        next: u64,
    },
    /// No accepted commit report covers the sequence number.
    #[error("no commit report found for sequence number {0}")]
    CommitReportNotFound(u64),
    /// Consensus messages span more than one commit report.
    #[error("sequence number {seq_nr} outside of committed interval [{min}, {max}]")]
    OutsideInterval {
        /// The offending sequence number.
        seq_nr: u64,
        /// Interval lower bound.
        min: u64,
        /// Interval upper bound.
        max: u64,
    },
    /// The rebuilt tree does not hash to the committed root.
    #[error("root mismatch: committed {committed}, rebuilt {rebuilt}")]
    RootMismatch {
        /// The committed root.
        committed: B256,
        /// The root rebuilt from source messages.
        rebuilt: B256,
    },
    /// The execution report proof does not verify.
    #[error("root does not verify")]
    RootDoesNotVerify,
    /// A report or batch without messages.
    #[error("messages are empty")]
    EmptyMessages,
    /// The price registry returned a different number of prices than tokens requested.
    #[error("token prices length exp={expected} actual={got}")]
    TokenPricesLength {
        /// Number of tokens requested.
        expected: usize,
        /// Number of prices returned.
        got: usize,
    },
    /// A token priced at zero.
    #[error("price of token {0} is zero")]
    ZeroTokenPrice(Address),
    /// The same token priced twice with different values.
    #[error("different prices ({first} and {second}) for the same token {token}")]
    InconsistentTokenPrice {
        /// The token.
        token: Address,
        /// The first reported price.
        first: U256,
        /// The conflicting price.
        second: U256,
    },
}
