//! Lane relay error types.
use thiserror::Error;

mod commit;
pub use commit::CommitError;

mod execution;
pub use execution::ExecutionError;

mod inflight;
pub use inflight::InflightError;

mod merkle;
pub use merkle::MerkleError;

pub use crate::readers::ReaderError;

/// The overarching error type returned by the reporting engine callbacks.
///
/// A callback that returns an error abstains from the current round. The round is retried
/// at the runtime's cadence; nothing in this crate retries internally.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The commit store is paused or unhealthy, the protocol halts until it recovers.
    #[error("commit store is down")]
    CommitStoreDown,
    /// The round was cancelled before the callback could finish.
    #[error("round cancelled")]
    Cancelled,
    /// Errors related to the commit engine.
    #[error(transparent)]
    Commit(#[from] CommitError),
    /// Errors related to the execution engine.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    /// Errors related to the inflight caches.
    #[error(transparent)]
    Inflight(#[from] InflightError),
    /// Errors related to merkle trees and proofs.
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    /// An external reader failed.
    #[error(transparent)]
    Reader(#[from] ReaderError),
    /// An error occurred during ABI encoding/decoding.
    #[error(transparent)]
    AbiError(#[from] alloy::sol_types::Error),
    /// An observation could not be encoded.
    #[error(transparent)]
    ObservationEncoding(#[from] serde_json::Error),
    /// An internal error occurred.
    #[error(transparent)]
    InternalError(#[from] eyre::Error),
}

impl PluginError {
    /// Whether the error was produced by round cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
