//! Inflight caches.
//!
//! Reports this node accepted but that are not final on the destination chain yet. They let
//! consecutive rounds pipeline ahead of on-chain confirmation without proposing the same
//! messages twice. Entries are swept by `expire`, never checked on access.

mod commit;
pub use commit::{CommitInflight, InflightPriceUpdate};

mod execution;
pub use execution::{ExecutionInflight, InflightExecutionReport};
