//! Merkle tree error types.

use thiserror::Error;

/// Errors that can occur during Merkle tree operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MerkleError {
    /// Cannot operate on an empty tree or an empty leaf set
    #[error("cannot operate on empty tree")]
    EmptyTree,
    /// More leaves than a tree may hold
    #[error("too many leaves: {count} (max {max})")]
    TooManyLeaves {
        /// The number of leaves supplied
        count: usize,
        /// The maximum supported number of leaves
        max: usize,
    },
    /// Leaf index out of bounds
    #[error("leaf index {index} out of bounds (tree has {tree_size} leaves)")]
    IndexOutOfBounds {
        /// The index that was requested
        index: usize,
        /// The actual size of the tree
        tree_size: usize,
    },
    /// Proof indices must be strictly ascending
    #[error("proof indices must be strictly ascending")]
    UnsortedIndices,
    /// The number of source flags does not match the number of hashes the proof needs
    #[error("proof has {flags} flags, expected {expected}")]
    FlagCountMismatch {
        /// Number of flags in the proof
        flags: usize,
        /// Number of flags required
        expected: usize,
    },
    /// Verification ran out of leaves, hashes or proof elements
    #[error("malformed proof")]
    MalformedProof,
    /// Verification did not consume every input
    #[error("proof did not consume all inputs")]
    UnconsumedInputs,
}
