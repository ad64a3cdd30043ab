//! Source messages and their destination-side execution state.

use alloy::{primitives::U256, sol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

sol! {
    /// A token transferred alongside a message, denominated in source token units.
    #[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct TokenAmount {
        address token;
        uint256 amount;
    }

    /// A message sent on the source chain.
    ///
    /// Messages are immutable once emitted. `messageId` is the leaf hash of the message and
    /// identifies it in commit trees.
    #[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Message {
        uint64 sourceChainSelector;
        uint64 sequenceNumber;
        address sender;
        address receiver;
        uint64 nonce;
        uint256 gasLimit;
        bool strict;
        bytes data;
        TokenAmount[] tokenAmounts;
        address feeToken;
        uint256 feeTokenAmount;
        bytes32 messageId;
    }
}

impl Message {
    /// Whether the message transfers any tokens.
    pub fn has_tokens(&self) -> bool {
        !self.tokenAmounts.is_empty()
    }
}

/// A [`Message`] together with the source block it was emitted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// The message.
    pub message: Message,
    /// Timestamp of the source block.
    pub block_timestamp: DateTime<Utc>,
    /// Number of the source block.
    pub block_number: u64,
}

/// A [`SendRequest`] annotated with its execution status on the destination chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequestWithMeta {
    /// The message.
    pub message: Message,
    /// Timestamp of the source block.
    pub block_timestamp: DateTime<Utc>,
    /// Whether an execution state change exists for the message.
    pub executed: bool,
    /// Whether that state change is deep enough to be considered final.
    pub finalized: bool,
}

/// Execution state of a message on the destination chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageExecutionState {
    /// Never attempted. This is also the state of sequence numbers not committed yet.
    #[default]
    Untouched,
    /// Execution started in the current transaction.
    InProgress,
    /// Executed successfully.
    Success,
    /// Executed and reverted.
    Failure,
}

impl MessageExecutionState {
    /// Whether the message reached a final state. Failed messages are not retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// An execution state change event on the destination chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionStateChange {
    /// The sequence number of the executed message.
    pub sequence_number: u64,
    /// The resulting state.
    pub state: MessageExecutionState,
    /// The destination block the change was included in.
    pub block_number: u64,
}

/// Header information of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockMeta {
    /// Block number.
    pub number: u64,
    /// Block timestamp.
    pub timestamp: DateTime<Utc>,
}

/// The state of a token bucket rate limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBucket {
    /// Tokens currently available.
    pub tokens: U256,
    /// Whether the limiter is enforced.
    pub is_enabled: bool,
}
