//! Commit and execution reports.
//!
//! Reports are ABI encoded, which makes the encoding deterministic: the same logical report
//! always produces the same bytes.

use super::Message;
use alloy::{
    primitives::{Address, B256, Bytes, U256},
    sol,
    sol_types::SolValue,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

sol! {
    /// An inclusive range of sequence numbers. `(0, 0)` denotes "no messages".
    #[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct Interval {
        uint64 min;
        uint64 max;
    }

    /// USD price of a destination token, per 1e18 of its smallest denomination.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct TokenPriceUpdate {
        address sourceToken;
        uint256 usdPerToken;
    }

    /// USD price of a unit of gas on the chain identified by `destChainSelector`.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct GasPriceUpdate {
        uint64 destChainSelector;
        uint256 usdPerUnitGas;
    }

    /// Price updates carried by a commit report.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct PriceUpdates {
        TokenPriceUpdate[] tokenPriceUpdates;
        GasPriceUpdate[] gasPriceUpdates;
    }

    /// A committed interval of messages, its merkle root, and optional price updates.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct CommitReport {
        PriceUpdates priceUpdates;
        Interval interval;
        bytes32 merkleRoot;
    }

    /// A batch of messages from a single commit report, with the proof of their inclusion.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct ExecutionReport {
        Message[] messages;
        bytes[][] offchainTokenData;
        bytes32[] proofs;
        uint256 proofFlagBits;
    }
}

impl Interval {
    /// Creates a new [`Interval`].
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    /// Whether this is the "no messages" interval.
    pub fn is_zero(&self) -> bool {
        self.min == 0 && self.max == 0
    }

    /// Number of sequence numbers covered.
    pub fn num_messages(&self) -> u64 {
        if self.is_zero() || self.max < self.min { 0 } else { self.max - self.min + 1 }
    }

    /// Whether `seq_nr` lies within the interval.
    pub fn contains(&self, seq_nr: u64) -> bool {
        !self.is_zero() && self.min <= seq_nr && seq_nr <= self.max
    }
}

impl PriceUpdates {
    /// Whether there are no updates at all.
    pub fn is_empty(&self) -> bool {
        self.tokenPriceUpdates.is_empty() && self.gasPriceUpdates.is_empty()
    }
}

impl CommitReport {
    /// Whether the report commits a merkle root.
    pub fn has_root(&self) -> bool {
        self.merkleRoot != B256::ZERO
    }

    /// A report with neither a root nor price updates must never be put on chain.
    pub fn is_empty(&self) -> bool {
        !self.has_root() && self.priceUpdates.is_empty()
    }

    /// ABI-encodes the report.
    pub fn encode(&self) -> Bytes {
        self.abi_encode().into()
    }

    /// ABI-decodes a report.
    pub fn decode(data: &[u8]) -> Result<Self, alloy::sol_types::Error> {
        Self::abi_decode(data)
    }
}

impl ExecutionReport {
    /// The sequence numbers of the messages in the report.
    pub fn sequence_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.messages.iter().map(|msg| msg.sequenceNumber)
    }

    /// ABI-encodes the report.
    pub fn encode(&self) -> Bytes {
        self.abi_encode().into()
    }

    /// ABI-decodes a report.
    pub fn decode(data: &[u8]) -> Result<Self, alloy::sol_types::Error> {
        Self::abi_decode(data)
    }
}

/// A [`CommitReport`] accepted on the destination chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReportWithMeta {
    /// The report.
    pub report: CommitReport,
    /// Timestamp of the block that accepted it.
    pub block_timestamp: DateTime<Utc>,
    /// Number of the block that accepted it.
    pub block_number: u64,
}

/// A price recorded on chain, with the time it was set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedPrice {
    /// The price value.
    pub value: U256,
    /// When the price was set.
    pub timestamp: DateTime<Utc>,
}

/// A token price update event recorded on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPriceUpdateEvent {
    /// The token.
    pub token: Address,
    /// The price.
    pub price: TimestampedPrice,
}
