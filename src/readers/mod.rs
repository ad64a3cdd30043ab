//! Capability-scoped readers of external state.
//!
//! Each trait covers one contract or service, so a test double only implements what it is
//! exercised with. Readers own retries and caching: the engines call them at most once per
//! round for a given piece of state and never retry.

mod error;
pub use error::ReaderError;

mod memory;
pub use memory::InMemoryLane;

use crate::types::{
    BlockMeta, CommitReportWithMeta, ExecutionReport, ExecutionStateChange, Message,
    MessageExecutionState, SendRequest, TimestampedPrice, TokenBucket, TokenPriceUpdateEvent,
};
use alloy::primitives::{Address, B256, Bytes, U256, map::HashMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{fmt::Debug, sync::Arc};

/// Type alias for `Result<T, ReaderError>`
pub type Result<T> = core::result::Result<T, ReaderError>;

/// Reads messages sent on the source chain.
#[async_trait]
pub trait SourceMessageReader: Debug + Send + Sync {
    /// Send requests with sequence numbers in `[min, max]`, ascending.
    ///
    /// With `finalized`, only requests in finalized source blocks are returned.
    async fn send_requests_between_seq_nums(
        &self,
        min: u64,
        max: u64,
        finalized: bool,
    ) -> Result<Vec<SendRequest>>;
}

/// Reads the destination chain state of the lane.
#[async_trait]
pub trait DestinationStateReader: Debug + Send + Sync {
    /// The latest destination block.
    async fn latest_block(&self) -> Result<BlockMeta>;

    /// Execution state changes of sequence numbers in `[min, max]` that have at least
    /// `confirmations` confirmations.
    async fn execution_state_changes_between_seq_nums(
        &self,
        min: u64,
        max: u64,
        confirmations: u64,
    ) -> Result<Vec<ExecutionStateChange>>;

    /// Current execution state of a message.
    async fn execution_state(&self, seq_nr: u64) -> Result<MessageExecutionState>;

    /// Nonce of the last message of `sender` executed on the destination chain.
    async fn sender_nonce(&self, sender: Address) -> Result<u64>;

    /// Maps source tokens to the destination tokens they are released as.
    async fn source_to_dest_tokens(&self) -> Result<HashMap<Address, Address>>;

    /// Commit reports accepted in blocks created at or after `timestamp`, in no particular
    /// order.
    async fn accepted_commit_reports_gte_timestamp(
        &self,
        timestamp: DateTime<Utc>,
        confirmations: u64,
    ) -> Result<Vec<CommitReportWithMeta>>;

    /// Commit reports whose interval ends at or after `seq_nr`, ascending by interval.
    async fn accepted_commit_reports_gte_seq_num(
        &self,
        seq_nr: u64,
        confirmations: u64,
    ) -> Result<Vec<CommitReportWithMeta>>;
}

/// Reads the commit store on the destination chain.
#[async_trait]
pub trait CommitStoreReader: Debug + Send + Sync {
    /// Whether the commit store is paused or cursed.
    async fn is_down(&self) -> Result<bool>;

    /// Whether a committed root passed the risk management delay.
    async fn is_blessed(&self, root: B256) -> Result<bool>;

    /// The sequence number the next commit report has to start at.
    async fn expected_next_sequence_number(&self) -> Result<u64>;

    /// Epoch and round of the last report that updated prices.
    async fn latest_price_epoch_and_round(&self) -> Result<u64>;

    /// Whether the proof of an execution report verifies against a committed root.
    async fn verify_execution_report(&self, report: &ExecutionReport) -> Result<bool>;
}

/// Reads a price registry.
#[async_trait]
pub trait PriceRegistryReader: Debug + Send + Sync {
    /// Current prices of `tokens`, in request order.
    async fn token_prices(&self, tokens: &[Address]) -> Result<Vec<TimestampedPrice>>;

    /// Tokens fees can be paid in.
    async fn fee_tokens(&self) -> Result<Vec<Address>>;

    /// Decimals of `tokens`, in request order.
    async fn token_decimals(&self, tokens: &[Address]) -> Result<Vec<u8>>;

    /// Gas price updates for `chain_selector` created after `after`, oldest first.
    async fn gas_price_updates_created_after(
        &self,
        chain_selector: u64,
        after: DateTime<Utc>,
    ) -> Result<Vec<TimestampedPrice>>;

    /// Token price updates created after `after`, oldest first.
    async fn token_price_updates_created_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<TokenPriceUpdateEvent>>;
}

/// Off-chain USD price feed.
#[async_trait]
pub trait PriceGetter: Debug + Send + Sync {
    /// USD prices of one whole token, scaled by 1e18. Tokens without a price are omitted.
    async fn token_prices_usd(&self, tokens: &[Address]) -> Result<HashMap<Address, U256>>;
}

/// Reads the destination rate limiters.
#[async_trait]
pub trait RateLimiterReader: Debug + Send + Sync {
    /// The aggregate USD value bucket of the lane.
    async fn aggregate_bucket(&self) -> Result<TokenBucket>;

    /// Buckets of the pools of destination `tokens`, in request order.
    async fn pool_buckets(&self, tokens: &[Address]) -> Result<Vec<TokenBucket>>;
}

/// Provides off-chain data required to release a token, such as an attestation.
#[async_trait]
pub trait TokenDataProvider: Debug + Send + Sync {
    /// Data for the token at `token_index` of the message.
    ///
    /// Returns [`ReaderError::TokenDataNotReady`] while the data is being produced.
    async fn read_token_data(&self, message: &Message, token_index: usize) -> Result<Bytes>;
}

/// Estimates the gas price of a chain.
#[async_trait]
pub trait GasPriceEstimator: Debug + Send + Sync {
    /// Gas price in native wei.
    async fn gas_price(&self) -> Result<U256>;
}

/// Token data providers keyed by source token.
pub type TokenDataProviders = HashMap<Address, Arc<dyn TokenDataProvider>>;
