//! In-memory lane. For testing only.

use super::{
    CommitStoreReader, DestinationStateReader, GasPriceEstimator, PriceGetter,
    PriceRegistryReader, RateLimiterReader, ReaderError, Result, SourceMessageReader,
    TokenDataProvider,
};
use crate::{
    merkle::LeafHasher,
    types::{
        BlockMeta, CommitReport, CommitReportWithMeta, ExecutionReport, ExecutionStateChange,
        Message, MessageExecutionState, SendRequest, TimestampedPrice, TokenBucket,
        TokenPriceUpdateEvent,
    },
};
use alloy::primitives::{
    Address, B256, Bytes, U256,
    map::{HashMap, HashSet},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, time::Duration};
use tokio::sync::{RwLock, RwLockWriteGuard};

/// Mutable state of an [`InMemoryLane`].
#[derive(Debug, Default)]
pub struct LaneState {
    /// Send requests by sequence number.
    pub send_requests: BTreeMap<u64, SendRequest>,
    /// Highest finalized sequence number on the source chain, everything when `None`.
    pub finalized_seq_nr: Option<u64>,
    /// Latest destination block.
    pub latest_block: BlockMeta,
    /// Execution state changes by sequence number.
    pub state_changes: BTreeMap<u64, ExecutionStateChange>,
    /// Last executed nonce per sender.
    pub sender_nonces: HashMap<Address, u64>,
    /// Source to destination token mapping.
    pub source_to_dest: HashMap<Address, Address>,
    /// Accepted commit reports, ascending by interval.
    pub commit_reports: Vec<CommitReportWithMeta>,
    /// Blessed roots.
    pub blessed: HashSet<B256>,
    /// Whether the commit store is down.
    pub down: bool,
    /// Expected next sequence number of the commit store.
    pub next_seq_nr: u64,
    /// Epoch and round of the last price update of the commit store.
    pub latest_price_epoch_and_round: u64,
    /// Current price registry prices.
    pub registry_prices: HashMap<Address, TimestampedPrice>,
    /// Price registry fee tokens.
    pub fee_tokens: Vec<Address>,
    /// Token decimals.
    pub decimals: HashMap<Address, u8>,
    /// Gas price update events by chain selector.
    pub gas_price_updates: Vec<(u64, TimestampedPrice)>,
    /// Token price update events.
    pub token_price_updates: Vec<TokenPriceUpdateEvent>,
    /// Off-chain USD prices.
    pub usd_prices: HashMap<Address, U256>,
    /// Aggregate rate limiter bucket.
    pub aggregate_bucket: TokenBucket,
    /// Token pool buckets by destination token.
    pub pool_buckets: HashMap<Address, TokenBucket>,
    /// Token data by sequence number and token index. Missing entries read as empty.
    pub token_data: HashMap<(u64, usize), Bytes>,
    /// Sequence numbers whose token data is not ready.
    pub token_data_not_ready: HashSet<u64>,
    /// Latency of every token data read.
    pub token_data_delay: Duration,
    /// Gas price in native wei.
    pub gas_price: U256,
}

/// Every reader of a lane backed by memory. Used for testing
#[derive(Debug)]
pub struct InMemoryLane {
    hasher: LeafHasher,
    state: RwLock<LaneState>,
}

impl InMemoryLane {
    /// Creates an empty lane whose messages are hashed with `hasher`.
    pub fn new(hasher: LeafHasher) -> Self {
        Self { hasher, state: Default::default() }
    }

    /// The leaf hasher of the lane.
    pub fn hasher(&self) -> &LeafHasher {
        &self.hasher
    }

    /// Exclusive access to the lane state.
    pub async fn state(&self) -> RwLockWriteGuard<'_, LaneState> {
        self.state.write().await
    }

    /// Emits a message on the source chain, filling in its id. Returns the stored message.
    pub async fn send(&self, mut message: Message, block_timestamp: DateTime<Utc>) -> Message {
        message.messageId = self.hasher.hash(&message);
        let mut state = self.state.write().await;
        let block_number = state.send_requests.len() as u64 + 1;
        state.send_requests.insert(
            message.sequenceNumber,
            SendRequest { message: message.clone(), block_timestamp, block_number },
        );
        message
    }

    /// Accepts a commit report on the destination chain and advances the expected next
    /// sequence number past its interval.
    pub async fn accept_commit_report(
        &self,
        report: CommitReport,
        block_timestamp: DateTime<Utc>,
        block_number: u64,
    ) {
        let mut state = self.state.write().await;
        if report.has_root() {
            state.next_seq_nr = state.next_seq_nr.max(report.interval.max + 1);
        }
        state.commit_reports.push(CommitReportWithMeta { report, block_timestamp, block_number });
        state.commit_reports.sort_by_key(|r| r.report.interval.min);
    }

    /// Records an execution state change.
    pub async fn execute(&self, seq_nr: u64, state: MessageExecutionState, block_number: u64) {
        self.state.write().await.state_changes.insert(
            seq_nr,
            ExecutionStateChange { sequence_number: seq_nr, state, block_number },
        );
    }
}

fn confirmed(block_number: u64, confirmations: u64, latest: u64) -> bool {
    block_number.saturating_add(confirmations) <= latest
}

#[async_trait]
impl SourceMessageReader for InMemoryLane {
    async fn send_requests_between_seq_nums(
        &self,
        min: u64,
        max: u64,
        finalized: bool,
    ) -> Result<Vec<SendRequest>> {
        let state = self.state.read().await;
        let max = match state.finalized_seq_nr {
            Some(finalized_seq_nr) if finalized => max.min(finalized_seq_nr),
            _ => max,
        };
        if max < min {
            return Ok(Vec::new());
        }
        Ok(state.send_requests.range(min..=max).map(|(_, r)| r.clone()).collect())
    }
}

#[async_trait]
impl DestinationStateReader for InMemoryLane {
    async fn latest_block(&self) -> Result<BlockMeta> {
        Ok(self.state.read().await.latest_block)
    }

    async fn execution_state_changes_between_seq_nums(
        &self,
        min: u64,
        max: u64,
        confirmations: u64,
    ) -> Result<Vec<ExecutionStateChange>> {
        let state = self.state.read().await;
        if max < min {
            return Ok(Vec::new());
        }
        Ok(state
            .state_changes
            .range(min..=max)
            .map(|(_, change)| *change)
            .filter(|change| {
                confirmed(change.block_number, confirmations, state.latest_block.number)
            })
            .collect())
    }

    async fn execution_state(&self, seq_nr: u64) -> Result<MessageExecutionState> {
        Ok(self
            .state
            .read()
            .await
            .state_changes
            .get(&seq_nr)
            .map(|change| change.state)
            .unwrap_or_default())
    }

    async fn sender_nonce(&self, sender: Address) -> Result<u64> {
        Ok(self.state.read().await.sender_nonces.get(&sender).copied().unwrap_or_default())
    }

    async fn source_to_dest_tokens(&self) -> Result<HashMap<Address, Address>> {
        Ok(self.state.read().await.source_to_dest.clone())
    }

    async fn accepted_commit_reports_gte_timestamp(
        &self,
        timestamp: DateTime<Utc>,
        confirmations: u64,
    ) -> Result<Vec<CommitReportWithMeta>> {
        let state = self.state.read().await;
        Ok(state
            .commit_reports
            .iter()
            .filter(|r| r.block_timestamp >= timestamp)
            .filter(|r| confirmed(r.block_number, confirmations, state.latest_block.number))
            .cloned()
            .collect())
    }

    async fn accepted_commit_reports_gte_seq_num(
        &self,
        seq_nr: u64,
        confirmations: u64,
    ) -> Result<Vec<CommitReportWithMeta>> {
        let state = self.state.read().await;
        Ok(state
            .commit_reports
            .iter()
            .filter(|r| r.report.has_root() && r.report.interval.max >= seq_nr)
            .filter(|r| confirmed(r.block_number, confirmations, state.latest_block.number))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommitStoreReader for InMemoryLane {
    async fn is_down(&self) -> Result<bool> {
        Ok(self.state.read().await.down)
    }

    async fn is_blessed(&self, root: B256) -> Result<bool> {
        Ok(self.state.read().await.blessed.contains(&root))
    }

    async fn expected_next_sequence_number(&self) -> Result<u64> {
        Ok(self.state.read().await.next_seq_nr)
    }

    async fn latest_price_epoch_and_round(&self) -> Result<u64> {
        Ok(self.state.read().await.latest_price_epoch_and_round)
    }

    async fn verify_execution_report(&self, report: &ExecutionReport) -> Result<bool> {
        let Ok(root) = self.hasher.execution_report_root(report) else { return Ok(false) };

        let state = self.state.read().await;
        Ok(state.blessed.contains(&root)
            && state.commit_reports.iter().any(|r| r.report.merkleRoot == root))
    }
}

#[async_trait]
impl PriceRegistryReader for InMemoryLane {
    async fn token_prices(&self, tokens: &[Address]) -> Result<Vec<TimestampedPrice>> {
        let state = self.state.read().await;
        tokens
            .iter()
            .map(|token| {
                state
                    .registry_prices
                    .get(token)
                    .copied()
                    .ok_or_else(|| ReaderError::NotFound(format!("price of {token}")))
            })
            .collect()
    }

    async fn fee_tokens(&self) -> Result<Vec<Address>> {
        Ok(self.state.read().await.fee_tokens.clone())
    }

    async fn token_decimals(&self, tokens: &[Address]) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        tokens
            .iter()
            .map(|token| {
                state
                    .decimals
                    .get(token)
                    .copied()
                    .ok_or_else(|| ReaderError::NotFound(format!("decimals of {token}")))
            })
            .collect()
    }

    async fn gas_price_updates_created_after(
        &self,
        chain_selector: u64,
        after: DateTime<Utc>,
    ) -> Result<Vec<TimestampedPrice>> {
        Ok(self
            .state
            .read()
            .await
            .gas_price_updates
            .iter()
            .filter(|(chain, price)| *chain == chain_selector && price.timestamp > after)
            .map(|(_, price)| *price)
            .collect())
    }

    async fn token_price_updates_created_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<TokenPriceUpdateEvent>> {
        Ok(self
            .state
            .read()
            .await
            .token_price_updates
            .iter()
            .filter(|update| update.price.timestamp > after)
            .copied()
            .collect())
    }
}

#[async_trait]
impl PriceGetter for InMemoryLane {
    async fn token_prices_usd(&self, tokens: &[Address]) -> Result<HashMap<Address, U256>> {
        let state = self.state.read().await;
        Ok(tokens
            .iter()
            .filter_map(|token| state.usd_prices.get(token).map(|price| (*token, *price)))
            .collect())
    }
}

#[async_trait]
impl RateLimiterReader for InMemoryLane {
    async fn aggregate_bucket(&self) -> Result<TokenBucket> {
        Ok(self.state.read().await.aggregate_bucket.clone())
    }

    async fn pool_buckets(&self, tokens: &[Address]) -> Result<Vec<TokenBucket>> {
        let state = self.state.read().await;
        Ok(tokens
            .iter()
            .map(|token| state.pool_buckets.get(token).cloned().unwrap_or_default())
            .collect())
    }
}

#[async_trait]
impl TokenDataProvider for InMemoryLane {
    async fn read_token_data(&self, message: &Message, token_index: usize) -> Result<Bytes> {
        let delay = self.state.read().await.token_data_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.read().await;
        if state.token_data_not_ready.contains(&message.sequenceNumber) {
            return Err(ReaderError::TokenDataNotReady);
        }
        Ok(state
            .token_data
            .get(&(message.sequenceNumber, token_index))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl GasPriceEstimator for InMemoryLane {
    async fn gas_price(&self) -> Result<U256> {
        Ok(self.state.read().await.gas_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Interval;
    use alloy::primitives::address;

    #[tokio::test]
    async fn reads_finalized_messages() {
        let lane = InMemoryLane::new(LeafHasher::new(1, 2, Address::ZERO));
        let now = Utc::now();
        for seq_nr in 1..=5 {
            lane.send(Message { sequenceNumber: seq_nr, ..Default::default() }, now).await;
        }
        lane.state().await.finalized_seq_nr = Some(3);

        let finalized = lane.send_requests_between_seq_nums(2, 10, true).await.unwrap();
        assert_eq!(finalized.iter().map(|r| r.message.sequenceNumber).collect::<Vec<_>>(), [2, 3]);
        assert_eq!(lane.send_requests_between_seq_nums(2, 10, false).await.unwrap().len(), 4);
        assert_ne!(finalized[0].message.messageId, B256::ZERO);
    }

    #[tokio::test]
    async fn accepts_commit_reports() {
        let lane = InMemoryLane::new(LeafHasher::new(1, 2, Address::ZERO));
        let report = CommitReport {
            interval: Interval::new(1, 4),
            merkleRoot: B256::with_last_byte(1),
            ..Default::default()
        };
        lane.accept_commit_report(report, Utc::now(), 1).await;
        lane.state().await.latest_block.number = 3;

        assert_eq!(lane.expected_next_sequence_number().await.unwrap(), 5);
        assert_eq!(lane.accepted_commit_reports_gte_seq_num(4, 2).await.unwrap().len(), 1);
        assert!(lane.accepted_commit_reports_gte_seq_num(4, 3).await.unwrap().is_empty());
        assert!(lane.accepted_commit_reports_gte_seq_num(5, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_prices() {
        let lane = InMemoryLane::new(LeafHasher::new(1, 2, Address::ZERO));
        let token = address!("00000000000000000000000000000000000000aa");
        assert!(matches!(lane.token_prices(&[token]).await, Err(ReaderError::NotFound(_))));
        assert!(lane.token_prices_usd(&[token]).await.unwrap().is_empty());
    }
}
