//! A lane with four nodes tolerating one fault, driven round by round.

use alloy::primitives::{Address, B256, Bytes, U256, address};
use chrono::Utc;
use lane_relay::{
    commit::{CommitPlugin, CommitReaders},
    config::{LaneConfig, RelayConfig},
    execution::{ExecutionPlugin, ExecutionReaders},
    plugin::{AttributedObservation, ReportTimestamp, ReportingPlugin},
    readers::InMemoryLane,
    types::{
        CommitReport, ExecutionReport, Message, MessageExecutionState, TimestampedPrice,
        TokenAmount, TokenPriceUpdateEvent,
    },
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const SOURCE: u64 = 1;
pub const DEST: u64 = 2;
pub const NATIVE: Address = address!("00000000000000000000000000000000000000ee");
pub const FEE_TOKEN: Address = address!("00000000000000000000000000000000000000fe");
pub const SOURCE_TOKEN: Address = address!("0000000000000000000000000000000000000051");
pub const DEST_TOKEN: Address = address!("00000000000000000000000000000000000000d1");
pub const SENDER: Address = address!("00000000000000000000000000000000000000aa");

/// Number of nodes.
pub const NODES: usize = 4;
/// Number of faulty nodes tolerated.
pub const F: usize = 1;

/// Block at which transmitted reports land on the destination chain.
const TRANSMIT_BLOCK: u64 = 50;

pub fn e18(n: u64) -> U256 {
    U256::from(n) * U256::from(10u64.pow(18))
}

/// A message from [`SENDER`] paying ten fee tokens.
pub fn message(seq_nr: u64, nonce: u64) -> Message {
    Message {
        sourceChainSelector: SOURCE,
        sequenceNumber: seq_nr,
        sender: SENDER,
        nonce,
        gasLimit: U256::from(100_000),
        feeToken: FEE_TOKEN,
        feeTokenAmount: e18(10),
        ..Default::default()
    }
}

/// A message that also transfers `amount` of [`SOURCE_TOKEN`].
pub fn token_message(seq_nr: u64, nonce: u64, amount: u64) -> Message {
    Message {
        tokenAmounts: vec![TokenAmount { token: SOURCE_TOKEN, amount: U256::from(amount) }],
        ..message(seq_nr, nonce)
    }
}

pub struct Environment {
    pub lane: Arc<InMemoryLane>,
    pub commit: Vec<CommitPlugin>,
    pub execution: Vec<ExecutionPlugin>,
    epoch: u32,
}

impl Environment {
    pub async fn setup() -> Self {
        let config = RelayConfig::default().with_lane(LaneConfig {
            source_chain_selector: SOURCE,
            dest_chain_selector: DEST,
            source_native_token: NATIVE,
            dest_native_token: NATIVE,
            on_ramp: address!("00000000000000000000000000000000000000a1"),
        });
        let lane = Arc::new(InMemoryLane::new(config.lane.leaf_hasher()));
        {
            let now = Utc::now();
            let mut state = lane.state().await;
            state.next_seq_nr = 1;
            state.latest_block.number = 100;
            state.latest_block.timestamp = now;
            state.fee_tokens = vec![FEE_TOKEN];
            state.source_to_dest.insert(SOURCE_TOKEN, DEST_TOKEN);
            state.gas_price = U256::from(10_000_000_000u64);
            for (token, usd) in [(FEE_TOKEN, 1), (DEST_TOKEN, 1), (NATIVE, 2000)] {
                state.decimals.insert(token, 18);
                state.usd_prices.insert(token, e18(usd));
                state
                    .registry_prices
                    .insert(token, TimestampedPrice { value: e18(usd), timestamp: now });
            }
        }

        let commit = (0..NODES)
            .map(|_| CommitPlugin::new(&config, F, CommitReaders::from_lane(lane.clone())))
            .collect();
        let execution = (0..NODES)
            .map(|_| {
                let readers = ExecutionReaders::from_lane(lane.clone())
                    .with_token_data_provider(SOURCE_TOKEN, lane.clone());
                ExecutionPlugin::new(&config, F, readers)
            })
            .collect();

        Self { lane, commit, execution, epoch: 0 }
    }

    /// Emits `messages` on the source chain.
    pub async fn send(&self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.lane.send(message, Utc::now()).await;
        }
    }

    pub async fn bless(&self, root: B256) {
        self.lane.state().await.blessed.insert(root);
    }

    fn next_timestamp(&mut self) -> ReportTimestamp {
        self.epoch += 1;
        ReportTimestamp::new(self.epoch, 0)
    }

    /// Runs one commit round and lands the transmitted report on the destination chain.
    pub async fn commit_round(&mut self) -> eyre::Result<Option<CommitReport>> {
        let timestamp = self.next_timestamp();
        let Some(encoded) = run_round(&self.commit, timestamp).await? else { return Ok(None) };
        let report = CommitReport::decode(&encoded)?;

        let now = Utc::now();
        let mut state = self.lane.state().await;
        for update in &report.priceUpdates.gasPriceUpdates {
            let price = TimestampedPrice { value: update.usdPerUnitGas, timestamp: now };
            state.gas_price_updates.push((update.destChainSelector, price));
        }
        for update in &report.priceUpdates.tokenPriceUpdates {
            let price = TimestampedPrice { value: update.usdPerToken, timestamp: now };
            state
                .token_price_updates
                .push(TokenPriceUpdateEvent { token: update.sourceToken, price });
        }
        if !report.priceUpdates.is_empty() {
            state.latest_price_epoch_and_round = timestamp.epoch_and_round();
        }
        drop(state);
        self.lane.accept_commit_report(report.clone(), now, TRANSMIT_BLOCK).await;

        Ok(Some(report))
    }

    /// Runs one execution round and executes the transmitted messages successfully.
    pub async fn execution_round(&mut self) -> eyre::Result<Option<ExecutionReport>> {
        let timestamp = self.next_timestamp();
        let Some(encoded) = run_round(&self.execution, timestamp).await? else { return Ok(None) };
        let report = ExecutionReport::decode(&encoded)?;

        for message in &report.messages {
            self.lane
                .execute(message.sequenceNumber, MessageExecutionState::Success, TRANSMIT_BLOCK)
                .await;
            self.lane.state().await.sender_nonces.insert(message.sender, message.nonce);
        }

        Ok(Some(report))
    }
}

/// Collects an observation from every node, reduces them on the first node and returns the
/// report once every node accepted it and the first node would transmit it.
async fn run_round<P: ReportingPlugin>(
    nodes: &[P],
    timestamp: ReportTimestamp,
) -> eyre::Result<Option<Bytes>> {
    let cancel = CancellationToken::new();
    let query = nodes[0].query(timestamp).await?;

    let mut observations = Vec::new();
    for (index, node) in nodes.iter().enumerate() {
        match node.observation(&cancel, timestamp, &query).await {
            Ok(observation) => {
                observations.push(AttributedObservation::new(observation, index as u8))
            }
            Err(err) => tracing::warn!(node = index, %err, "Observation failed"),
        }
    }

    let Some(report) = nodes[0].report(&cancel, timestamp, &query, &observations).await? else {
        return Ok(None);
    };
    for node in nodes {
        if !node.should_accept_finalized_report(timestamp, &report).await? {
            return Ok(None);
        }
    }
    if !nodes[0].should_transmit_accepted_report(timestamp, &report).await? {
        return Ok(None);
    }

    Ok(Some(report))
}
