//! Batch selection.
//!
//! Picks the messages of one commit report that can be executed together. Selection is a
//! single forward pass in sequence number order: every message is either appended or
//! skipped for good, and the remaining budgets are threaded through the pass.

use crate::{
    config::ExecutionConfig,
    constants::{
        CALLDATA_GAS_PER_BYTE, CONSTANT_MESSAGE_PART_BYTES, EVM_ADDRESS_LENGTH_BYTES,
        EVM_WORD_BYTES, EXECUTION_STATE_PROCESSING_OVERHEAD_GAS, PER_TOKEN_OVERHEAD_GAS,
        RATE_LIMITER_OVERHEAD_GAS,
    },
    inflight::InflightExecutionReport,
    metrics::record_skipped_message,
    plugin::cancellable,
    prices, time,
    readers::{DestinationStateReader, ReaderError, TokenDataProviders},
    types::{CommitReportWithMeta, Message, ObservedMessage, SendRequestWithMeta, TokenAmount},
};
use alloy::primitives::{
    Address, Bytes, U256,
    map::{HashMap, HashSet},
};
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Why batch selection passed over a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    /// The message has an execution state on chain.
    AlreadyExecuted,
    /// The message is part of an inflight batch.
    AlreadyInflight,
    /// The on-chain nonce of the sender could not be read.
    NonceUnavailable,
    /// The message nonce is not the next one of its sender.
    InvalidNonce,
    /// A token pool does not have enough capacity left.
    PoolRateLimit,
    /// The aggregate rate limiter does not have enough capacity left.
    AggregateRateLimit,
    /// Token data of an earlier message could not be read.
    TokenDataSkipped,
    /// Token data of the message could not be read in time.
    TokenDataUnavailable,
    /// The destination native token has no price.
    MissingNativePrice,
    /// The fee token has no price.
    MissingFeeTokenPrice,
    /// The batch does not have enough data length left.
    DataLength,
    /// The boosted fee does not cover the execution cost.
    InsufficientFee,
    /// The message gas does not fit in 64 bits.
    GasOverflow,
    /// The batch does not have enough gas left.
    InsufficientGas,
}

/// Number of leading reports whose messages fit in `messages_limit`.
///
/// At least one report is selected from a non-empty slice, however large its interval, so
/// that every report is eventually considered.
pub fn select_reports_to_fill_batch(
    reports: &[CommitReportWithMeta],
    messages_limit: u64,
) -> usize {
    let mut messages = 0u64;
    let mut selected = 0;
    for report in reports {
        messages = messages.saturating_add(report.report.interval.num_messages());
        if messages > messages_limit {
            break;
        }
        selected += 1;
    }
    selected.max(reports.len().min(1))
}

/// Gas spent on top of a message gas limit when it is executed in a batch of `num_msgs`.
///
/// Covers calldata for the message and its share of the merkle proof, the rate limiter, token
/// transfers and the execution state write.
pub fn max_gas_overhead(num_msgs: usize, data_len: usize, num_tokens: usize) -> u64 {
    let num_tokens = num_tokens as u64;
    let message_bytes = CONSTANT_MESSAGE_PART_BYTES
        + (EVM_ADDRESS_LENGTH_BYTES + EVM_WORD_BYTES) * num_tokens
        + data_len as u64;
    let proof_depth = match num_msgs {
        0 | 1 => 0,
        n => u64::from(usize::BITS - (n - 1).leading_zeros()),
    };
    let merkle_proof_bytes = (proof_depth + 2) * EVM_WORD_BYTES;

    (message_bytes + merkle_proof_bytes) * CALLDATA_GAS_PER_BYTE
        + RATE_LIMITER_OVERHEAD_GAS
        + PER_TOKEN_OVERHEAD_GAS * num_tokens
        + EXECUTION_STATE_PROCESSING_OVERHEAD_GAS
}

/// Gas a message may use including its overhead, `None` on overflow.
pub fn calculate_message_max_gas(
    gas_limit: U256,
    num_msgs: usize,
    data_len: usize,
    num_tokens: usize,
) -> Option<u64> {
    u64::try_from(gas_limit).ok()?.checked_add(max_gas_overhead(num_msgs, data_len, num_tokens))
}

/// USD value of token amounts, priced in destination tokens. Unpriced tokens count as zero.
pub fn aggregate_token_value(
    dest_token_prices: &HashMap<Address, U256>,
    source_to_dest: &HashMap<Address, Address>,
    amounts: &[TokenAmount],
) -> U256 {
    amounts
        .iter()
        .filter_map(|amount| {
            let price = dest_token_prices.get(source_to_dest.get(&amount.token)?)?;
            Some(prices::token_value_usd(amount.amount, *price))
        })
        .fold(U256::ZERO, U256::saturating_add)
}

/// Whether `value` fits in what is left of `limit` once `inflight_value` is reserved.
pub fn has_enough_tokens(limit: U256, value: U256, inflight_value: U256) -> bool {
    limit.checked_sub(inflight_value).is_some_and(|left| left >= value)
}

/// Checks the fee before the remaining data-length budget.
fn fee_or_data_len_shortfall(
    available_fee: U256,
    exec_cost: U256,
    data_len: usize,
    available_data_len: usize,
) -> Option<SkipReason> {
    if available_fee < exec_cost {
        Some(SkipReason::InsufficientFee)
    } else if data_len > available_data_len {
        Some(SkipReason::DataLength)
    } else {
        None
    }
}

/// Whether every token amount fits in its destination pool, once inflight amounts are
/// reserved. Tokens without a limited pool always fit.
pub fn is_rate_limit_enough_for_token_pool(
    pool_limits: &HashMap<Address, U256>,
    amounts: &[TokenAmount],
    inflight_amounts: &HashMap<Address, U256>,
    source_to_dest: &HashMap<Address, Address>,
) -> bool {
    let mut limits = pool_limits.clone();
    for (source_token, amount) in inflight_amounts {
        if let Some(limit) =
            source_to_dest.get(source_token).and_then(|dest| limits.get_mut(dest))
        {
            *limit = limit.saturating_sub(*amount);
        }
    }

    amounts.iter().all(|amount| {
        let Some(dest_token) = source_to_dest.get(&amount.token) else {
            warn!(token = %amount.token, "No destination token for source token");
            return true;
        };
        limits.get(dest_token).is_none_or(|limit| *limit >= amount.amount)
    })
}

/// What the inflight execution batches reserve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InflightAggregates {
    /// Sequence numbers of inflight messages.
    pub seq_nrs: HashSet<u64>,
    /// USD value of inflight token transfers.
    pub value: U256,
    /// Highest inflight nonce of each sender.
    pub max_sender_nonces: HashMap<Address, u64>,
    /// Inflight amounts per source token.
    pub token_amounts: HashMap<Address, U256>,
}

impl InflightAggregates {
    /// Aggregates inflight batches.
    pub fn new(
        inflight: &[InflightExecutionReport],
        dest_token_prices: &HashMap<Address, U256>,
        source_to_dest: &HashMap<Address, Address>,
    ) -> Self {
        let mut aggregates = Self::default();
        for message in inflight.iter().flat_map(|report| &report.messages) {
            aggregates.seq_nrs.insert(message.sequenceNumber);
            aggregates.value = aggregates.value.saturating_add(aggregate_token_value(
                dest_token_prices,
                source_to_dest,
                &message.tokenAmounts,
            ));
            aggregates
                .max_sender_nonces
                .entry(message.sender)
                .and_modify(|nonce| *nonce = (*nonce).max(message.nonce))
                .or_insert(message.nonce);
            for amount in &message.tokenAmounts {
                let total = aggregates.token_amounts.entry(amount.token).or_default();
                *total = total.saturating_add(amount.amount);
            }
        }
        aggregates
    }
}

/// Shared inputs of batch selection for one observation.
#[derive(Debug)]
pub struct BatchContext<'a> {
    /// Execution configuration.
    pub config: &'a ExecutionConfig,
    /// Reads sender nonces.
    pub dest_reader: &'a dyn DestinationStateReader,
    /// Token data providers by source token.
    pub token_data_providers: &'a TokenDataProviders,
    /// What inflight batches reserve.
    pub inflight: &'a InflightAggregates,
    /// Source to destination token mapping.
    pub source_to_dest: &'a HashMap<Address, Address>,
    /// USD prices of source fee tokens.
    pub source_token_prices: &'a HashMap<Address, U256>,
    /// USD prices of destination tokens.
    pub dest_token_prices: &'a HashMap<Address, U256>,
    /// Wrapped native token of the destination chain.
    pub dest_native_token: Address,
    /// Destination gas price in native wei.
    pub dest_gas_price: U256,
    /// Capacity of the aggregate rate limiter.
    pub aggregate_limit: U256,
    /// Capacity of enabled token pools, by destination token.
    pub pool_limits: &'a HashMap<Address, U256>,
    /// Time of the observation.
    pub now: DateTime<Utc>,
}

fn skip(message: &Message, reason: SkipReason) {
    debug!(
        seq_nr = message.sequenceNumber,
        message_id = %message.messageId,
        %reason,
        "Skipping message"
    );
    record_skipped_message(reason);
}

impl BatchContext<'_> {
    /// Selects the executable messages of one commit report.
    ///
    /// `requests` are the messages of the report, ascending by sequence number. Cancellation
    /// stops the pass and returns the batch selected so far.
    pub async fn build_batch(
        &self,
        cancel: &CancellationToken,
        requests: &[SendRequestWithMeta],
    ) -> Vec<(u64, ObservedMessage)> {
        let mut batch = Vec::new();
        let mut available_gas = self.config.batch_gas_limit;
        let mut available_data_len = self.config.max_data_len_per_batch;
        let mut aggregate_limit = self.aggregate_limit;
        let mut pool_limits = self.pool_limits.clone();
        let mut last_nonces: HashMap<Address, u64> = HashMap::default();
        let mut token_data_budget = self.config.token_data_wait_per_batch;
        let mut skip_token_messages = false;

        for request in requests {
            if cancel.is_cancelled() {
                warn!(selected = batch.len(), "Batch selection cancelled");
                break;
            }
            let message = &request.message;

            if request.executed {
                skip(message, SkipReason::AlreadyExecuted);
                continue;
            }
            if self.inflight.seq_nrs.contains(&message.sequenceNumber) {
                skip(message, SkipReason::AlreadyInflight);
                continue;
            }

            let last_nonce = match last_nonces.get(&message.sender) {
                Some(nonce) => *nonce,
                None => {
                    let nonce = match self.inflight.max_sender_nonces.get(&message.sender) {
                        Some(inflight_nonce) => *inflight_nonce,
                        None => {
                            match cancellable(cancel, self.dest_reader.sender_nonce(message.sender))
                                .await
                            {
                                Ok(nonce) => nonce,
                                Err(err) if err.is_cancelled() => break,
                                Err(err) => {
                                    warn!(sender = %message.sender, %err, "Failed to read sender nonce");
                                    skip(message, SkipReason::NonceUnavailable);
                                    continue;
                                }
                            }
                        }
                    };
                    last_nonces.insert(message.sender, nonce);
                    nonce
                }
            };
            if last_nonce.checked_add(1) != Some(message.nonce) {
                trace!(nonce = message.nonce, last_nonce, "Nonce mismatch");
                skip(message, SkipReason::InvalidNonce);
                continue;
            }

            if !is_rate_limit_enough_for_token_pool(
                &pool_limits,
                &message.tokenAmounts,
                &self.inflight.token_amounts,
                self.source_to_dest,
            ) {
                skip(message, SkipReason::PoolRateLimit);
                continue;
            }

            let value = aggregate_token_value(
                self.dest_token_prices,
                self.source_to_dest,
                &message.tokenAmounts,
            );
            if !has_enough_tokens(aggregate_limit, value, self.inflight.value) {
                skip(message, SkipReason::AggregateRateLimit);
                continue;
            }

            let token_data = if message.has_tokens() {
                if skip_token_messages {
                    skip(message, SkipReason::TokenDataSkipped);
                    continue;
                }
                let started = Instant::now();
                let read = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    read = tokio::time::timeout(token_data_budget, self.read_token_data(message)) => read,
                };
                token_data_budget = token_data_budget.saturating_sub(started.elapsed());
                match read {
                    Ok(Ok(token_data)) => token_data,
                    Ok(Err(err)) => {
                        warn!(seq_nr = message.sequenceNumber, %err, "Failed to read token data");
                        skip_token_messages = true;
                        skip(message, SkipReason::TokenDataUnavailable);
                        continue;
                    }
                    Err(_) => {
                        warn!(seq_nr = message.sequenceNumber, "Timed out reading token data");
                        skip_token_messages = true;
                        skip(message, SkipReason::TokenDataUnavailable);
                        continue;
                    }
                }
            } else {
                Vec::new()
            };

            let Some(dest_native_price) = self.dest_token_prices.get(&self.dest_native_token)
            else {
                skip(message, SkipReason::MissingNativePrice);
                continue;
            };
            let Some(fee_token_price) = self.source_token_prices.get(&message.feeToken) else {
                skip(message, SkipReason::MissingFeeTokenPrice);
                continue;
            };

            let available_fee = prices::wait_boosted_fee(
                time::elapsed(request.block_timestamp, self.now),
                prices::token_value_usd(message.feeTokenAmount, *fee_token_price),
                self.config.relative_boost_per_wait_hour,
            );
            let exec_cost =
                prices::exec_cost_usd(message.gasLimit, self.dest_gas_price, *dest_native_price);
            if let Some(reason) = fee_or_data_len_shortfall(
                available_fee,
                exec_cost,
                message.data.len(),
                available_data_len,
            ) {
                trace!(%available_fee, %exec_cost, "Message does not fit the batch");
                skip(message, reason);
                continue;
            }

            let Some(max_gas) = calculate_message_max_gas(
                message.gasLimit,
                requests.len(),
                message.data.len(),
                message.tokenAmounts.len(),
            ) else {
                skip(message, SkipReason::GasOverflow);
                continue;
            };
            if available_gas < max_gas {
                skip(message, SkipReason::InsufficientGas);
                continue;
            }

            available_gas -= max_gas;
            available_data_len -= message.data.len();
            aggregate_limit = aggregate_limit.saturating_sub(value);
            for amount in &message.tokenAmounts {
                if let Some(limit) = self
                    .source_to_dest
                    .get(&amount.token)
                    .and_then(|dest| pool_limits.get_mut(dest))
                {
                    *limit = limit.saturating_sub(amount.amount);
                }
            }
            last_nonces.insert(message.sender, message.nonce);

            debug!(seq_nr = message.sequenceNumber, available_gas, "Adding message to batch");
            batch.push((message.sequenceNumber, ObservedMessage::new(token_data)));
        }

        batch
    }

    /// Reads the token data of every token amount of a message. Tokens without a provider
    /// get empty data.
    async fn read_token_data(&self, message: &Message) -> Result<Vec<Bytes>, ReaderError> {
        let mut token_data = Vec::with_capacity(message.tokenAmounts.len());
        for (index, amount) in message.tokenAmounts.iter().enumerate() {
            let data = match self.token_data_providers.get(&amount.token) {
                Some(provider) => provider.read_token_data(message, index).await?,
                None => Bytes::new(),
            };
            token_data.push(data);
        }
        Ok(token_data)
    }
}
