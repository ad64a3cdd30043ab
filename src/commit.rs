//! Commit engine.
//!
//! Each round the nodes agree on the next contiguous interval of finalized source messages,
//! commit it under a merkle root, and piggyback the token and gas price updates the
//! destination chain needs. A report may carry only price updates, in which case its root is
//! zero.

use crate::{
    config::{CommitConfig, LaneConfig, RelayConfig},
    constants::{MAX_COMMIT_REPORT_LENGTH, MAX_INFLIGHT_SEQ_NUM_GAP, ON_RAMP_MESSAGES_SCAN_LIMIT},
    consensus::{deviates, interval_consensus, longest_fitting_prefix, median, parse_observations},
    error::{CommitError, PluginError},
    inflight::CommitInflight,
    merkle::{LeafHasher, MerkleTree},
    metrics::CommitMetrics,
    plugin::{AttributedObservation, ReportTimestamp, ReportingPlugin, cancellable},
    prices::{denote_in_usd, usd_per_1e18_token_amount},
    readers::{
        CommitStoreReader, DestinationStateReader, GasPriceEstimator, PriceGetter,
        PriceRegistryReader, SourceMessageReader,
    },
    time,
    types::{
        CommitObservation, CommitReport, GasPriceUpdate, Interval, Observation, PriceUpdates,
        TimestampedPrice, TokenPriceUpdate,
    },
};
use alloy::primitives::{Address, B256, Bytes, U256, map::HashMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// External state read by the commit engine.
#[derive(Debug, Clone)]
pub struct CommitReaders {
    /// Messages sent on the source chain.
    pub source: Arc<dyn SourceMessageReader>,
    /// Destination chain state of the lane.
    pub dest: Arc<dyn DestinationStateReader>,
    /// The destination commit store.
    pub commit_store: Arc<dyn CommitStoreReader>,
    /// The destination price registry, which holds the trusted prices.
    pub dest_price_registry: Arc<dyn PriceRegistryReader>,
    /// Off-chain token prices.
    pub price_getter: Arc<dyn PriceGetter>,
    /// Source chain gas price.
    pub source_gas_estimator: Arc<dyn GasPriceEstimator>,
}

impl CommitReaders {
    /// Uses a single value for every reader.
    pub fn from_lane<L>(lane: Arc<L>) -> Self
    where
        L: SourceMessageReader
            + DestinationStateReader
            + CommitStoreReader
            + PriceRegistryReader
            + PriceGetter
            + GasPriceEstimator
            + 'static,
    {
        Self {
            source: lane.clone(),
            dest: lane.clone(),
            commit_store: lane.clone(),
            dest_price_registry: lane.clone(),
            price_getter: lane.clone(),
            source_gas_estimator: lane,
        }
    }
}

/// The commit reporting engine of a lane.
pub struct CommitPlugin {
    lane: LaneConfig,
    config: CommitConfig,
    /// Number of faulty nodes tolerated.
    f: usize,
    readers: CommitReaders,
    hasher: LeafHasher,
    inflight: CommitInflight,
    metrics: CommitMetrics,
}

impl fmt::Debug for CommitPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitPlugin")
            .field("lane", &self.lane)
            .field("config", &self.config)
            .field("f", &self.f)
            .field("inflight", &self.inflight)
            .finish_non_exhaustive()
    }
}

impl CommitPlugin {
    /// Creates the engine for the lane of `config`, tolerating `f` faulty nodes.
    pub fn new(config: &RelayConfig, f: usize, readers: CommitReaders) -> Self {
        let lane_label =
            format!("{}-{}", config.lane.source_chain_selector, config.lane.dest_chain_selector);
        Self {
            hasher: config.lane.leaf_hasher(),
            inflight: CommitInflight::new(
                config.commit.inflight_cache_expiry,
                config.commit.price_expiry_multiplier,
            ),
            metrics: CommitMetrics::new_with_labels(&[("lane", lane_label)]),
            lane: config.lane.clone(),
            config: config.commit.clone(),
            f,
            readers,
        }
    }

    /// Reports accepted by this node that are not on chain yet.
    pub fn inflight(&self) -> &CommitInflight {
        &self.inflight
    }

    /// Returns `(next inflight min, on-chain next)`.
    ///
    /// The next interval starts after the highest inflight sequence number, unless the commit
    /// store is already past it. If the inflight cache runs too far ahead of the commit store
    /// it is out of sync with the chain and gets reset.
    async fn next_min_seq_nr(&self) -> Result<(u64, u64), PluginError> {
        let on_chain = self.readers.commit_store.expected_next_sequence_number().await?;
        let max_inflight = self.inflight.max_inflight_seq_nr().await;

        if max_inflight > on_chain && max_inflight - on_chain > MAX_INFLIGHT_SEQ_NUM_GAP {
            warn!(max_inflight, on_chain, "Inflight commit reports ran ahead of the chain, resetting");
            self.inflight.reset().await;
            return Ok((on_chain, on_chain));
        }

        Ok((on_chain.max(max_inflight + 1), on_chain))
    }

    /// The interval of finalized messages not yet committed or in flight.
    async fn observe_interval(&self) -> Result<Interval, PluginError> {
        let (next_min, _) = self.next_min_seq_nr().await?;
        let requests = self
            .readers
            .source
            .send_requests_between_seq_nums(
                next_min,
                next_min.saturating_add(ON_RAMP_MESSAGES_SCAN_LIMIT),
                true,
            )
            .await?;

        let seq_nrs: Vec<u64> = requests.iter().map(|r| r.message.sequenceNumber).collect();
        let (Some(&first), Some(&last)) = (seq_nrs.first(), seq_nrs.last()) else {
            return Ok(Interval::default());
        };

        if first != next_min {
            warn!(expected = next_min, got = first, "Finalized messages do not start at the next sequence number");
        }
        ensure_contiguous(&seq_nrs)?;

        Ok(Interval::new(first, last))
    }

    /// Tokens priced on the destination chain: fee tokens and bridgeable tokens, sorted.
    async fn destination_tokens(&self) -> Result<Vec<Address>, PluginError> {
        let (fee_tokens, bridgeable) = tokio::try_join!(
            self.readers.dest_price_registry.fee_tokens(),
            self.readers.dest.source_to_dest_tokens()
        )?;
        let tokens: BTreeSet<Address> =
            fee_tokens.into_iter().chain(bridgeable.into_values()).collect();
        Ok(tokens.into_iter().collect())
    }

    /// USD prices of `dest_tokens` per 1e18 base units, and the USD price of source gas.
    async fn observe_prices(
        &self,
        dest_tokens: &[Address],
    ) -> Result<(BTreeMap<Address, Option<U256>>, U256), PluginError> {
        let native = self.lane.source_native_token;
        let mut query = dest_tokens.to_vec();
        query.push(native);
        query.sort_unstable();
        query.dedup();

        let usd_prices = self.readers.price_getter.token_prices_usd(&query).await?;
        if let Some(missing) = query.iter().find(|token| !usd_prices.contains_key(*token)) {
            return Err(CommitError::MissingTokenPrice(*missing).into());
        }

        let decimals = self.readers.dest_price_registry.token_decimals(dest_tokens).await?;
        if decimals.len() != dest_tokens.len() {
            return Err(CommitError::DecimalsMismatch {
                expected: dest_tokens.len(),
                got: decimals.len(),
            }
            .into());
        }

        let token_prices = dest_tokens
            .iter()
            .zip(decimals)
            .map(|(token, decimals)| {
                (*token, Some(usd_per_1e18_token_amount(usd_prices[token], decimals)))
            })
            .collect();

        let gas_price = self
            .readers
            .source_gas_estimator
            .gas_price()
            .await?
            .min(self.config.max_gas_price);
        let gas_price_usd = denote_in_usd(gas_price, usd_prices[&native]);

        Ok((token_prices, gas_price_usd))
    }

    /// The trusted source gas price.
    ///
    /// With `check_inflight`, the latest inflight update wins. Otherwise it is the latest
    /// update recorded on chain within the heartbeat.
    async fn latest_gas_price(
        &self,
        now: DateTime<Utc>,
        check_inflight: bool,
    ) -> Result<Option<TimestampedPrice>, PluginError> {
        if check_inflight && let Some(inflight) = self.inflight.latest_gas_price_update().await {
            return Ok(Some(inflight));
        }

        let updates = self
            .readers
            .dest_price_registry
            .gas_price_updates_created_after(
                self.lane.source_chain_selector,
                time::before(now, self.config.gas_price_heartbeat),
            )
            .await?;

        Ok(updates.into_iter().reduce(|latest, update| {
            if update.timestamp >= latest.timestamp { update } else { latest }
        }))
    }

    /// The trusted token prices: the latest on-chain update of each token within the
    /// heartbeat, overridden by newer inflight updates when `check_inflight` is set.
    async fn latest_token_prices(
        &self,
        now: DateTime<Utc>,
        check_inflight: bool,
    ) -> Result<HashMap<Address, TimestampedPrice>, PluginError> {
        let events = self
            .readers
            .dest_price_registry
            .token_price_updates_created_after(time::before(now, self.config.token_price_heartbeat))
            .await?;

        let mut latest: HashMap<Address, TimestampedPrice> = HashMap::default();
        for event in events {
            if latest.get(&event.token).is_none_or(|known| event.price.timestamp >= known.timestamp)
            {
                latest.insert(event.token, event.price);
            }
        }

        if check_inflight {
            for (token, inflight) in self.inflight.latest_token_price_updates().await {
                if latest.get(&token).is_none_or(|known| inflight.timestamp > known.timestamp) {
                    latest.insert(token, inflight);
                }
            }
        }

        Ok(latest)
    }

    /// Median prices that differ enough from the trusted ones, or whose trusted value is
    /// older than the heartbeat.
    fn calculate_price_updates(
        &self,
        observations: &[CommitObservation],
        latest_gas: Option<TimestampedPrice>,
        latest_tokens: &HashMap<Address, TimestampedPrice>,
        now: DateTime<Utc>,
    ) -> PriceUpdates {
        let mut token_observations: BTreeMap<Address, Vec<U256>> = BTreeMap::new();
        for obs in observations {
            for (token, price) in &obs.token_prices_usd {
                if let Some(price) = price {
                    token_observations.entry(*token).or_default().push(*price);
                }
            }
        }

        let mut token_updates = Vec::new();
        for (token, prices) in token_observations {
            if prices.len() <= self.f {
                continue;
            }
            let Some(price) = median(prices) else { continue };
            if needs_update(
                latest_tokens.get(&token),
                price,
                self.config.token_price_heartbeat,
                self.config.token_price_deviation_ppb,
                now,
            ) {
                token_updates.push(TokenPriceUpdate { sourceToken: token, usdPerToken: price });
            }
        }

        let gas_prices: Vec<U256> =
            observations.iter().filter_map(|obs| obs.source_gas_price_usd).collect();
        let mut gas_updates = Vec::new();
        if gas_prices.len() > self.f
            && let Some(gas_price) = median(gas_prices)
            && needs_update(
                latest_gas.as_ref(),
                gas_price,
                self.config.gas_price_heartbeat,
                self.config.gas_price_deviation_ppb,
                now,
            )
        {
            gas_updates.push(GasPriceUpdate {
                destChainSelector: self.lane.source_chain_selector,
                usdPerUnitGas: gas_price,
            });
        }

        PriceUpdates { tokenPriceUpdates: token_updates, gasPriceUpdates: gas_updates }
    }

    /// Commits `interval` under a merkle root of its messages. The zero interval yields a
    /// price-only report.
    async fn build_report(
        &self,
        interval: Interval,
        price_updates: PriceUpdates,
    ) -> Result<CommitReport, PluginError> {
        if interval.is_zero() {
            return Ok(CommitReport {
                priceUpdates: price_updates,
                interval,
                merkleRoot: B256::ZERO,
            });
        }

        let requests = self
            .readers
            .source
            .send_requests_between_seq_nums(interval.min, interval.max, true)
            .await?;
        if requests.len() as u64 != interval.num_messages() {
            return Err(CommitError::MessageCountMismatch {
                min: interval.min,
                max: interval.max,
                got: requests.len(),
            }
            .into());
        }
        for (expected, request) in (interval.min..).zip(&requests) {
            if request.message.sequenceNumber != expected {
                return Err(CommitError::SequenceGap {
                    expected,
                    got: request.message.sequenceNumber,
                }
                .into());
            }
        }

        let leaves: Vec<B256> = requests.iter().map(|r| self.hasher.hash(&r.message)).collect();
        let tree = MerkleTree::new(&leaves)?;

        Ok(CommitReport { priceUpdates: price_updates, interval, merkleRoot: tree.root() })
    }

    async fn is_stale(
        &self,
        report: &CommitReport,
        check_inflight: bool,
        timestamp: ReportTimestamp,
    ) -> bool {
        if report.has_root() {
            return self.is_stale_merkle_root(&report.interval, check_inflight).await;
        }

        let updates = &report.priceUpdates;
        if updates.is_empty() {
            return true;
        }
        if updates.gasPriceUpdates.len() > 1 {
            warn!(count = updates.gasPriceUpdates.len(), "Report has more than one gas price update");
            return true;
        }

        let now = Utc::now();
        let gas_stale = match updates.gasPriceUpdates.first() {
            None => true,
            Some(gas) => self.is_stale_gas_price(gas.usdPerUnitGas, check_inflight, now).await,
        };
        let tokens_stale = updates.tokenPriceUpdates.is_empty()
            || self.are_stale_token_prices(&updates.tokenPriceUpdates, check_inflight, now).await;
        if gas_stale && tokens_stale {
            return true;
        }

        match self.readers.commit_store.latest_price_epoch_and_round().await {
            Ok(latest) => latest >= timestamp.epoch_and_round(),
            Err(err) => {
                warn!(%err, "Failed to read the latest price epoch and round");
                true
            }
        }
    }

    async fn is_stale_merkle_root(&self, interval: &Interval, check_inflight: bool) -> bool {
        let (next_inflight_min, on_chain_next) = match self.next_min_seq_nr().await {
            Ok(next) => next,
            Err(err) => {
                warn!(%err, "Failed to read the next sequence number");
                return true;
            }
        };

        if check_inflight && next_inflight_min != interval.min {
            debug!(
                next_inflight_min,
                min = interval.min,
                "Report does not start at the next inflight sequence number"
            );
            return true;
        }
        if !check_inflight && on_chain_next > interval.min {
            debug!(on_chain_next, min = interval.min, "Report interval already committed");
            return true;
        }
        false
    }

    async fn is_stale_gas_price(
        &self,
        gas_price: U256,
        check_inflight: bool,
        now: DateTime<Utc>,
    ) -> bool {
        match self.latest_gas_price(now, check_inflight).await {
            Ok(Some(latest)) => {
                !deviates(gas_price, latest.value, self.config.gas_price_deviation_ppb)
            }
            Ok(None) => false,
            Err(err) => {
                warn!(%err, "Failed to read the latest gas price");
                true
            }
        }
    }

    /// Whether every token update matches a trusted price within the deviation.
    async fn are_stale_token_prices(
        &self,
        updates: &[TokenPriceUpdate],
        check_inflight: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let latest = match self.latest_token_prices(now, check_inflight).await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(%err, "Failed to read the latest token prices");
                return true;
            }
        };

        updates.iter().all(|update| {
            latest.get(&update.sourceToken).is_some_and(|known| {
                !deviates(update.usdPerToken, known.value, self.config.token_price_deviation_ppb)
            })
        })
    }
}

#[async_trait]
impl ReportingPlugin for CommitPlugin {
    async fn query(&self, _timestamp: ReportTimestamp) -> Result<Bytes, PluginError> {
        Ok(Bytes::new())
    }

    async fn observation(
        &self,
        cancel: &CancellationToken,
        timestamp: ReportTimestamp,
        _query: &Bytes,
    ) -> Result<Bytes, PluginError> {
        if cancellable(cancel, self.readers.commit_store.is_down()).await? {
            return Err(PluginError::CommitStoreDown);
        }
        self.inflight.expire(Utc::now()).await;

        let (interval, dest_tokens) = cancellable(cancel, async {
            tokio::try_join!(self.observe_interval(), self.destination_tokens())
        })
        .await?;
        let (token_prices_usd, gas_price_usd) =
            cancellable(cancel, self.observe_prices(&dest_tokens)).await?;

        self.metrics.observed_interval_size.record(interval.num_messages() as f64);
        debug!(
            epoch = timestamp.epoch,
            round = timestamp.round,
            min = interval.min,
            max = interval.max,
            tokens = token_prices_usd.len(),
            %gas_price_usd,
            "Observed commit state"
        );

        Ok(CommitObservation {
            interval,
            token_prices_usd,
            source_gas_price_usd: Some(gas_price_usd),
        }
        .encode()?)
    }

    async fn report(
        &self,
        cancel: &CancellationToken,
        timestamp: ReportTimestamp,
        _query: &Bytes,
        observations: &[AttributedObservation],
    ) -> Result<Option<Bytes>, PluginError> {
        let now = Utc::now();
        let dest_tokens = cancellable(cancel, self.destination_tokens()).await?;
        let observations = validate_observations(parse_observations(observations), &dest_tokens);
        if observations.len() <= self.f {
            debug!(valid = observations.len(), f = self.f, "Not enough valid commit observations");
            return Ok(None);
        }

        let intervals: Vec<Interval> =
            observations.iter().map(|obs| obs.interval.clone()).collect();
        let interval = interval_consensus(&intervals, self.f, self.config.max_interval_range)?
            .unwrap_or_default();

        let (latest_gas, latest_tokens) = cancellable(cancel, async {
            tokio::try_join!(self.latest_gas_price(now, true), self.latest_token_prices(now, true))
        })
        .await?;
        let price_updates =
            self.calculate_price_updates(&observations, latest_gas, &latest_tokens, now);

        if interval.is_zero() && price_updates.is_empty() {
            debug!(epoch = timestamp.epoch, round = timestamp.round, "Nothing to commit");
            return Ok(None);
        }

        let report =
            cap_report(cancellable(cancel, self.build_report(interval, price_updates)).await?);
        self.metrics.reported_interval_size.record(report.interval.num_messages() as f64);
        info!(
            epoch = timestamp.epoch,
            round = timestamp.round,
            min = report.interval.min,
            max = report.interval.max,
            root = %report.merkleRoot,
            token_updates = report.priceUpdates.tokenPriceUpdates.len(),
            gas_updates = report.priceUpdates.gasPriceUpdates.len(),
            "Built commit report"
        );

        Ok(Some(report.encode()))
    }

    async fn should_accept_finalized_report(
        &self,
        timestamp: ReportTimestamp,
        report: &Bytes,
    ) -> Result<bool, PluginError> {
        let report = CommitReport::decode(report)?;
        if report.is_empty() {
            debug!("Rejecting empty commit report");
            return Ok(false);
        }
        if self.is_stale(&report, true, timestamp).await {
            self.metrics.stale_reports.increment(1);
            debug!(min = report.interval.min, max = report.interval.max, "Rejecting stale commit report");
            return Ok(false);
        }

        let round_id = timestamp.epoch_and_round();
        self.inflight.add(report.clone(), round_id, Utc::now()).await?;

        if report.has_root() {
            self.metrics.last_reported_seq_nr.set(report.interval.max as f64);
        }
        self.metrics
            .token_price_updates
            .increment(report.priceUpdates.tokenPriceUpdates.len() as u64);
        self.metrics.gas_price_updates.increment(report.priceUpdates.gasPriceUpdates.len() as u64);
        self.metrics.inflight_reports.set(self.inflight.num_reports().await as f64);
        info!(
            round_id,
            min = report.interval.min,
            max = report.interval.max,
            root = %report.merkleRoot,
            "Accepted commit report"
        );

        Ok(true)
    }

    async fn should_transmit_accepted_report(
        &self,
        timestamp: ReportTimestamp,
        report: &Bytes,
    ) -> Result<bool, PluginError> {
        let report = CommitReport::decode(report)?;
        if self.is_stale(&report, false, timestamp).await {
            self.metrics.stale_reports.increment(1);
            debug!(min = report.interval.min, max = report.interval.max, "Not transmitting stale commit report");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Errors unless `seq_nrs` increase by exactly one.
fn ensure_contiguous(seq_nrs: &[u64]) -> Result<(), CommitError> {
    for pair in seq_nrs.windows(2) {
        let expected = pair[0].saturating_add(1);
        if pair[1] != expected {
            return Err(CommitError::SequenceGap { expected, got: pair[1] });
        }
    }
    Ok(())
}

/// Drops observations that are incomplete or price tokens other than `dest_tokens`.
///
/// `dest_tokens` must be sorted.
fn validate_observations(
    observations: Vec<CommitObservation>,
    dest_tokens: &[Address],
) -> Vec<CommitObservation> {
    observations.into_iter().filter(|obs| is_valid_observation(obs, dest_tokens)).collect()
}

fn is_valid_observation(obs: &CommitObservation, dest_tokens: &[Address]) -> bool {
    if obs.source_gas_price_usd.is_none() {
        warn!("Dropping commit observation without a gas price");
        return false;
    }
    if obs.token_prices_usd.len() != dest_tokens.len() {
        warn!(
            expected = dest_tokens.len(),
            got = obs.token_prices_usd.len(),
            "Dropping commit observation with a wrong number of token prices"
        );
        return false;
    }
    for (token, price) in &obs.token_prices_usd {
        if price.is_none() || dest_tokens.binary_search(token).is_err() {
            warn!(%token, "Dropping commit observation with an invalid token price");
            return false;
        }
    }
    true
}

/// Whether an observed `price` should replace the trusted one.
fn needs_update(
    trusted: Option<&TimestampedPrice>,
    price: U256,
    heartbeat: Duration,
    deviation_ppb: u64,
    now: DateTime<Utc>,
) -> bool {
    trusted.is_none_or(|trusted| {
        time::elapsed(trusted.timestamp, now) >= heartbeat
            || deviates(price, trusted.value, deviation_ppb)
    })
}

/// Drops trailing token price updates until the encoded report fits.
fn cap_report(mut report: CommitReport) -> CommitReport {
    let len = report.encode().len();
    if len <= MAX_COMMIT_REPORT_LENGTH {
        return report;
    }

    let updates = std::mem::take(&mut report.priceUpdates.tokenPriceUpdates);
    let keep = longest_fitting_prefix(updates.len(), |n| {
        let mut candidate = report.clone();
        candidate.priceUpdates.tokenPriceUpdates = updates[..n].to_vec();
        candidate.encode().len() <= MAX_COMMIT_REPORT_LENGTH
    });
    warn!(len, kept = keep, dropped = updates.len() - keep, "Commit report too large, dropping token price updates");

    report.priceUpdates.tokenPriceUpdates = updates;
    report.priceUpdates.tokenPriceUpdates.truncate(keep);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::PPB,
        readers::InMemoryLane,
        types::{Message, TokenPriceUpdateEvent},
    };
    use alloy::primitives::address;
    use chrono::TimeDelta;
    use rstest::rstest;

    const SOURCE: u64 = 1;
    const DEST: u64 = 2;
    const NATIVE: Address = address!("00000000000000000000000000000000000000ee");
    const FEE_TOKEN: Address = address!("00000000000000000000000000000000000000fe");

    fn e18(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64.pow(18))
    }

    fn relay_config() -> RelayConfig {
        RelayConfig::default()
            .with_lane(LaneConfig {
                source_chain_selector: SOURCE,
                dest_chain_selector: DEST,
                source_native_token: NATIVE,
                dest_native_token: NATIVE,
                on_ramp: address!("00000000000000000000000000000000000000a1"),
            })
            .with_commit(
                CommitConfig::default()
                    .with_gas_price_heartbeat(Duration::from_secs(3600))
                    .with_gas_price_deviation_ppb(PPB / 5)
                    .with_token_price_heartbeat(Duration::from_secs(3600))
                    .with_token_price_deviation_ppb(PPB / 5),
            )
    }

    async fn setup() -> (Arc<InMemoryLane>, CommitPlugin) {
        let config = relay_config();
        let lane = Arc::new(InMemoryLane::new(config.lane.leaf_hasher()));
        {
            let mut state = lane.state().await;
            state.next_seq_nr = 1;
            state.fee_tokens = vec![FEE_TOKEN];
            state.decimals.insert(FEE_TOKEN, 18);
            state.usd_prices.insert(FEE_TOKEN, e18(1));
            state.usd_prices.insert(NATIVE, e18(2000));
            state.gas_price = U256::from(10_000_000_000u64);
        }
        let plugin = CommitPlugin::new(&config, 1, CommitReaders::from_lane(lane.clone()));
        (lane, plugin)
    }

    async fn send(lane: &InMemoryLane, seq_nrs: impl IntoIterator<Item = u64>) {
        for seq_nr in seq_nrs {
            let message = Message {
                sourceChainSelector: SOURCE,
                sequenceNumber: seq_nr,
                nonce: seq_nr,
                ..Default::default()
            };
            lane.send(message, Utc::now()).await;
        }
    }

    fn observation(interval: Interval, token_price: U256, gas_price: U256) -> CommitObservation {
        CommitObservation {
            interval,
            token_prices_usd: BTreeMap::from([(FEE_TOKEN, Some(token_price))]),
            source_gas_price_usd: Some(gas_price),
        }
    }

    fn attributed(observations: &[CommitObservation]) -> Vec<AttributedObservation> {
        observations
            .iter()
            .enumerate()
            .map(|(i, obs)| AttributedObservation::new(obs.encode().unwrap(), i as u8))
            .collect()
    }

    async fn trust_prices(lane: &InMemoryLane, value: U256, age: TimeDelta) {
        let price = TimestampedPrice { value, timestamp: Utc::now() - age };
        let mut state = lane.state().await;
        state.gas_price_updates.push((SOURCE, price));
        state.token_price_updates.push(TokenPriceUpdateEvent { token: FEE_TOKEN, price });
    }

    #[tokio::test]
    async fn observes_interval_after_leading_gap() {
        let (lane, plugin) = setup().await;
        lane.state().await.next_seq_nr = 9;
        send(&lane, 11..=14).await;

        assert_eq!(plugin.observe_interval().await.unwrap(), Interval::new(11, 14));
    }

    #[rstest]
    #[case::gap_after_first(9, vec![9, 11, 12, 13, 14])]
    #[case::gap_in_the_middle(10, vec![11, 12, 14])]
    #[tokio::test]
    async fn rejects_gaps_in_observed_messages(
        #[case] next_seq_nr: u64,
        #[case] seq_nrs: Vec<u64>,
    ) {
        let (lane, plugin) = setup().await;
        lane.state().await.next_seq_nr = next_seq_nr;
        send(&lane, seq_nrs).await;

        let err = plugin.observe_interval().await.unwrap_err();
        assert!(matches!(err, PluginError::Commit(CommitError::SequenceGap { .. })), "{err}");
    }

    #[test]
    fn unordered_sequence_numbers_are_a_gap() {
        assert!(ensure_contiguous(&[11, 13, 14, 10]).is_err());
        assert!(ensure_contiguous(&[3, 4, 5]).is_ok());
        assert!(ensure_contiguous(&[]).is_ok());
    }

    #[tokio::test]
    async fn observation_prices_every_destination_token() {
        let (lane, plugin) = setup().await;
        send(&lane, 1..=3).await;

        let obs = plugin
            .observation(&CancellationToken::new(), ReportTimestamp::new(1, 1), &Bytes::new())
            .await
            .unwrap();
        let obs = CommitObservation::decode(&obs).unwrap();

        assert_eq!(obs.interval, Interval::new(1, 3));
        assert_eq!(obs.token_prices_usd, BTreeMap::from([(FEE_TOKEN, Some(e18(1)))]));
        // 10 gwei at $2000 per native token.
        assert_eq!(obs.source_gas_price_usd, Some(U256::from(20_000_000_000_000u64)));
    }

    #[tokio::test]
    async fn observation_caps_gas_price() {
        let (lane, plugin) = setup().await;
        lane.state().await.gas_price = U256::from(10u64.pow(12));

        let (_, gas_price_usd) = plugin.observe_prices(&[FEE_TOKEN]).await.unwrap();
        let max = relay_config().commit.max_gas_price;
        assert_eq!(gas_price_usd, denote_in_usd(max, e18(2000)));
    }

    #[tokio::test]
    async fn observation_fails_without_token_price() {
        let (lane, plugin) = setup().await;
        lane.state().await.usd_prices.remove(&FEE_TOKEN);

        let err = plugin
            .observation(&CancellationToken::new(), ReportTimestamp::new(1, 1), &Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Commit(CommitError::MissingTokenPrice(FEE_TOKEN))));
    }

    #[tokio::test]
    async fn observation_fails_when_commit_store_is_down() {
        let (lane, plugin) = setup().await;
        lane.state().await.down = true;

        let err = plugin
            .observation(&CancellationToken::new(), ReportTimestamp::new(1, 1), &Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::CommitStoreDown));
    }

    #[test]
    fn drops_invalid_observations() {
        let valid = observation(Interval::new(1, 2), e18(1), e18(1));
        let mut no_gas = valid.clone();
        no_gas.source_gas_price_usd = None;
        let mut missing_price = valid.clone();
        missing_price.token_prices_usd.insert(FEE_TOKEN, None);
        let mut unknown_token = valid.clone();
        unknown_token.token_prices_usd = BTreeMap::from([(NATIVE, Some(e18(1)))]);
        let mut extra_token = valid.clone();
        extra_token.token_prices_usd.insert(NATIVE, Some(e18(1)));

        let kept = validate_observations(
            vec![valid.clone(), no_gas, missing_price, unknown_token, extra_token],
            &[FEE_TOKEN],
        );
        assert_eq!(kept, vec![valid]);
    }

    #[tokio::test]
    async fn recent_prices_within_deviation_are_not_updated() {
        let (lane, plugin) = setup().await;
        trust_prices(&lane, e18(9), TimeDelta::minutes(30)).await;

        let observations = attributed(&[
            observation(Interval::default(), e18(10), e18(10)),
            observation(Interval::default(), e18(11), e18(11)),
        ]);
        let report = plugin
            .report(&CancellationToken::new(), ReportTimestamp::new(1, 1), &Bytes::new(), &observations)
            .await
            .unwrap();
        assert_eq!(report, None);
    }

    #[tokio::test]
    async fn prices_older_than_heartbeat_are_updated() {
        let (lane, plugin) = setup().await;
        trust_prices(&lane, e18(9), TimeDelta::minutes(90)).await;

        let observations = attributed(&[
            observation(Interval::default(), e18(10), e18(10)),
            observation(Interval::default(), e18(11), e18(11)),
        ]);
        let report = plugin
            .report(&CancellationToken::new(), ReportTimestamp::new(1, 1), &Bytes::new(), &observations)
            .await
            .unwrap()
            .unwrap();
        let report = CommitReport::decode(&report).unwrap();

        assert!(!report.has_root());
        assert_eq!(
            report.priceUpdates.tokenPriceUpdates,
            vec![TokenPriceUpdate { sourceToken: FEE_TOKEN, usdPerToken: e18(11) }]
        );
        assert_eq!(
            report.priceUpdates.gasPriceUpdates,
            vec![GasPriceUpdate { destChainSelector: SOURCE, usdPerUnitGas: e18(11) }]
        );
    }

    #[tokio::test]
    async fn deviated_prices_are_updated() {
        let (lane, plugin) = setup().await;
        trust_prices(&lane, e18(5), TimeDelta::minutes(1)).await;

        let observations = attributed(&[
            observation(Interval::default(), e18(10), e18(5)),
            observation(Interval::default(), e18(10), e18(5)),
        ]);
        let report = plugin
            .report(&CancellationToken::new(), ReportTimestamp::new(1, 1), &Bytes::new(), &observations)
            .await
            .unwrap()
            .unwrap();
        let report = CommitReport::decode(&report).unwrap();

        assert_eq!(report.priceUpdates.tokenPriceUpdates.len(), 1);
        assert!(report.priceUpdates.gasPriceUpdates.is_empty());
    }

    #[tokio::test]
    async fn no_report_without_enough_observations() {
        let (_lane, plugin) = setup().await;
        let observations = attributed(&[observation(Interval::new(1, 3), e18(1), e18(1))]);

        let report = plugin
            .report(&CancellationToken::new(), ReportTimestamp::new(1, 1), &Bytes::new(), &observations)
            .await
            .unwrap();
        assert_eq!(report, None);
    }

    #[tokio::test]
    async fn report_commits_agreed_interval() {
        let (lane, plugin) = setup().await;
        send(&lane, 1..=3).await;
        trust_prices(&lane, e18(1), TimeDelta::minutes(1)).await;

        let observations = attributed(&[
            observation(Interval::new(1, 3), e18(1), e18(1)),
            observation(Interval::new(1, 3), e18(1), e18(1)),
            observation(Interval::new(1, 2), e18(1), e18(1)),
        ]);
        let report = plugin
            .report(&CancellationToken::new(), ReportTimestamp::new(1, 1), &Bytes::new(), &observations)
            .await
            .unwrap()
            .unwrap();
        let report = CommitReport::decode(&report).unwrap();

        let requests = lane.send_requests_between_seq_nums(1, 3, true).await.unwrap();
        let leaves: Vec<B256> = requests.iter().map(|r| r.message.messageId).collect();
        assert_eq!(report.interval, Interval::new(1, 3));
        assert_eq!(report.merkleRoot, MerkleTree::new(&leaves).unwrap().root());
        assert!(report.priceUpdates.is_empty());
    }

    #[tokio::test]
    async fn report_fails_when_messages_are_missing() {
        let (lane, plugin) = setup().await;
        send(&lane, 1..=2).await;

        let err =
            plugin.build_report(Interval::new(1, 3), PriceUpdates::default()).await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::Commit(CommitError::MessageCountMismatch { got: 2, .. })
        ));
    }

    #[tokio::test]
    async fn accepted_report_moves_the_next_interval() {
        let (lane, plugin) = setup().await;
        send(&lane, 1..=5).await;

        let report =
            plugin.build_report(Interval::new(1, 3), PriceUpdates::default()).await.unwrap();
        let encoded = report.encode();
        let timestamp = ReportTimestamp::new(1, 1);

        assert!(plugin.should_accept_finalized_report(timestamp, &encoded).await.unwrap());
        assert_eq!(plugin.inflight().num_reports().await, 1);
        assert_eq!(plugin.observe_interval().await.unwrap(), Interval::new(4, 5));

        // The same report again no longer starts at the next inflight sequence number.
        assert!(!plugin.should_accept_finalized_report(timestamp, &encoded).await.unwrap());

        assert!(plugin.should_transmit_accepted_report(timestamp, &encoded).await.unwrap());
        lane.accept_commit_report(report, Utc::now(), 1).await;
        assert!(!plugin.should_transmit_accepted_report(timestamp, &encoded).await.unwrap());
    }

    #[tokio::test]
    async fn empty_report_is_rejected() {
        let (_lane, plugin) = setup().await;
        let encoded = CommitReport::default().encode();
        let timestamp = ReportTimestamp::new(1, 1);

        assert!(!plugin.should_accept_finalized_report(timestamp, &encoded).await.unwrap());
        assert!(!plugin.should_transmit_accepted_report(timestamp, &encoded).await.unwrap());
    }

    #[tokio::test]
    async fn price_report_is_stale_after_newer_round() {
        let (lane, plugin) = setup().await;
        let report = CommitReport {
            priceUpdates: PriceUpdates {
                tokenPriceUpdates: vec![],
                gasPriceUpdates: vec![GasPriceUpdate {
                    destChainSelector: SOURCE,
                    usdPerUnitGas: e18(3),
                }],
            },
            ..Default::default()
        };
        let encoded = report.encode();
        let timestamp = ReportTimestamp::new(2, 0);

        lane.state().await.latest_price_epoch_and_round = timestamp.epoch_and_round();
        assert!(!plugin.should_transmit_accepted_report(timestamp, &encoded).await.unwrap());

        lane.state().await.latest_price_epoch_and_round =
            ReportTimestamp::new(1, 9).epoch_and_round();
        assert!(plugin.should_transmit_accepted_report(timestamp, &encoded).await.unwrap());
        assert!(plugin.should_accept_finalized_report(timestamp, &encoded).await.unwrap());

        // The accepted update is now trusted, so the same price is stale.
        let next = ReportTimestamp::new(2, 1);
        assert!(!plugin.should_accept_finalized_report(next, &encoded).await.unwrap());
    }

    #[tokio::test]
    async fn gas_update_within_deviation_is_stale() {
        let (lane, plugin) = setup().await;
        trust_prices(&lane, e18(10), TimeDelta::minutes(1)).await;

        assert!(plugin.is_stale_gas_price(e18(10), false, Utc::now()).await);
        assert!(!plugin.is_stale_gas_price(e18(20), false, Utc::now()).await);
        assert!(
            plugin
                .are_stale_token_prices(
                    &[TokenPriceUpdate { sourceToken: FEE_TOKEN, usdPerToken: e18(11) }],
                    false,
                    Utc::now()
                )
                .await
        );
        assert!(
            !plugin
                .are_stale_token_prices(
                    &[TokenPriceUpdate { sourceToken: NATIVE, usdPerToken: e18(11) }],
                    false,
                    Utc::now()
                )
                .await
        );
    }

    #[tokio::test]
    async fn inflight_cache_resets_when_far_ahead() {
        let (_lane, plugin) = setup().await;
        let report = CommitReport {
            interval: Interval::new(600, 700),
            merkleRoot: B256::with_last_byte(1),
            ..Default::default()
        };
        plugin.inflight().add(report, 1, Utc::now()).await.unwrap();

        assert_eq!(plugin.next_min_seq_nr().await.unwrap(), (1, 1));
        assert_eq!(plugin.inflight().num_reports().await, 0);
    }

    #[test]
    fn oversized_report_drops_token_updates() {
        let updates: Vec<_> = (0..400u64)
            .map(|i| TokenPriceUpdate {
                sourceToken: Address::with_last_byte((i % 256) as u8),
                usdPerToken: U256::from(i),
            })
            .collect();
        let report = CommitReport {
            priceUpdates: PriceUpdates {
                tokenPriceUpdates: updates.clone(),
                gasPriceUpdates: vec![],
            },
            interval: Interval::new(1, 1),
            merkleRoot: B256::with_last_byte(1),
        };

        let capped = cap_report(report);
        let kept = capped.priceUpdates.tokenPriceUpdates.len();
        assert!(capped.encode().len() <= MAX_COMMIT_REPORT_LENGTH);
        assert!(kept > 0 && kept < updates.len());
        assert_eq!(capped.priceUpdates.tokenPriceUpdates, updates[..kept]);

        let mut one_more = capped.clone();
        one_more.priceUpdates.tokenPriceUpdates.push(updates[kept].clone());
        assert!(one_more.encode().len() > MAX_COMMIT_REPORT_LENGTH);
    }
}
