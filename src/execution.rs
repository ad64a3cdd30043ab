//! Execution engine.
//!
//! Each round the nodes pick executable messages under one blessed commit root, agree on the
//! batch and the off-chain token data of its messages, and attach a merkle multi-proof of
//! their inclusion in the root.

use crate::{
    batching::{BatchContext, InflightAggregates, select_reports_to_fill_batch},
    config::{ExecutionConfig, LaneConfig, RelayConfig},
    constants::{MAX_EXECUTION_REPORT_LENGTH, MAX_OBSERVATION_LENGTH},
    consensus::{longest_fitting_prefix, observed_messages_consensus, parse_observations},
    error::{ExecutionError, PluginError},
    inflight::{ExecutionInflight, InflightExecutionReport},
    merkle::{LeafHasher, MerkleTree},
    metrics::ExecutionMetrics,
    plugin::{AttributedObservation, ReportTimestamp, ReportingPlugin, cancellable},
    prices::validate_token_prices,
    readers::{
        CommitStoreReader, DestinationStateReader, GasPriceEstimator, PriceRegistryReader,
        RateLimiterReader, SourceMessageReader, TokenDataProvider, TokenDataProviders,
    },
    snooze::SnoozedRoots,
    time,
    types::{
        CommitReport, CommitReportWithMeta, ExecutionObservation, ExecutionReport, Interval,
        Message, Observation, ObservedMessage, SendRequestWithMeta,
    },
};
use alloy::primitives::{Address, B256, Bytes, U256, map::HashMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::BTreeSet, fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// External state read by the execution engine.
#[derive(Debug, Clone)]
pub struct ExecutionReaders {
    /// Messages sent on the source chain.
    pub source: Arc<dyn SourceMessageReader>,
    /// Destination chain state of the lane.
    pub dest: Arc<dyn DestinationStateReader>,
    /// The destination commit store.
    pub commit_store: Arc<dyn CommitStoreReader>,
    /// The source price registry, which prices fee tokens.
    pub source_price_registry: Arc<dyn PriceRegistryReader>,
    /// The destination price registry, which prices transferred tokens and native gas.
    pub dest_price_registry: Arc<dyn PriceRegistryReader>,
    /// Destination rate limiters.
    pub rate_limiter: Arc<dyn RateLimiterReader>,
    /// Destination chain gas price.
    pub dest_gas_estimator: Arc<dyn GasPriceEstimator>,
    /// Off-chain token data by source token.
    pub token_data_providers: TokenDataProviders,
}

impl ExecutionReaders {
    /// Uses a single value for every reader, without token data providers.
    pub fn from_lane<L>(lane: Arc<L>) -> Self
    where
        L: SourceMessageReader
            + DestinationStateReader
            + CommitStoreReader
            + PriceRegistryReader
            + RateLimiterReader
            + GasPriceEstimator
            + 'static,
    {
        Self {
            source: lane.clone(),
            dest: lane.clone(),
            commit_store: lane.clone(),
            source_price_registry: lane.clone(),
            dest_price_registry: lane.clone(),
            rate_limiter: lane.clone(),
            dest_gas_estimator: lane,
            token_data_providers: HashMap::default(),
        }
    }

    /// Reads the off-chain data of `source_token` through `provider`.
    pub fn with_token_data_provider(
        mut self,
        source_token: Address,
        provider: Arc<dyn TokenDataProvider>,
    ) -> Self {
        self.token_data_providers.insert(source_token, provider);
        self
    }
}

/// Prices and limits fetched at most once per observation.
#[derive(Debug)]
struct TokenExecData {
    source_to_dest: HashMap<Address, Address>,
    source_token_prices: HashMap<Address, U256>,
    dest_token_prices: HashMap<Address, U256>,
    aggregate_limit: U256,
    dest_gas_price: U256,
    inflight: InflightAggregates,
}

/// The execution reporting engine of a lane.
pub struct ExecutionPlugin {
    lane: LaneConfig,
    config: ExecutionConfig,
    /// Number of faulty nodes tolerated.
    f: usize,
    readers: ExecutionReaders,
    hasher: LeafHasher,
    inflight: ExecutionInflight,
    snoozed: SnoozedRoots,
    metrics: ExecutionMetrics,
}

impl fmt::Debug for ExecutionPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlugin")
            .field("lane", &self.lane)
            .field("config", &self.config)
            .field("f", &self.f)
            .field("inflight", &self.inflight)
            .field("snoozed", &self.snoozed)
            .finish_non_exhaustive()
    }
}

impl ExecutionPlugin {
    /// Creates the engine for the lane of `config`, tolerating `f` faulty nodes.
    pub fn new(config: &RelayConfig, f: usize, readers: ExecutionReaders) -> Self {
        let lane_label =
            format!("{}-{}", config.lane.source_chain_selector, config.lane.dest_chain_selector);
        Self {
            hasher: config.lane.leaf_hasher(),
            inflight: ExecutionInflight::new(config.execution.inflight_cache_expiry),
            snoozed: SnoozedRoots::new(config.execution.root_snooze_time),
            metrics: ExecutionMetrics::new_with_labels(&[("lane", lane_label)]),
            lane: config.lane.clone(),
            config: config.execution.clone(),
            f,
            readers,
        }
    }

    /// Batches accepted by this node that are not executed yet.
    pub fn inflight(&self) -> &ExecutionInflight {
        &self.inflight
    }

    /// Roots this node currently skips.
    pub fn snoozed_roots(&self) -> &SnoozedRoots {
        &self.snoozed
    }

    /// The first non-empty batch of the unexpired blessed roots, oldest root first.
    ///
    /// Cancellation ends the scan with an empty batch.
    async fn executable_observations(
        &self,
        cancel: &CancellationToken,
        inflight: &[InflightExecutionReport],
        now: DateTime<Utc>,
    ) -> Result<Vec<(u64, ObservedMessage)>, PluginError> {
        match self.scan_roots(cancel, inflight, now).await {
            Err(err) if err.is_cancelled() => {
                warn!("Processing of roots cancelled");
                Ok(Vec::new())
            }
            result => result,
        }
    }

    async fn scan_roots(
        &self,
        cancel: &CancellationToken,
        inflight: &[InflightExecutionReport],
        now: DateTime<Utc>,
    ) -> Result<Vec<(u64, ObservedMessage)>, PluginError> {
        let accepted = cancellable(
            cancel,
            self.readers.dest.accepted_commit_reports_gte_timestamp(
                time::before(now, self.config.permissionless_execution_threshold),
                self.config.dest_optimistic_confirmations,
            ),
        )
        .await?;

        let mut reports: Vec<CommitReportWithMeta> = accepted
            .into_iter()
            .filter(|accepted| accepted.report.has_root())
            .filter(|accepted| {
                let snoozed = self.snoozed.is_snoozed(&accepted.report.merkleRoot, now);
                if snoozed {
                    debug!(root = %accepted.report.merkleRoot, "Skipping snoozed root");
                }
                !snoozed
            })
            .collect();
        reports.sort_by_key(|accepted| accepted.report.interval.min);
        self.metrics.unexpired_roots.set(reports.len() as f64);
        if reports.is_empty() {
            return Ok(Vec::new());
        }

        let mut exec_data: Option<TokenExecData> = None;
        let mut start = 0;
        while start < reports.len() {
            let step = select_reports_to_fill_batch(
                &reports[start..],
                self.config.messages_iteration_step,
            );
            let group = &reports[start..start + step];
            start += step;

            let with_requests = cancellable(cancel, self.reports_with_send_requests(group)).await?;
            let mut pool_limits: Option<HashMap<Address, U256>> = None;

            for (report, requests) in &with_requests {
                if cancel.is_cancelled() {
                    return Err(PluginError::Cancelled);
                }
                let root = report.merkleRoot;

                if requests.len() as u64 != report.interval.num_messages() {
                    error!(
                        %root,
                        min = report.interval.min,
                        max = report.interval.max,
                        got = requests.len(),
                        "Skipping root with missing messages"
                    );
                    continue;
                }
                if requests.iter().all(|request| request.executed && request.finalized) {
                    info!(%root, "Every message executed and finalized, snoozing root for good");
                    self.snoozed.mark_as_executed(root);
                    continue;
                }
                if !cancellable(cancel, self.readers.commit_store.is_blessed(root)).await? {
                    info!(%root, "Root accepted but not blessed");
                    continue;
                }

                if exec_data.is_none() {
                    exec_data = Some(cancellable(cancel, self.token_exec_data(inflight)).await?);
                }
                let Some(data) = exec_data.as_ref() else { continue };
                if pool_limits.is_none() {
                    pool_limits = Some(
                        cancellable(cancel, self.pool_limits(&with_requests, &data.source_to_dest))
                            .await?,
                    );
                }
                let Some(pool_limits) = pool_limits.as_ref() else { continue };

                let batch = BatchContext {
                    config: &self.config,
                    dest_reader: self.readers.dest.as_ref(),
                    token_data_providers: &self.readers.token_data_providers,
                    inflight: &data.inflight,
                    source_to_dest: &data.source_to_dest,
                    source_token_prices: &data.source_token_prices,
                    dest_token_prices: &data.dest_token_prices,
                    dest_native_token: self.lane.dest_native_token,
                    dest_gas_price: data.dest_gas_price,
                    aggregate_limit: data.aggregate_limit,
                    pool_limits,
                    now,
                }
                .build_batch(cancel, requests)
                .await;

                if !batch.is_empty() {
                    info!(%root, messages = batch.len(), "Execution batch created");
                    return Ok(batch);
                }
                if cancel.is_cancelled() {
                    return Ok(batch);
                }
                self.snoozed.snooze(root, now);
            }
        }

        Ok(Vec::new())
    }

    /// Loads the messages of `reports` and their destination execution status.
    async fn reports_with_send_requests(
        &self,
        reports: &[CommitReportWithMeta],
    ) -> Result<Vec<(CommitReport, Vec<SendRequestWithMeta>)>, PluginError> {
        let (Some(min), Some(max)) = (
            reports.iter().map(|r| r.report.interval.min).min(),
            reports.iter().map(|r| r.report.interval.max).max(),
        ) else {
            return Ok(Vec::new());
        };

        let (requests, state_changes, latest_block) = tokio::try_join!(
            self.readers.source.send_requests_between_seq_nums(min, max, false),
            self.readers.dest.execution_state_changes_between_seq_nums(
                min,
                max,
                self.config.dest_optimistic_confirmations
            ),
            self.readers.dest.latest_block(),
        )?;

        let finalized: HashMap<u64, bool> = state_changes
            .iter()
            .map(|change| {
                let depth = latest_block.number.saturating_sub(change.block_number);
                (change.sequence_number, depth >= self.config.dest_finality_depth)
            })
            .collect();

        let mut grouped: Vec<(CommitReport, Vec<SendRequestWithMeta>)> =
            reports.iter().map(|r| (r.report.clone(), Vec::new())).collect();
        for request in requests {
            let seq_nr = request.message.sequenceNumber;
            let with_meta = SendRequestWithMeta {
                executed: finalized.contains_key(&seq_nr),
                finalized: finalized.get(&seq_nr).copied().unwrap_or_default(),
                message: request.message,
                block_timestamp: request.block_timestamp,
            };
            for (report, requests) in grouped.iter_mut() {
                if report.interval.contains(seq_nr) {
                    requests.push(with_meta.clone());
                }
            }
        }

        Ok(grouped)
    }

    /// Token prices, the aggregate rate limit and the destination gas price.
    ///
    /// A disabled aggregate rate limiter does not limit anything.
    async fn token_exec_data(
        &self,
        inflight: &[InflightExecutionReport],
    ) -> Result<TokenExecData, PluginError> {
        let (bucket, source_fee_tokens, dest_fee_tokens, source_to_dest, dest_gas_price) =
            tokio::try_join!(
                self.readers.rate_limiter.aggregate_bucket(),
                self.readers.source_price_registry.fee_tokens(),
                self.readers.dest_price_registry.fee_tokens(),
                self.readers.dest.source_to_dest_tokens(),
                self.readers.dest_gas_estimator.gas_price(),
            )?;

        let source_tokens: Vec<Address> = source_fee_tokens
            .into_iter()
            .chain([self.lane.source_native_token])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let dest_tokens: Vec<Address> = dest_fee_tokens
            .into_iter()
            .chain(source_to_dest.values().copied())
            .chain([self.lane.dest_native_token])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let (source_prices, dest_prices) = tokio::try_join!(
            self.readers.source_price_registry.token_prices(&source_tokens),
            self.readers.dest_price_registry.token_prices(&dest_tokens),
        )?;
        let source_token_prices = validate_token_prices(&source_tokens, &source_prices)?;
        let dest_token_prices = validate_token_prices(&dest_tokens, &dest_prices)?;

        let aggregate_limit = if bucket.is_enabled { bucket.tokens } else { U256::MAX };
        let inflight = InflightAggregates::new(inflight, &dest_token_prices, &source_to_dest);

        Ok(TokenExecData {
            source_to_dest,
            source_token_prices,
            dest_token_prices,
            aggregate_limit,
            dest_gas_price,
            inflight,
        })
    }

    /// Capacity of the enabled pools of every destination token transferred by `reports`.
    async fn pool_limits(
        &self,
        reports: &[(CommitReport, Vec<SendRequestWithMeta>)],
        source_to_dest: &HashMap<Address, Address>,
    ) -> Result<HashMap<Address, U256>, PluginError> {
        let mut dest_tokens = BTreeSet::new();
        for request in reports.iter().flat_map(|(_, requests)| requests) {
            for amount in &request.message.tokenAmounts {
                match source_to_dest.get(&amount.token) {
                    Some(dest_token) => {
                        dest_tokens.insert(*dest_token);
                    }
                    None => warn!(token = %amount.token, "Token not found on destination chain"),
                }
            }
        }
        if dest_tokens.is_empty() {
            return Ok(HashMap::default());
        }

        let dest_tokens: Vec<Address> = dest_tokens.into_iter().collect();
        let buckets = self.readers.rate_limiter.pool_buckets(&dest_tokens).await?;
        Ok(dest_tokens
            .into_iter()
            .zip(buckets)
            .filter(|(_, bucket)| bucket.is_enabled)
            .map(|(token, bucket)| (token, bucket.tokens))
            .collect())
    }

    /// Builds the execution report of the consensus batch.
    ///
    /// The batch must lie within a single committed root. Trailing messages are dropped
    /// until the encoded report fits, and the proof is verified before the report is
    /// returned.
    async fn build_report(
        &self,
        observed: &[(u64, ObservedMessage)],
    ) -> Result<ExecutionReport, PluginError> {
        let Some(&(first, _)) = observed.first() else {
            return Err(ExecutionError::EmptyMessages.into());
        };

        let next = self.readers.commit_store.expected_next_sequence_number().await?;
        if let Some(&(seq_nr, _)) = observed.iter().find(|(seq_nr, _)| *seq_nr >= next) {
            return Err(ExecutionError::SequenceNumberNotCommitted { seq_nr, next }.into());
        }

        let commit_report = self
            .readers
            .dest
            .accepted_commit_reports_gte_seq_num(first, 0)
            .await?
            .into_iter()
            .find(|accepted| accepted.report.interval.contains(first))
            .ok_or(ExecutionError::CommitReportNotFound(first))?
            .report;
        let interval = commit_report.interval.clone();
        if let Some(&(seq_nr, _)) =
            observed.iter().find(|(seq_nr, _)| !interval.contains(*seq_nr))
        {
            return Err(ExecutionError::OutsideInterval {
                seq_nr,
                min: interval.min,
                max: interval.max,
            }
            .into());
        }
        debug!(
            root = %commit_report.merkleRoot,
            min = interval.min,
            max = interval.max,
            "Building execution report"
        );

        let messages: Vec<Message> = self
            .readers
            .source
            .send_requests_between_seq_nums(interval.min, interval.max, false)
            .await?
            .into_iter()
            .map(|request| request.message)
            .collect();
        let leaves: Vec<B256> = messages.iter().map(|message| self.hasher.hash(message)).collect();
        let tree = MerkleTree::new(&leaves)?;
        if tree.root() != commit_report.merkleRoot || leaves.len() as u64 != interval.num_messages()
        {
            return Err(ExecutionError::RootMismatch {
                committed: commit_report.merkleRoot,
                rebuilt: tree.root(),
            }
            .into());
        }

        let keep = longest_fitting_prefix(observed.len(), |n| {
            report_for_messages(&messages, &tree, &interval, &observed[..n])
                .is_ok_and(|report| report.encode().len() <= MAX_EXECUTION_REPORT_LENGTH)
        });
        if keep == 0 {
            return Err(ExecutionError::EmptyMessages.into());
        }
        if keep < observed.len() {
            warn!(
                observed = observed.len(),
                kept = keep,
                limit = MAX_EXECUTION_REPORT_LENGTH,
                "Capping execution report"
            );
        }
        let report = report_for_messages(&messages, &tree, &interval, &observed[..keep])?;

        if self.hasher.execution_report_root(&report)? != commit_report.merkleRoot {
            error!(root = %commit_report.merkleRoot, "Execution proof does not verify locally");
            return Err(ExecutionError::RootDoesNotVerify.into());
        }
        if !self.readers.commit_store.verify_execution_report(&report).await? {
            error!(root = %commit_report.merkleRoot, "Execution proof rejected by the commit store");
            return Err(ExecutionError::RootDoesNotVerify.into());
        }

        Ok(report)
    }

    /// A report is stale once its first message has reached a terminal state.
    async fn is_stale(&self, report: &ExecutionReport) -> Result<bool, PluginError> {
        let Some(first) = report.messages.first() else {
            return Err(ExecutionError::EmptyMessages.into());
        };
        let state = self.readers.dest.execution_state(first.sequenceNumber).await?;
        Ok(state.is_terminal())
    }
}

#[async_trait]
impl ReportingPlugin for ExecutionPlugin {
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

        let now = Utc::now();
        self.inflight.expire(now).await;
        self.snoozed.sweep(now);
        let inflight = self.inflight.get_all().await;

        let batch = cap_observation(self.executable_observations(cancel, &inflight, now).await?);
        self.metrics.observed_batch_size.record(batch.len() as f64);
        self.metrics.snoozed_roots.set(self.snoozed.len() as f64);
        debug!(
            epoch = timestamp.epoch,
            round = timestamp.round,
            messages = batch.len(),
            "Observed executable messages"
        );

        Ok(ExecutionObservation::new(batch).encode()?)
    }

    async fn report(
        &self,
        cancel: &CancellationToken,
        timestamp: ReportTimestamp,
        _query: &Bytes,
        observations: &[AttributedObservation],
    ) -> Result<Option<Bytes>, PluginError> {
        let observations: Vec<ExecutionObservation> = parse_observations(observations);
        if observations.len() <= self.f {
            debug!(parsed = observations.len(), f = self.f, "Not enough execution observations");
            return Ok(None);
        }

        let observed = observed_messages_consensus(&observations, self.f);
        if observed.is_empty() {
            return Ok(None);
        }

        let report = cancellable(cancel, self.build_report(&observed)).await?;
        self.metrics.reported_batch_size.record(report.messages.len() as f64);
        info!(
            epoch = timestamp.epoch,
            round = timestamp.round,
            messages = report.messages.len(),
            first = report.messages.first().map(|m| m.sequenceNumber),
            last = report.messages.last().map(|m| m.sequenceNumber),
            "Built execution report"
        );

        Ok(Some(report.encode()))
    }

    async fn should_accept_finalized_report(
        &self,
        _timestamp: ReportTimestamp,
        report: &Bytes,
    ) -> Result<bool, PluginError> {
        let report = ExecutionReport::decode(report)?;
        if self.is_stale(&report).await? {
            self.metrics.stale_reports.increment(1);
            info!(messages = report.messages.len(), "Execution report is stale");
            return Ok(false);
        }

        self.inflight.add(report.messages, Utc::now()).await?;
        info!("Accepting finalized execution report");
        Ok(true)
    }

    async fn should_transmit_accepted_report(
        &self,
        _timestamp: ReportTimestamp,
        report: &Bytes,
    ) -> Result<bool, PluginError> {
        let report = ExecutionReport::decode(report)?;
        if self.is_stale(&report).await? {
            self.metrics.stale_reports.increment(1);
            info!(messages = report.messages.len(), "Execution report is stale");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Execution report for `observed`, a subset of the messages of `tree`.
///
/// `messages` are the messages of the whole interval, in order.
fn report_for_messages(
    messages: &[Message],
    tree: &MerkleTree,
    interval: &Interval,
    observed: &[(u64, ObservedMessage)],
) -> Result<ExecutionReport, PluginError> {
    let indices: Vec<usize> =
        observed.iter().map(|(seq_nr, _)| (seq_nr - interval.min) as usize).collect();
    let proof = tree.prove(&indices)?;

    Ok(ExecutionReport {
        messages: indices.iter().map(|index| messages[*index].clone()).collect(),
        offchainTokenData: observed.iter().map(|(_, msg)| msg.token_data.clone()).collect(),
        proofFlagBits: proof.flag_bits(),
        proofs: proof.hashes,
    })
}

/// Drops trailing messages until the encoded observation fits.
fn cap_observation(batch: Vec<(u64, ObservedMessage)>) -> Vec<(u64, ObservedMessage)> {
    let fits = |n: usize| {
        ExecutionObservation::new(batch[..n].iter().cloned())
            .encode()
            .is_ok_and(|encoded| encoded.len() <= MAX_OBSERVATION_LENGTH)
    };
    if fits(batch.len()) {
        return batch;
    }

    let keep = longest_fitting_prefix(batch.len(), fits);
    warn!(observed = batch.len(), kept = keep, "Capping execution observation");
    let mut batch = batch;
    batch.truncate(keep);
    batch
}
