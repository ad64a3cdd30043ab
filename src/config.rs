//! Relay configuration.
use crate::{
    constants::{
        DEFAULT_MAX_DATA_LEN_PER_BATCH, DEFAULT_MESSAGES_ITERATION_STEP,
        DEFAULT_TOKEN_DATA_WAIT_PER_BATCH, MAX_NUMBER_TREE_LEAVES, PPB, PRICE_EXPIRY_MULTIPLIER,
    },
    merkle::LeafHasher,
};
use alloy::primitives::{Address, U256};
use eyre::{Context, ensure};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Relay configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Lane configuration.
    #[serde(default)]
    pub lane: LaneConfig,
    /// Commit engine configuration.
    #[serde(default)]
    pub commit: CommitConfig,
    /// Execution engine configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl RelayConfig {
    /// Sets the lane configuration.
    pub fn with_lane(mut self, lane: LaneConfig) -> Self {
        self.lane = lane;
        self
    }

    /// Sets the commit engine configuration.
    pub fn with_commit(mut self, commit: CommitConfig) -> Self {
        self.commit = commit;
        self
    }

    /// Sets the execution engine configuration.
    pub fn with_execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> eyre::Result<()> {
        self.commit.validate().wrap_err("invalid commit configuration")?;
        self.execution.validate().wrap_err("invalid execution configuration")?;
        Ok(())
    }

    /// Load from a YAML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
        let config = serde_yaml::from_reader(&file)
            .wrap_err_with(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save to a YAML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> eyre::Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .wrap_err_with(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// The lane between a source and a destination chain.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Selector of the source chain.
    pub source_chain_selector: u64,
    /// Selector of the destination chain.
    pub dest_chain_selector: u64,
    /// Wrapped native token of the source chain. Its price denominates source gas.
    pub source_native_token: Address,
    /// Wrapped native token of the destination chain. Its price denominates execution costs.
    pub dest_native_token: Address,
    /// On-ramp the messages are sent through.
    pub on_ramp: Address,
}

impl LaneConfig {
    /// The leaf hasher of messages on this lane.
    pub fn leaf_hasher(&self) -> LeafHasher {
        LeafHasher::new(self.source_chain_selector, self.dest_chain_selector, self.on_ramp)
    }
}

/// Commit engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Maximum age of the trusted gas price before an update is forced.
    #[serde(with = "crate::serde::duration")]
    pub gas_price_heartbeat: Duration,
    /// Relative gas price change, in parts per billion, that forces an update.
    pub gas_price_deviation_ppb: u64,
    /// Maximum age of a trusted token price before an update is forced.
    #[serde(with = "crate::serde::duration")]
    pub token_price_heartbeat: Duration,
    /// Relative token price change, in parts per billion, that forces an update.
    pub token_price_deviation_ppb: u64,
    /// How long accepted reports are considered inflight.
    #[serde(with = "crate::serde::duration")]
    pub inflight_cache_expiry: Duration,
    /// Cap on the observed source gas price, in native wei.
    pub max_gas_price: U256,
    /// Inflight price updates live `price_expiry_multiplier` times longer than reports.
    pub price_expiry_multiplier: u32,
    /// Maximum number of messages in a committed interval.
    pub max_interval_range: u64,
}

impl CommitConfig {
    /// Sets the gas price heartbeat.
    pub fn with_gas_price_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.gas_price_heartbeat = heartbeat;
        self
    }

    /// Sets the gas price deviation in parts per billion.
    pub fn with_gas_price_deviation_ppb(mut self, ppb: u64) -> Self {
        self.gas_price_deviation_ppb = ppb;
        self
    }

    /// Sets the token price heartbeat.
    pub fn with_token_price_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.token_price_heartbeat = heartbeat;
        self
    }

    /// Sets the token price deviation in parts per billion.
    pub fn with_token_price_deviation_ppb(mut self, ppb: u64) -> Self {
        self.token_price_deviation_ppb = ppb;
        self
    }

    /// Sets the inflight cache expiry.
    pub fn with_inflight_cache_expiry(mut self, expiry: Duration) -> Self {
        self.inflight_cache_expiry = expiry;
        self
    }

    /// Sets the maximum source gas price.
    pub fn with_max_gas_price(mut self, max_gas_price: U256) -> Self {
        self.max_gas_price = max_gas_price;
        self
    }

    /// Sets the maximum interval range.
    pub fn with_max_interval_range(mut self, range: u64) -> Self {
        self.max_interval_range = range;
        self
    }

    fn validate(&self) -> eyre::Result<()> {
        ensure!(!self.gas_price_heartbeat.is_zero(), "gas price heartbeat must not be zero");
        ensure!(!self.token_price_heartbeat.is_zero(), "token price heartbeat must not be zero");
        ensure!(!self.inflight_cache_expiry.is_zero(), "inflight cache expiry must not be zero");
        ensure!(self.price_expiry_multiplier > 0, "price expiry multiplier must not be zero");
        ensure!(
            (1..=MAX_NUMBER_TREE_LEAVES as u64).contains(&self.max_interval_range),
            "max interval range must be within [1, {MAX_NUMBER_TREE_LEAVES}]"
        );
        Ok(())
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            gas_price_heartbeat: Duration::from_secs(60 * 60),
            gas_price_deviation_ppb: PPB / 10,
            token_price_heartbeat: Duration::from_secs(60 * 60),
            token_price_deviation_ppb: PPB / 20,
            inflight_cache_expiry: Duration::from_secs(180),
            max_gas_price: U256::from(200_000_000_000u64),
            price_expiry_multiplier: PRICE_EXPIRY_MULTIPLIER,
            max_interval_range: MAX_NUMBER_TREE_LEAVES as u64,
        }
    }
}

/// Execution engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Gas available to a single execution batch.
    pub batch_gas_limit: u64,
    /// Relative fee boost per hour a message waits.
    pub relative_boost_per_wait_hour: f64,
    /// How long accepted batches are considered inflight.
    #[serde(with = "crate::serde::duration")]
    pub inflight_cache_expiry: Duration,
    /// How long a root without executable messages is skipped.
    #[serde(with = "crate::serde::duration")]
    pub root_snooze_time: Duration,
    /// Age after which anyone may execute a committed message. Older roots are ignored.
    #[serde(with = "crate::serde::duration")]
    pub permissionless_execution_threshold: Duration,
    /// Confirmations required before destination events are considered.
    pub dest_optimistic_confirmations: u64,
    /// Depth after which a destination execution is final.
    pub dest_finality_depth: u64,
    /// Cap on the summed payload length of a batch.
    pub max_data_len_per_batch: usize,
    /// Number of messages loaded per group of commit reports.
    pub messages_iteration_step: u64,
    /// Time budget for reading off-chain token data for one batch.
    #[serde(with = "crate::serde::duration")]
    pub token_data_wait_per_batch: Duration,
}

impl ExecutionConfig {
    /// Sets the batch gas limit.
    pub fn with_batch_gas_limit(mut self, gas_limit: u64) -> Self {
        self.batch_gas_limit = gas_limit;
        self
    }

    /// Sets the relative fee boost per wait hour.
    pub fn with_relative_boost_per_wait_hour(mut self, boost: f64) -> Self {
        self.relative_boost_per_wait_hour = boost;
        self
    }

    /// Sets the inflight cache expiry.
    pub fn with_inflight_cache_expiry(mut self, expiry: Duration) -> Self {
        self.inflight_cache_expiry = expiry;
        self
    }

    /// Sets the root snooze time.
    pub fn with_root_snooze_time(mut self, snooze_time: Duration) -> Self {
        self.root_snooze_time = snooze_time;
        self
    }

    /// Sets the destination finality depth.
    pub fn with_dest_finality_depth(mut self, depth: u64) -> Self {
        self.dest_finality_depth = depth;
        self
    }

    /// Sets the maximum summed payload length of a batch.
    pub fn with_max_data_len_per_batch(mut self, len: usize) -> Self {
        self.max_data_len_per_batch = len;
        self
    }

    /// Sets the number of messages loaded per group of commit reports.
    pub fn with_messages_iteration_step(mut self, step: u64) -> Self {
        self.messages_iteration_step = step;
        self
    }

    /// Sets the time budget for reading token data.
    pub fn with_token_data_wait_per_batch(mut self, wait: Duration) -> Self {
        self.token_data_wait_per_batch = wait;
        self
    }

    fn validate(&self) -> eyre::Result<()> {
        ensure!(self.batch_gas_limit > 0, "batch gas limit must not be zero");
        ensure!(
            self.relative_boost_per_wait_hour.is_finite()
                && self.relative_boost_per_wait_hour >= 0.0,
            "relative boost per wait hour must be a non-negative number"
        );
        ensure!(!self.inflight_cache_expiry.is_zero(), "inflight cache expiry must not be zero");
        ensure!(!self.root_snooze_time.is_zero(), "root snooze time must not be zero");
        ensure!(self.messages_iteration_step > 0, "messages iteration step must not be zero");
        Ok(())
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            batch_gas_limit: 5_000_000,
            relative_boost_per_wait_hour: 0.5,
            inflight_cache_expiry: Duration::from_secs(180),
            root_snooze_time: Duration::from_secs(10 * 60),
            permissionless_execution_threshold: Duration::from_secs(8 * 60 * 60),
            dest_optimistic_confirmations: 1,
            dest_finality_depth: 10,
            max_data_len_per_batch: DEFAULT_MAX_DATA_LEN_PER_BATCH,
            messages_iteration_step: DEFAULT_MESSAGES_ITERATION_STEP,
            token_data_wait_per_batch: DEFAULT_TOKEN_DATA_WAIT_PER_BATCH,
        }
    }
}
