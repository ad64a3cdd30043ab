//! # Lane relay CLI
use crate::config::RelayConfig;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;

/// Commit and execution reporting engines of a cross-chain lane.
#[derive(Debug, Parser)]
#[command(
    author,
    version = crate::version::LANE_RELAY_VERSION,
    about = "Lane relay",
    long_about = None
)]
pub struct Args {
    /// The configuration file.
    ///
    /// If missing, a default one will be used and stored under the given path.
    #[arg(
        long,
        value_name = "CONFIG",
        env = "LANE_RELAY_CONFIG",
        default_value = "lane-relay.yaml"
    )]
    pub config: PathBuf,
    /// Gas available to a single execution batch.
    #[arg(long = "batch-gas-limit", value_name = "GAS")]
    pub batch_gas_limit: Option<u64>,
    /// Depth after which a destination execution is final.
    #[arg(long = "dest-finality-depth", value_name = "BLOCKS")]
    pub dest_finality_depth: Option<u64>,
    /// Prints the effective configuration as YAML and exits.
    #[arg(long, default_value_t = false)]
    pub print: bool,
}

impl Args {
    /// Loads, validates and reports the effective configuration.
    pub async fn run(self) -> eyre::Result<()> {
        let print = self.print;
        let config_path = self.config.clone();
        let config = self.load_config(&config_path)?;

        if print {
            println!("{}", serde_yaml::to_string(&config)?);
            return Ok(());
        }

        info!(
            path = %config_path.display(),
            source_chain = config.lane.source_chain_selector,
            dest_chain = config.lane.dest_chain_selector,
            "Loaded lane configuration"
        );
        info!(
            max_interval_range = config.commit.max_interval_range,
            gas_price_heartbeat = ?config.commit.gas_price_heartbeat,
            token_price_heartbeat = ?config.commit.token_price_heartbeat,
            "Commit engine configured"
        );
        info!(
            batch_gas_limit = config.execution.batch_gas_limit,
            dest_finality_depth = config.execution.dest_finality_depth,
            root_snooze_time = ?config.execution.root_snooze_time,
            "Execution engine configured"
        );

        Ok(())
    }

    /// Reads the configuration at `path`, writing the default there first if the file is
    /// missing. CLI values override the file.
    pub fn load_config(self, path: &Path) -> eyre::Result<RelayConfig> {
        let config = if !path.exists() {
            let config = self.merge_relay_config(RelayConfig::default());
            config.save_to_file(path)?;
            config
        } else {
            self.merge_relay_config(RelayConfig::load_from_file(path)?)
        };
        config.validate()?;
        Ok(config)
    }

    /// Merges [`Args`] values into an existing [`RelayConfig`] instance.
    pub fn merge_relay_config(self, config: RelayConfig) -> RelayConfig {
        let mut execution = config.execution.clone();
        if let Some(gas_limit) = self.batch_gas_limit {
            execution = execution.with_batch_gas_limit(gas_limit);
        }
        if let Some(depth) = self.dest_finality_depth {
            execution = execution.with_dest_finality_depth(depth);
        }
        config.with_execution(execution)
    }
}
