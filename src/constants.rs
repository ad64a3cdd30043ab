//! Relay constants.

use std::time::Duration;

/// Maximum number of leaves a commit tree may hold.
pub const MAX_NUMBER_TREE_LEAVES: usize = 256;

/// Upper bound on the number of source messages scanned for a single commit observation.
pub const ON_RAMP_MESSAGES_SCAN_LIMIT: u64 = MAX_NUMBER_TREE_LEAVES as u64 * 2;

/// If the highest inflight sequence number runs this far ahead of the commit store, the
/// inflight cache is considered desynchronized and is reset.
pub const MAX_INFLIGHT_SEQ_NUM_GAP: u64 = 500;

/// Ceiling for an encoded commit report.
pub const MAX_COMMIT_REPORT_LENGTH: usize = 10_000;

/// Ceiling for an encoded execution report.
pub const MAX_EXECUTION_REPORT_LENGTH: usize = 250_000;

/// Ceiling for an encoded observation.
pub const MAX_OBSERVATION_LENGTH: usize = 250_000;

/// Default cap on the summed payload length of one execution batch.
pub const DEFAULT_MAX_DATA_LEN_PER_BATCH: usize = 60_000;

/// Default number of messages loaded per super-batch of commit reports.
pub const DEFAULT_MESSAGES_ITERATION_STEP: u64 = 1024;

/// Default time budget for fetching off-chain token data across one batch.
pub const DEFAULT_TOKEN_DATA_WAIT_PER_BATCH: Duration = Duration::from_secs(2);

/// Default multiplier applied to the inflight cache expiry for price updates.
pub const PRICE_EXPIRY_MULTIPLIER: u32 = 3;

/// One USD (and one whole 18-decimals token) in base units.
pub const ONE_E18: u128 = 1_000_000_000_000_000_000;

/// Parts-per-billion denominator used by deviation checks.
pub const PPB: u64 = 1_000_000_000;

/// Gas charged per byte of calldata.
pub const CALLDATA_GAS_PER_BYTE: u64 = 16;

/// Length of an EVM address in bytes.
pub const EVM_ADDRESS_LENGTH_BYTES: u64 = 20;

/// Length of an EVM word in bytes.
pub const EVM_WORD_BYTES: u64 = 32;

/// Fixed-size part of an encoded message.
pub const CONSTANT_MESSAGE_PART_BYTES: u64 = 10 * 32;

/// Gas spent by the destination rate limiter per message.
pub const RATE_LIMITER_OVERHEAD_GAS: u64 = 2_100 + 5_000;

/// Gas spent per transferred token (pool lookup, release and balance update).
pub const PER_TOKEN_OVERHEAD_GAS: u64 = 2_100 + 5_000 + 2_100;

/// Gas spent writing the execution state of a message.
pub const EXECUTION_STATE_PROCESSING_OVERHEAD_GAS: u64 = 2_100 + 20_000 + 100;

/// Fixed gas added to a message gas limit when pricing its execution.
pub const FEE_BOOSTING_OVERHEAD_GAS: u64 = 200_000;
