//! Metrics of the reporting engines.
//!
//! Only recorded here. Installing a recorder and exporting belongs to the embedding process.

use crate::batching::SkipReason;
use metrics::{Counter, Gauge, Histogram, counter};
use metrics_derive::Metrics;

/// Commit engine metrics.
#[derive(Metrics)]
#[metrics(scope = "commit")]
pub struct CommitMetrics {
    /// Number of messages in the interval observed by this node.
    pub observed_interval_size: Histogram,
    /// Number of messages in the interval of agreed reports.
    pub reported_interval_size: Histogram,
    /// Highest sequence number of an agreed report.
    pub last_reported_seq_nr: Gauge,
    /// Number of inflight commit reports.
    pub inflight_reports: Gauge,
    /// Number of token price updates in agreed reports.
    pub token_price_updates: Counter,
    /// Number of gas price updates in agreed reports.
    pub gas_price_updates: Counter,
    /// Reports rejected as stale.
    pub stale_reports: Counter,
}

/// Execution engine metrics.
#[derive(Metrics)]
#[metrics(scope = "execution")]
pub struct ExecutionMetrics {
    /// Number of unexpired commit reports seen by the last observation.
    pub unexpired_roots: Gauge,
    /// Number of messages in observed batches.
    pub observed_batch_size: Histogram,
    /// Number of messages in agreed reports.
    pub reported_batch_size: Histogram,
    /// Number of snoozed roots.
    pub snoozed_roots: Gauge,
    /// Reports rejected as stale.
    pub stale_reports: Counter,
}

/// Records a message skipped by batch selection.
pub fn record_skipped_message(reason: SkipReason) {
    counter!(
        "execution.skipped_messages",
        "reason" => <&'static str>::from(reason)
    )
    .increment(1);
}
