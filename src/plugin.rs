//! Boundary with the consensus runtime.
//!
//! The runtime drives both engines through the five callbacks of [`ReportingPlugin`] once per
//! round. It owns leader election, vote counting, transmission and retry cadence; rounds may
//! overlap, so implementations must tolerate concurrent calls.

use crate::error::PluginError;
use alloy::primitives::Bytes;
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Identifies the round a callback runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportTimestamp {
    /// Consensus epoch.
    pub epoch: u32,
    /// Round within the epoch.
    pub round: u8,
}

impl ReportTimestamp {
    /// Creates a new [`ReportTimestamp`].
    pub const fn new(epoch: u32, round: u8) -> Self {
        Self { epoch, round }
    }

    /// Epoch and round merged into a single monotonically increasing round id.
    pub const fn epoch_and_round(&self) -> u64 {
        ((self.epoch as u64) << 8) | self.round as u64
    }
}

/// An observation together with the index of the node that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributedObservation {
    /// The encoded observation.
    pub observation: Bytes,
    /// Index of the observing node.
    pub observer: u8,
}

impl AttributedObservation {
    /// Creates a new [`AttributedObservation`].
    pub fn new(observation: impl Into<Bytes>, observer: u8) -> Self {
        Self { observation: observation.into(), observer }
    }
}

/// The callbacks a reporting engine exposes to the consensus runtime.
#[async_trait]
pub trait ReportingPlugin: Send + Sync {
    /// Leader query. Both engines use an empty query.
    async fn query(&self, timestamp: ReportTimestamp) -> Result<Bytes, PluginError>;

    /// Local observation for the round.
    async fn observation(
        &self,
        cancel: &CancellationToken,
        timestamp: ReportTimestamp,
        query: &Bytes,
    ) -> Result<Bytes, PluginError>;

    /// Reduces the observations of the round into a report, `None` when there is nothing to
    /// report.
    async fn report(
        &self,
        cancel: &CancellationToken,
        timestamp: ReportTimestamp,
        query: &Bytes,
        observations: &[AttributedObservation],
    ) -> Result<Option<Bytes>, PluginError>;

    /// Decides whether a report that reached consensus should be accepted.
    async fn should_accept_finalized_report(
        &self,
        timestamp: ReportTimestamp,
        report: &Bytes,
    ) -> Result<bool, PluginError>;

    /// Decides whether an accepted report should still be transmitted.
    async fn should_transmit_accepted_report(
        &self,
        timestamp: ReportTimestamp,
        report: &Bytes,
    ) -> Result<bool, PluginError>;
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<F, T, E>(cancel: &CancellationToken, fut: F) -> Result<T, PluginError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PluginError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PluginError::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}
