use crate::{
    error::InflightError,
    time,
    types::{CommitReport, PriceUpdates, TimestampedPrice},
};
use alloy::primitives::{Address, B256, map::HashMap};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A commit report accepted by this node.
#[derive(Debug, Clone)]
struct InflightCommitReport {
    report: CommitReport,
    created_at: DateTime<Utc>,
}

/// Price updates carried by an accepted commit report.
#[derive(Debug, Clone)]
pub struct InflightPriceUpdate {
    /// The price updates.
    pub price_updates: PriceUpdates,
    /// When the report was accepted.
    pub created_at: DateTime<Utc>,
    /// Epoch and round of the report, see [`ReportTimestamp::epoch_and_round`].
    ///
    /// [`ReportTimestamp::epoch_and_round`]: crate::plugin::ReportTimestamp::epoch_and_round
    pub round_id: u64,
}

#[derive(Debug, Default)]
struct Inner {
    reports: HashMap<B256, InflightCommitReport>,
    price_updates: Vec<InflightPriceUpdate>,
}

/// Commit reports and price updates accepted by this node.
#[derive(Debug)]
pub struct CommitInflight {
    inner: RwLock<Inner>,
    cache_expiry: Duration,
    price_expiry: Duration,
}

impl CommitInflight {
    /// Creates an empty cache.
    ///
    /// Reports expire after `cache_expiry`, price updates after `cache_expiry ×
    /// price_expiry_multiplier`.
    pub fn new(cache_expiry: Duration, price_expiry_multiplier: u32) -> Self {
        Self {
            inner: Default::default(),
            cache_expiry,
            price_expiry: cache_expiry.saturating_mul(price_expiry_multiplier),
        }
    }

    /// Registers an accepted report.
    ///
    /// A report with a non-zero root is tracked until it expires; its root must not be in
    /// flight already and its interval must not overlap any inflight interval. Price updates
    /// are tracked separately whenever the report carries any.
    pub async fn add(
        &self,
        report: CommitReport,
        round_id: u64,
        now: DateTime<Utc>,
    ) -> Result<(), InflightError> {
        let mut inner = self.inner.write().await;

        if report.has_root() {
            if inner.reports.contains_key(&report.merkleRoot) {
                return Err(InflightError::RootAlreadyInflight(report.merkleRoot));
            }
            if let Some(overlapping) = inner.reports.values().find(|inflight| {
                let interval = &inflight.report.interval;
                interval.min <= report.interval.max && report.interval.min <= interval.max
            }) {
                return Err(InflightError::IntervalAlreadyInflight {
                    min: report.interval.min,
                    max: report.interval.max,
                    inflight_min: overlapping.report.interval.min,
                    inflight_max: overlapping.report.interval.max,
                });
            }
        }

        if !report.priceUpdates.is_empty() {
            inner.price_updates.push(InflightPriceUpdate {
                price_updates: report.priceUpdates.clone(),
                created_at: now,
                round_id,
            });
        }

        if report.has_root() {
            debug!(
                root = %report.merkleRoot,
                min = report.interval.min,
                max = report.interval.max,
                "Tracking inflight commit report"
            );
            inner.reports.insert(report.merkleRoot, InflightCommitReport { report, created_at: now });
        }

        Ok(())
    }

    /// Highest sequence number covered by an inflight report, `0` if there is none.
    pub async fn max_inflight_seq_nr(&self) -> u64 {
        self.inner.read().await.reports.values().map(|r| r.report.interval.max).max().unwrap_or(0)
    }

    /// Number of inflight commit reports.
    pub async fn num_reports(&self) -> usize {
        self.inner.read().await.reports.len()
    }

    /// The gas price of the latest inflight price update carrying one.
    ///
    /// The update with the highest round id wins, later registrations win ties. Zero prices
    /// are skipped.
    pub async fn latest_gas_price_update(&self) -> Option<TimestampedPrice> {
        let inner = self.inner.read().await;
        let mut latest: Option<(u64, TimestampedPrice)> = None;
        for update in &inner.price_updates {
            let Some(gas) = update.price_updates.gasPriceUpdates.first() else { continue };
            if gas.usdPerUnitGas.is_zero() {
                continue;
            }
            if latest.is_none_or(|(round_id, _)| round_id <= update.round_id) {
                latest = Some((
                    update.round_id,
                    TimestampedPrice { value: gas.usdPerUnitGas, timestamp: update.created_at },
                ));
            }
        }
        latest.map(|(_, price)| price)
    }

    /// The latest inflight price of every token with an inflight update.
    ///
    /// Same precedence as [`Self::latest_gas_price_update`], applied per token.
    pub async fn latest_token_price_updates(&self) -> HashMap<Address, TimestampedPrice> {
        let inner = self.inner.read().await;
        let mut latest: HashMap<Address, (u64, TimestampedPrice)> = HashMap::default();
        for update in &inner.price_updates {
            for token_update in &update.price_updates.tokenPriceUpdates {
                if token_update.usdPerToken.is_zero() {
                    continue;
                }
                let price = TimestampedPrice {
                    value: token_update.usdPerToken,
                    timestamp: update.created_at,
                };
                latest
                    .entry(token_update.sourceToken)
                    .and_modify(|entry| {
                        if entry.0 <= update.round_id {
                            *entry = (update.round_id, price);
                        }
                    })
                    .or_insert((update.round_id, price));
            }
        }
        latest.into_iter().map(|(token, (_, price))| (token, price)).collect()
    }

    /// Drops reports older than the cache expiry and price updates older than the price
    /// expiry.
    pub async fn expire(&self, now: DateTime<Utc>) {
        let report_cutoff = time::before(now, self.cache_expiry);
        let price_cutoff = time::before(now, self.price_expiry);

        let mut inner = self.inner.write().await;
        inner.reports.retain(|root, inflight| {
            let keep = inflight.created_at > report_cutoff;
            if !keep {
                debug!(%root, "Inflight commit report expired");
            }
            keep
        });
        inner.price_updates.retain(|update| update.created_at > price_cutoff);
    }

    /// Clears all state.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        warn!(
            reports = inner.reports.len(),
            price_updates = inner.price_updates.len(),
            "Resetting inflight commit reports"
        );
        *inner = Inner::default();
    }
}
