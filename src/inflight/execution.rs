use crate::{error::InflightError, time, types::Message};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// An execution batch accepted by this node.
#[derive(Debug, Clone)]
pub struct InflightExecutionReport {
    /// When the batch was accepted.
    pub created_at: DateTime<Utc>,
    /// Messages of the batch, ascending by sequence number.
    pub messages: Vec<Message>,
}

/// Execution batches accepted by this node.
#[derive(Debug)]
pub struct ExecutionInflight {
    reports: RwLock<Vec<InflightExecutionReport>>,
    cache_expiry: Duration,
}

impl ExecutionInflight {
    /// Creates an empty cache whose batches expire after `cache_expiry`.
    pub fn new(cache_expiry: Duration) -> Self {
        Self { reports: Default::default(), cache_expiry }
    }

    /// Registers an accepted batch.
    ///
    /// Fails if any message of the batch is already tracked, either by sequence number or by
    /// sender nonce.
    pub async fn add(&self, messages: Vec<Message>, now: DateTime<Utc>) -> Result<(), InflightError> {
        let mut reports = self.reports.write().await;

        for inflight in reports.iter().flat_map(|report| &report.messages) {
            for message in &messages {
                if inflight.sequenceNumber == message.sequenceNumber {
                    return Err(InflightError::SeqNrAlreadyInflight(message.sequenceNumber));
                }
                if inflight.sender == message.sender && inflight.nonce == message.nonce {
                    return Err(InflightError::NonceAlreadyInflight {
                        sender: message.sender,
                        nonce: message.nonce,
                    });
                }
            }
        }

        debug!(
            messages = messages.len(),
            first = messages.first().map(|m| m.sequenceNumber),
            "Tracking inflight execution report"
        );
        reports.push(InflightExecutionReport { created_at: now, messages });
        Ok(())
    }

    /// Snapshot of all inflight batches.
    pub async fn get_all(&self) -> Vec<InflightExecutionReport> {
        self.reports.read().await.clone()
    }

    /// Drops batches older than the cache expiry.
    pub async fn expire(&self, now: DateTime<Utc>) {
        let cutoff = time::before(now, self.cache_expiry);
        self.reports.write().await.retain(|report| report.created_at > cutoff);
    }
}
