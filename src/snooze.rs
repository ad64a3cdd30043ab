//! Snoozed commit roots.
//!
//! The execution engine stops reconsidering a root temporarily when it yields no executable
//! message, and permanently once every message under it is executed and finalized.

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// Roots the execution engine skips, keyed by root with the time they wake up at.
#[derive(Debug)]
pub struct SnoozedRoots {
    roots: DashMap<B256, DateTime<Utc>>,
    snooze_time: Duration,
}

impl SnoozedRoots {
    /// Creates an empty cache that snoozes roots for `snooze_time`.
    pub fn new(snooze_time: Duration) -> Self {
        Self { roots: DashMap::new(), snooze_time }
    }

    /// Snoozes a root until `now + snooze_time`.
    pub fn snooze(&self, root: B256, now: DateTime<Utc>) {
        let until = chrono::TimeDelta::from_std(self.snooze_time)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        debug!(%root, %until, "Snoozing root");
        self.roots.insert(root, until);
    }

    /// Snoozes a root forever.
    pub fn mark_as_executed(&self, root: B256) {
        debug!(%root, "Root fully executed");
        self.roots.insert(root, DateTime::<Utc>::MAX_UTC);
    }

    /// Whether the root is snoozed at `now`.
    pub fn is_snoozed(&self, root: &B256, now: DateTime<Utc>) -> bool {
        self.roots.get(root).is_some_and(|until| *until > now)
    }

    /// Number of tracked roots, including expired snoozes not swept yet.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether no root is tracked.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Forgets roots whose snooze is over.
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.roots.retain(|_, until| *until > now);
    }
}
