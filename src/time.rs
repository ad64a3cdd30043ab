//! Time helpers.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Returns the instant `age` before `now`, saturating at the earliest representable time.
pub fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Returns the time elapsed between `earlier` and `now`, zero if `earlier` is in the future.
pub fn elapsed(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or_default()
}
