//! Consensus reductions over independent observations.
//!
//! Every function here is a deterministic reduction of `(observations, f)`, where `f` is the
//! number of faulty nodes tolerated. Agreement requires more than `f` concurring
//! observations.

use crate::{
    constants::PPB,
    error::CommitError,
    plugin::AttributedObservation,
    types::{ExecutionObservation, Interval, Observation, ObservedMessage},
};
use alloy::{
    primitives::{B256, Bytes, U256, keccak256, map::HashMap},
    sol_types::SolValue,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Decodes observations, dropping and logging the ones that fail to parse.
pub fn parse_observations<T: Observation>(observations: &[AttributedObservation]) -> Vec<T> {
    observations
        .iter()
        .filter_map(|obs| match T::decode(&obs.observation) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(observer = obs.observer, %err, "Dropping unparsable observation");
                None
            }
        })
        .collect()
}

/// The sorted middle element, index `len / 2`. `None` for an empty input.
pub fn median(mut values: Vec<U256>) -> Option<U256> {
    values.sort_unstable();
    values.get(values.len() / 2).copied()
}

/// Whether `new` deviates from `old` by more than `ppb` parts per billion of `new`.
///
/// A zero `new` deviates from any non-zero `old`.
pub fn deviates(new: U256, old: U256, ppb: u64) -> bool {
    if new.is_zero() {
        return !old.is_zero();
    }
    let diff = new.abs_diff(old);
    match diff.checked_mul(U256::from(PPB)) {
        Some(scaled) => scaled / new > U256::from(ppb),
        None => true,
    }
}

/// Reduces per-node intervals into one.
///
/// Each endpoint takes the `f`-th smallest value, so at least one honest node vouches for
/// it. A zero lower bound yields the empty interval. The result never spans more than
/// `range_limit` sequence numbers. Returns `None` when there are not enough intervals.
pub fn interval_consensus(
    intervals: &[Interval],
    f: usize,
    range_limit: u64,
) -> Result<Option<Interval>, CommitError> {
    let mut mins: Vec<u64> = intervals.iter().map(|interval| interval.min).collect();
    mins.sort_unstable();
    let Some(&min) = mins.get(f) else {
        return Ok(None);
    };
    if min == 0 {
        return Ok(Some(Interval::default()));
    }

    let mut maxes: Vec<u64> = intervals.iter().map(|interval| interval.max).collect();
    maxes.sort_unstable();
    let max = maxes[f];
    if max < min {
        return Err(CommitError::MaxBelowMin { min, max });
    }

    let max = max.min(min.saturating_add(range_limit.max(1) - 1));
    Ok(Some(Interval::new(min, max)))
}

/// Hash identifying a set of off-chain token data.
pub fn token_data_hash(token_data: &[Bytes]) -> B256 {
    keccak256(token_data.to_vec().abi_encode())
}

/// Reduces per-node executable messages into the consensus batch.
///
/// Votes are tallied per `(sequence number, token data hash)`. A sequence number is kept
/// when one of its variants gathers more than `f` votes; between variants with equal
/// support the smallest token data hash wins. The result is ordered by sequence number.
pub fn observed_messages_consensus(
    observations: &[ExecutionObservation],
    f: usize,
) -> Vec<(u64, ObservedMessage)> {
    let mut tally: HashMap<(u64, B256), (usize, &ObservedMessage)> = HashMap::default();
    for obs in observations {
        for (seq_nr, msg) in &obs.messages {
            let key = (*seq_nr, token_data_hash(&msg.token_data));
            tally.entry(key).or_insert((0, msg)).0 += 1;
        }
    }

    let mut keys: Vec<_> = tally.keys().copied().collect();
    keys.sort_unstable_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut winners: BTreeMap<u64, (usize, &ObservedMessage)> = BTreeMap::new();
    for key in keys {
        let (votes, msg) = tally[&key];
        if votes <= f {
            continue;
        }
        match winners.get(&key.0) {
            Some((existing, _)) if *existing >= votes => {}
            _ => {
                winners.insert(key.0, (votes, msg));
            }
        }
    }

    winners.into_iter().map(|(seq_nr, (_, msg))| (seq_nr, msg.clone())).collect()
}

/// Length of the longest prefix of `len` items accepted by `fits`, found by binary search.
///
/// `fits` must be monotonic: if a prefix fits, every shorter prefix fits too.
pub fn longest_fitting_prefix(len: usize, fits: impl Fn(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if fits(mid) { lo = mid } else { hi = mid - 1 }
    }
    lo
}
