//! Per-node observations exchanged through consensus.
//!
//! Observations are JSON encoded over ordered maps so that identical state always yields
//! byte-identical observations.

use super::Interval;
use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;

/// Encoding shared by all observations.
pub trait Observation: Serialize + DeserializeOwned {
    /// Encodes the observation.
    fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Into::into)
    }

    /// Decodes an observation.
    fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// What a node saw for the commit engine: the next interval and current prices.
///
/// Prices are optional so that observations from faulty nodes, which may omit values, still
/// decode and can be rejected individually.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitObservation {
    /// The interval of new messages, `(0, 0)` if none.
    pub interval: Interval,
    /// USD price per 1e18 base units of each destination token.
    pub token_prices_usd: BTreeMap<Address, Option<U256>>,
    /// USD price of a unit of source gas.
    pub source_gas_price_usd: Option<U256>,
}

impl Observation for CommitObservation {}

/// Off-chain data observed for one executable message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedMessage {
    /// One entry per token amount of the message, empty when no attestation is needed.
    pub token_data: Vec<Bytes>,
}

impl ObservedMessage {
    /// Creates a new [`ObservedMessage`].
    pub fn new(token_data: Vec<Bytes>) -> Self {
        Self { token_data }
    }
}

/// What a node saw for the execution engine: executable messages of a single root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionObservation {
    /// Executable messages keyed by sequence number.
    pub messages: BTreeMap<u64, ObservedMessage>,
}

impl ExecutionObservation {
    /// Builds an observation from `(sequence number, message)` pairs.
    pub fn new(messages: impl IntoIterator<Item = (u64, ObservedMessage)>) -> Self {
        Self { messages: messages.into_iter().collect() }
    }
}

impl Observation for ExecutionObservation {}
