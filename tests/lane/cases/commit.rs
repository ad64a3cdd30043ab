use crate::lane::*;
use alloy::primitives::Bytes;
use lane_relay::{
    merkle::MerkleTree,
    plugin::{AttributedObservation, ReportTimestamp, ReportingPlugin},
    types::{CommitObservation, Interval, Observation},
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn commits_sent_messages_with_prices() {
    let mut env = Environment::setup().await;
    env.send((1..=3).map(|seq_nr| message(seq_nr, seq_nr))).await;

    let report = env.commit_round().await.unwrap().unwrap();
    assert_eq!(report.interval, Interval::new(1, 3));

    let state = env.lane.state().await;
    let leaves: Vec<_> = state.send_requests.values().map(|r| r.message.messageId).collect();
    assert_eq!(report.merkleRoot, MerkleTree::new(&leaves).unwrap().root());
    assert_eq!(report.priceUpdates.gasPriceUpdates.len(), 1);
    assert_eq!(report.priceUpdates.gasPriceUpdates[0].destChainSelector, SOURCE);
    let mut tokens: Vec<_> =
        report.priceUpdates.tokenPriceUpdates.iter().map(|u| u.sourceToken).collect();
    tokens.sort();
    assert_eq!(tokens, [DEST_TOKEN, FEE_TOKEN]);
}

#[tokio::test]
async fn nothing_to_commit_after_prices_land() {
    let mut env = Environment::setup().await;
    env.send([message(1, 1)]).await;
    env.commit_round().await.unwrap().unwrap();

    assert!(env.commit_round().await.unwrap().is_none());
}

#[tokio::test]
async fn commits_consecutive_intervals() {
    let mut env = Environment::setup().await;
    env.send((1..=2).map(|seq_nr| message(seq_nr, seq_nr))).await;
    let first = env.commit_round().await.unwrap().unwrap();

    env.send((3..=5).map(|seq_nr| message(seq_nr, seq_nr))).await;
    let second = env.commit_round().await.unwrap().unwrap();

    assert_eq!(first.interval, Interval::new(1, 2));
    assert_eq!(second.interval, Interval::new(3, 5));
    assert!(second.priceUpdates.is_empty());
    assert_eq!(env.lane.state().await.next_seq_nr, 6);
}

#[tokio::test]
async fn pending_report_is_not_committed_twice() {
    let env = Environment::setup().await;
    env.send((1..=2).map(|seq_nr| message(seq_nr, seq_nr))).await;

    let timestamp = ReportTimestamp::new(1, 0);
    let cancel = CancellationToken::new();
    let mut observations = Vec::new();
    for (index, node) in env.commit.iter().enumerate() {
        let observation = node.observation(&cancel, timestamp, &Bytes::new()).await.unwrap();
        observations.push(AttributedObservation::new(observation, index as u8));
    }
    let report = env.commit[0]
        .report(&cancel, timestamp, &Bytes::new(), &observations)
        .await
        .unwrap()
        .unwrap();
    assert!(env.commit[0].should_accept_finalized_report(timestamp, &report).await.unwrap());

    // The accepting node moves past the pending interval, the others still observe it.
    let pending = env.commit[0].observation(&cancel, timestamp, &Bytes::new()).await.unwrap();
    let other = env.commit[1].observation(&cancel, timestamp, &Bytes::new()).await.unwrap();
    let pending = CommitObservation::decode(&pending).unwrap();
    let other = CommitObservation::decode(&other).unwrap();
    assert!(pending.interval.is_zero());
    assert_eq!(other.interval, Interval::new(1, 2));
}

#[tokio::test]
async fn no_report_while_commit_store_is_down() {
    let mut env = Environment::setup().await;
    env.send([message(1, 1)]).await;
    env.lane.state().await.down = true;

    assert!(env.commit_round().await.unwrap().is_none());

    env.lane.state().await.down = false;
    assert!(env.commit_round().await.unwrap().is_some());
}
