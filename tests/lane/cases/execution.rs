use crate::lane::*;
use alloy::primitives::{Address, B256, Bytes, U256, address};
use chrono::{TimeDelta, Utc};
use lane_relay::{
    readers::CommitStoreReader,
    types::{ExecutionReport, Message, TokenBucket},
};

const OTHER_SENDER: Address = address!("00000000000000000000000000000000000000bb");

async fn committed_root(env: &mut Environment, messages: Vec<Message>) -> B256 {
    env.send(messages).await;
    let report = env.commit_round().await.unwrap().unwrap();
    env.bless(report.merkleRoot).await;
    report.merkleRoot
}

fn seq_nrs(report: &ExecutionReport) -> Vec<u64> {
    report.sequence_numbers().collect()
}

#[tokio::test]
async fn executes_committed_root_once() {
    let mut env = Environment::setup().await;
    let root = committed_root(&mut env, (1..=3).map(|seq_nr| message(seq_nr, seq_nr)).collect())
        .await;

    let report = env.execution_round().await.unwrap().unwrap();
    assert_eq!(seq_nrs(&report), [1, 2, 3]);
    assert!(env.lane.verify_execution_report(&report).await.unwrap());

    assert!(env.execution_round().await.unwrap().is_none());
    let far_future = Utc::now() + TimeDelta::days(365 * 100);
    for node in &env.execution {
        assert!(node.snoozed_roots().is_snoozed(&root, far_future));
    }
}

#[tokio::test]
async fn waits_for_blessing() {
    let mut env = Environment::setup().await;
    env.send([message(1, 1)]).await;
    let root = env.commit_round().await.unwrap().unwrap().merkleRoot;

    assert!(env.execution_round().await.unwrap().is_none());

    env.bless(root).await;
    assert_eq!(seq_nrs(&env.execution_round().await.unwrap().unwrap()), [1]);
}

#[tokio::test]
async fn executes_roots_in_order() {
    let mut env = Environment::setup().await;
    committed_root(&mut env, vec![message(1, 1), message(2, 2)]).await;
    committed_root(&mut env, vec![message(3, 3), message(4, 4)]).await;

    assert_eq!(seq_nrs(&env.execution_round().await.unwrap().unwrap()), [1, 2]);
    assert_eq!(seq_nrs(&env.execution_round().await.unwrap().unwrap()), [3, 4]);
    assert!(env.execution_round().await.unwrap().is_none());
}

#[tokio::test]
async fn nonce_gap_blocks_the_sender() {
    let mut env = Environment::setup().await;
    committed_root(&mut env, vec![message(1, 1), message(2, 3)]).await;

    assert_eq!(seq_nrs(&env.execution_round().await.unwrap().unwrap()), [1]);
    assert!(env.execution_round().await.unwrap().is_none());
}

#[tokio::test]
async fn carries_token_data() {
    let mut env = Environment::setup().await;
    let token_data = Bytes::from_static(b"attestation");
    env.lane.state().await.token_data.insert((1, 0), token_data.clone());
    committed_root(&mut env, vec![token_message(1, 1, 100)]).await;

    let report = env.execution_round().await.unwrap().unwrap();
    assert_eq!(report.offchainTokenData, vec![vec![token_data]]);
}

#[tokio::test]
async fn token_data_outage_skips_only_token_transfers() {
    let mut env = Environment::setup().await;
    env.lane.state().await.token_data_not_ready.insert(1);
    let plain = Message { sender: OTHER_SENDER, ..message(2, 1) };
    committed_root(&mut env, vec![token_message(1, 1, 100), plain]).await;

    assert_eq!(seq_nrs(&env.execution_round().await.unwrap().unwrap()), [2]);

    env.lane.state().await.token_data_not_ready.clear();
    let snoozed = env.execution[0].snoozed_roots();
    assert!(snoozed.is_empty());
    assert_eq!(seq_nrs(&env.execution_round().await.unwrap().unwrap()), [1]);
}

#[tokio::test]
async fn underpaid_message_is_not_executed() {
    let mut env = Environment::setup().await;
    let underpaid = Message { feeTokenAmount: U256::from(1_000), ..message(1, 1) };
    let root = committed_root(&mut env, vec![underpaid]).await;

    assert!(env.execution_round().await.unwrap().is_none());
    assert!(env.execution[0].snoozed_roots().is_snoozed(&root, Utc::now()));
}

#[tokio::test]
async fn pool_rate_limit_holds_back_large_transfers() {
    let mut env = Environment::setup().await;
    env.lane
        .state()
        .await
        .pool_buckets
        .insert(DEST_TOKEN, TokenBucket { tokens: U256::from(50), is_enabled: true });
    let small = Message { sender: OTHER_SENDER, ..token_message(2, 1, 10) };
    committed_root(&mut env, vec![token_message(1, 1, 100), small]).await;

    assert_eq!(seq_nrs(&env.execution_round().await.unwrap().unwrap()), [2]);
}
