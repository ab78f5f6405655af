//! Update worker: retries, dead letters, shutdown and poison isolation.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use fleet_common::AgentUpdateInfo;
use fleet_cp_server::processor::{RetryPolicy, UpdateMessage, UpdateProcessor};
use uuid::Uuid;

use crate::mocks::{RecordingMetadataStore, eventually};

fn fast(policy: RetryPolicy) -> RetryPolicy {
    policy.with_backoff(Duration::from_millis(1), Duration::from_millis(1))
}

fn message(agent_id: Uuid) -> UpdateMessage {
    UpdateMessage {
        agent_id,
        update: AgentUpdateInfo::default(),
    }
}

#[tokio::test]
async fn failing_update_is_retried_indefinitely_by_default() {
    let id = Uuid::new_v4();
    let mds = Arc::new(RecordingMetadataStore::poisoned(id));
    let mut handle = UpdateProcessor::spawn(mds.clone(), fast(RetryPolicy::default()));

    handle.sender.send(message(id)).await.unwrap();

    let observed = Arc::clone(&mds);
    eventually(move || observed.attempts_for(id) >= 10).await;
    assert!(handle.dead_letters.try_recv().is_err());

    // Closing the channel hands the still-pending retry over as a dead letter.
    drop(handle.sender);
    handle.task.await.unwrap();
    let letter = handle.dead_letters.recv().await.unwrap();
    assert_eq!(letter.message.agent_id, id);
    assert!(letter.attempts >= 10);
}

#[tokio::test]
async fn transient_failures_are_retried_until_applied() {
    let id = Uuid::new_v4();
    let mds = Arc::new(RecordingMetadataStore::failing_first(2));
    let handle = UpdateProcessor::spawn(mds.clone(), fast(RetryPolicy::unbounded()));

    handle.sender.send(message(id)).await.unwrap();

    let observed = Arc::clone(&mds);
    eventually(move || observed.applied() == vec![id]).await;
    assert_eq!(mds.attempts_for(id), 3);
}

#[tokio::test]
async fn bounded_policy_dead_letters_after_max_attempts() {
    let id = Uuid::new_v4();
    let mds = Arc::new(RecordingMetadataStore::poisoned(id));
    let mut handle = UpdateProcessor::spawn(mds.clone(), fast(RetryPolicy::bounded(3)));

    handle.sender.send(message(id)).await.unwrap();

    let letter = tokio::time::timeout(Duration::from_secs(2), handle.dead_letters.recv())
        .await
        .expect("dead letter arrives")
        .unwrap();
    assert_eq!(letter.message, message(id));
    assert_eq!(letter.attempts, 3);
    assert!(letter.last_error.contains("poisoned"));
    assert_eq!(mds.attempts_for(id), 3);
}

#[tokio::test]
async fn poison_message_does_not_starve_other_agents() {
    let poison = Uuid::new_v4();
    let healthy: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    let mds = Arc::new(RecordingMetadataStore::poisoned(poison));
    let handle = UpdateProcessor::spawn(
        mds.clone(),
        RetryPolicy::unbounded().with_backoff(Duration::from_millis(20), Duration::from_millis(20)),
    );

    handle.sender.send(message(poison)).await.unwrap();
    for id in &healthy {
        handle.sender.send(message(*id)).await.unwrap();
    }

    let observed = Arc::clone(&mds);
    let expected = healthy.clone();
    eventually(move || observed.applied() == expected).await;
    assert!(mds.attempts_for(poison) >= 1);
}

#[tokio::test]
async fn closing_the_channel_stops_the_worker() {
    let mds = Arc::new(RecordingMetadataStore::default());
    let handle = UpdateProcessor::spawn(mds, RetryPolicy::default());

    drop(handle.sender);

    tokio::time::timeout(Duration::from_secs(1), handle.task)
        .await
        .expect("worker exits")
        .unwrap();
}

#[tokio::test]
async fn producers_stall_once_retry_set_is_full() {
    let poison = Uuid::new_v4();
    let mds = Arc::new(RecordingMetadataStore::poisoned(poison));
    let policy = RetryPolicy::unbounded()
        .with_backoff(Duration::from_secs(3_600), Duration::from_secs(3_600))
        .with_max_pending(4);
    let handle = UpdateProcessor::spawn(mds.clone(), policy);

    // Four parked retries plus one message buffered in the channel.
    for _ in 0..5 {
        tokio::time::timeout(Duration::from_secs(2), handle.sender.send(message(poison)))
            .await
            .expect("send completes while the retry set has room")
            .unwrap();
    }

    let blocked =
        tokio::time::timeout(Duration::from_millis(50), handle.sender.send(message(poison))).await;
    assert!(blocked.is_err(), "send must wait while retries are full");
    assert_eq!(mds.attempts_for(poison), 4);
}
