mod common;

use common::{start_session, start_session_with, FailingSerializer};
use delivery_pipeline::producer::{collect, DeliveryOutcome};
use delivery_pipeline::record::{record_key, UserRecord};
use delivery_pipeline::transport::fake::DeliveryMode;
use delivery_pipeline::{ErrorKind, TransportError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "raw.inventory";

#[tokio::test]
async fn test_five_submissions_resolve_with_increasing_offsets() {
    let (session, transport, outcomes) = start_session(|t| t);

    for index in 0..5 {
        session
            .submit(TOPIC, record_key(index), UserRecord::for_index(index, 8))
            .await
            .unwrap();
    }

    assert_eq!(session.drain(Duration::from_secs(5)).await, 0);
    assert_eq!(session.pending(), 0);

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 5);

    let mut by_key: Vec<_> = outcomes
        .iter()
        .map(|d| (d.key.clone(), d.outcome.offset().unwrap()))
        .collect();
    by_key.sort();
    assert_eq!(
        by_key,
        (0..5)
            .map(|i| (format!("user-{}", i), i as i64))
            .collect::<Vec<_>>()
    );
    assert!(outcomes
        .iter()
        .all(|d| d.record.name == format!("user:{}", d.seq)));

    let keys: Vec<_> = transport.accepted().into_iter().map(|a| a.key).collect();
    assert_eq!(keys, vec!["user-0", "user-1", "user-2", "user-3", "user-4"]);
}

#[tokio::test]
async fn test_drain_with_zero_timeout_returns_pending_count() {
    let (session, transport, outcomes) = start_session(|t| t.with_mode(DeliveryMode::Held));

    for index in 0..2 {
        session
            .submit(TOPIC, record_key(index), UserRecord::for_index(index, 8))
            .await
            .unwrap();
    }

    assert_eq!(session.drain(Duration::ZERO).await, 2);
    assert!(outcomes.lock().unwrap().is_empty());

    transport.release(1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.drain(Duration::ZERO).await, 1);

    transport.release_all();
    assert_eq!(session.drain(Duration::from_secs(5)).await, 0);
    assert_eq!(outcomes.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_drain_waits_for_late_outcomes() {
    let (session, _transport, outcomes) =
        start_session(|t| t.with_mode(DeliveryMode::Delayed(Duration::from_millis(30))));

    for index in 0..3 {
        session
            .submit(TOPIC, record_key(index), UserRecord::for_index(index, 8))
            .await
            .unwrap();
    }
    assert_eq!(session.pending(), 3);

    assert_eq!(session.drain(Duration::from_secs(5)).await, 0);
    assert_eq!(outcomes.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_exactly_one_outcome_per_accepted_submission() {
    let (session, _transport, outcomes) = start_session(|t| {
        t.with_mode(DeliveryMode::Held)
            .duplicate_reports()
            .fail_delivery(3, TransportError::transient("Local: Message timed out"))
    });

    for index in 0..10 {
        session
            .submit(TOPIC, record_key(index), UserRecord::for_index(index, 8))
            .await
            .unwrap();
    }
    session.transport().release_reversed();
    assert_eq!(session.drain(Duration::from_secs(5)).await, 0);
    tokio::task::yield_now().await;

    let outcomes = outcomes.lock().unwrap();
    let seqs: HashSet<_> = outcomes.iter().map(|d| d.seq).collect();
    assert_eq!(outcomes.len(), 10);
    assert_eq!(seqs.len(), 10);

    let failed: Vec<_> = outcomes
        .iter()
        .filter(|d| !d.outcome.is_success())
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key, "user-3");
    assert!(matches!(
        failed[0].outcome,
        DeliveryOutcome::Failure { kind: ErrorKind::Transient, .. }
    ));

    let stats = session.stats();
    assert_eq!(stats.succeeded, 9);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.unmatched, 10);
}

#[tokio::test]
async fn test_fire_and_collect_outcomes_in_handle_order() {
    let (session, transport, _outcomes) = start_session(|t| t.with_mode(DeliveryMode::Held));

    let mut handles = Vec::new();
    for index in 0..5 {
        handles.push(
            session
                .submit_tracked(TOPIC, record_key(index), UserRecord::for_index(index, 8))
                .await
                .unwrap(),
        );
    }
    assert_eq!(transport.held(), 5);

    transport.release_reversed();
    let delivered: Vec<_> = collect(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let keys: Vec<_> = delivered.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, vec!["user-0", "user-1", "user-2", "user-3", "user-4"]);
    assert_eq!(session.pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_tracks_concurrent_submission_and_observation() {
    let (session, _transport, outcomes) =
        start_session(|t| t.with_mode(DeliveryMode::Delayed(Duration::from_millis(1))));

    let batch = 20u64;
    let total = 200u64;
    for index in 0..total {
        session
            .submit(TOPIC, record_key(index), UserRecord::for_index(index, 8))
            .await
            .unwrap();

        let stats = session.stats();
        let resolved = stats.succeeded + stats.failed;
        assert!(stats.pending as u64 <= stats.accepted);
        assert!(resolved <= stats.accepted);

        if (index + 1) % batch == 0 {
            assert_eq!(session.drain(Duration::from_secs(10)).await, 0);
            let stats = session.stats();
            assert_eq!(stats.accepted, index + 1);
            assert_eq!(
                stats.pending as u64 + stats.succeeded + stats.failed,
                stats.accepted
            );
        }
    }

    assert_eq!(session.drain(Duration::from_secs(10)).await, 0);
    let stats = session.close(Duration::from_secs(1)).await.unwrap();
    assert_eq!(stats.accepted, total);
    assert_eq!(stats.succeeded, total);
    assert_eq!(stats.pending, 0);
    assert_eq!(outcomes.lock().unwrap().len(), total as usize);
}

#[tokio::test]
async fn test_serialization_failure_skips_only_that_record() {
    let serializer = Arc::new(FailingSerializer {
        fail_on: "user:2".to_string(),
    });
    let (session, transport, outcomes) = start_session_with(|t| t, serializer);

    for index in 0..5 {
        let result = session
            .submit(TOPIC, record_key(index), UserRecord::for_index(index, 8))
            .await;
        if index == 2 {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Rejected);
        } else {
            assert_eq!(result.unwrap(), index);
        }
    }

    assert_eq!(transport.attempts_for(2), 0);
    assert_eq!(transport.accepted().len(), 4);
    assert_eq!(session.drain(Duration::from_secs(5)).await, 0);
    assert_eq!(session.drain(Duration::ZERO).await, 0);

    let stats = session.stats();
    assert_eq!(stats.submitted, 5);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.accepted, 4);
    assert_eq!(stats.succeeded, 4);

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|d| d.key != "user-2"));
}
