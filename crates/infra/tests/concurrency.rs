//! Racing operations on one transaction reference.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use branchledger_accounting::{AckDecision, BatchStatus, PostingError};
use branchledger_core::BranchId;
use branchledger_infra::InMemoryPostingEngine;

use common::*;

const ROUNDS: usize = 20;

fn reject(reason: &str) -> AckDecision {
    AckDecision::Reject {
        reason: reason.to_string(),
    }
}

async fn staged_transfer(reference: &str) -> Arc<InMemoryPostingEngine> {
    let engine = engine().await;
    let outcome = engine.submit(transfer(reference, 5_000)).await.unwrap();
    assert_eq!(outcome.status, BatchStatus::AwaitingAcknowledgement);
    engine
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_of_one_reference_stage_and_post_once() {
    let engine = engine().await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.submit(deposit("TX-1", 10_000)).await })
        })
        .collect();

    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.status, BatchStatus::Confirmed);
                accepted += 1;
            }
            Err(err) => assert!(
                matches!(err.posting(), Some(PostingError::DuplicateTransaction(_))),
                "unexpected error: {err}"
            ),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(engine.entries(&code("TX-1")).await.unwrap().len(), 3);
    assert_eq!(balance(&engine, "BR1", "2100").await, 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_commit_exactly_once() {
    for _ in 0..ROUNDS {
        let engine = staged_transfer("TX-2").await;
        let (br1, br2): (BranchId, BranchId) = (code("BR1"), code("BR2"));
        let reference = code("TX-2");

        let (first, second) = tokio::join!(
            engine.acknowledge(&reference, &br1, AckDecision::Approve),
            engine.acknowledge(&reference, &br2, AckDecision::Approve),
        );

        let statuses = [first.unwrap(), second.unwrap()];
        assert!(statuses.contains(&BatchStatus::Confirmed));
        assert!(statuses.contains(&BatchStatus::PartiallyAcknowledged));
        let staged = engine.batch(&reference).await.unwrap().unwrap();
        assert!(staged.is_committed());
        assert_eq!(engine.entries(&reference).await.unwrap().len(), 2);
        assert_eq!(balance(&engine, "BR2", "2100").await, 5_000);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn approval_racing_rejection_never_posts() {
    for _ in 0..ROUNDS {
        let engine = staged_transfer("TX-2").await;
        let (br1, br2): (BranchId, BranchId) = (code("BR1"), code("BR2"));
        let reference = code("TX-2");

        let (approve, refuse) = tokio::join!(
            engine.acknowledge(&reference, &br1, AckDecision::Approve),
            engine.acknowledge(&reference, &br2, reject("insufficient cover")),
        );
        approve.unwrap();
        assert_eq!(refuse.unwrap(), BatchStatus::Rejected);

        let staged = engine.batch(&reference).await.unwrap().unwrap();
        assert_eq!(staged.status(), BatchStatus::Rejected);
        assert!(engine.entries(&reference).await.unwrap().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_final_approval_has_one_terminal_outcome() {
    for _ in 0..ROUNDS {
        let engine = staged_transfer("TX-2").await;
        let (br1, br2): (BranchId, BranchId) = (code("BR1"), code("BR2"));
        let reference = code("TX-2");
        engine
            .acknowledge(&reference, &br1, AckDecision::Approve)
            .await
            .unwrap();

        let (approve, cancel) = tokio::join!(
            engine.acknowledge(&reference, &br2, AckDecision::Approve),
            engine.cancel(&reference, "customer withdrew"),
        );

        let staged = engine.batch(&reference).await.unwrap().unwrap();
        let entries = engine.entries(&reference).await.unwrap();
        match staged.status() {
            BatchStatus::Confirmed => {
                // approval won; cancelling a confirmed batch is refused
                assert_eq!(approve.unwrap(), BatchStatus::Confirmed);
                assert!(matches!(
                    cancel.unwrap_err().posting(),
                    Some(PostingError::InvalidTransition { .. })
                ));
                assert!(staged.is_committed());
                assert_eq!(entries.len(), 2);
            }
            BatchStatus::Rejected => {
                // cancel won; the late approval is ignored
                assert_eq!(cancel.unwrap(), BatchStatus::Rejected);
                assert_eq!(approve.unwrap(), BatchStatus::Rejected);
                assert!(!staged.is_committed());
                assert!(entries.is_empty());
            }
            other => panic!("batch left in {other}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn approvals_racing_the_timeout_sweep_still_commit_once() {
    for _ in 0..ROUNDS {
        let engine = staged_transfer("TX-2").await;
        let (br1, br2): (BranchId, BranchId) = (code("BR1"), code("BR2"));
        let reference = code("TX-2");
        let overdue = Utc::now() + ChronoDuration::hours(2);

        let (first, second, sweep) = tokio::join!(
            engine.acknowledge(&reference, &br1, AckDecision::Approve),
            engine.acknowledge(&reference, &br2, AckDecision::Approve),
            engine.sweep(overdue),
        );
        first.unwrap();
        second.unwrap();
        let report = sweep.unwrap();
        assert!(report.flagged.len() <= 1);

        let staged = engine.batch(&reference).await.unwrap().unwrap();
        assert_eq!(staged.status(), BatchStatus::Confirmed);
        assert!(staged.is_committed());
        assert_eq!(engine.entries(&reference).await.unwrap().len(), 2);

        // at most one notice, and none once the batch is settled
        let again = engine.sweep(overdue).await.unwrap();
        assert!(again.flagged.is_empty());
    }
}
