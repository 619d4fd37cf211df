//! Black-box tests for direct-confirm postings, commit failures and reversals.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};

use branchledger_accounting::{
    AccountDetermination, AccountKey, AccountStatus, BatchCommand, BatchEvent, BatchStatus,
    CommitResult, ConfigCommand, EntryBatch, EntryBuilder, LedgerAccount, PostedEntry, PostingError,
    PostingRequest, Resolver, StagedBatch,
};
use branchledger_core::{Aggregate, Direction, DomainError, ExpectedVersion, Percentage, TransactionRef};
use branchledger_events::{Event, EventBus, EventEnvelope, InMemoryEventBus};
use branchledger_infra::{
    EngineError, InMemoryBranchGateway, InMemoryLedgerStore, InMemoryStagedBatchStore, LedgerStore,
    PostingEngine, ReconciliationNotice, StagedBatchStore, StoreError,
};

use common::*;

#[tokio::test]
async fn deposit_splits_seventy_thirty_and_posts_immediately() {
    let engine = engine().await;

    let outcome = engine.submit(deposit("TX-1", 10_000)).await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Confirmed);
    assert!(outcome.required_acknowledgers.is_empty());
    assert_eq!(outcome.posted_entries.len(), 3);
    assert_eq!(balance(&engine, "BR1", "1000").await, 7_000);
    assert_eq!(balance(&engine, "BR1", "1010").await, 3_000);
    assert_eq!(balance(&engine, "BR1", "2100").await, 10_000);

    let entries = engine.entries(&code("TX-1")).await.unwrap();
    let debits: i64 = entries.iter().filter(|e| e.direction == Direction::Debit).map(|e| e.amount).sum();
    let credits: i64 = entries.iter().filter(|e| e.direction == Direction::Credit).map(|e| e.amount).sum();
    assert_eq!(debits, credits);

    let staged = engine.batch(&code("TX-1")).await.unwrap().unwrap();
    assert!(staged.is_committed());
    assert!(staged.rows().iter().all(|row| row.consumed));
}

#[tokio::test]
async fn odd_amounts_keep_the_residual_on_the_first_leg() {
    let engine = engine().await;

    engine.submit(deposit("TX-ODD", 10_001)).await.unwrap();

    assert_eq!(balance(&engine, "BR1", "1000").await, 7_001);
    assert_eq!(balance(&engine, "BR1", "1010").await, 3_000);
    assert_eq!(balance(&engine, "BR1", "2100").await, 10_001);
}

#[tokio::test]
async fn loan_template_posts_formula_legs_against_the_contra() {
    let engine = engine().await;

    let outcome = engine.submit(disbursement("LN-1", 100_000, 1_000)).await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Confirmed);
    assert_eq!(balance(&engine, "BR1", "1300").await, 100_000);
    assert_eq!(balance(&engine, "BR1", "4100").await, 1_000);
    assert_eq!(balance(&engine, "BR1", "2400").await, 150);
    assert_eq!(balance(&engine, "BR1", "1000").await, -98_850);
}

#[tokio::test]
async fn duplicate_reference_is_rejected_without_posting_twice() {
    let engine = engine().await;
    engine.submit(deposit("TX-1", 10_000)).await.unwrap();

    let err = engine.submit(deposit("TX-1", 10_000)).await.unwrap_err();

    assert!(matches!(err.posting(), Some(PostingError::DuplicateTransaction(_))));
    assert_eq!(balance(&engine, "BR1", "2100").await, 10_000);
}

#[tokio::test]
async fn build_failures_leave_nothing_staged() {
    let engine = engine().await;

    let unknown = PostingRequest::new(
        code("WITHDRAW@SAV001"),
        500,
        code("BR1"),
        code("TX-404"),
    );
    let err = engine.submit(unknown).await.unwrap_err();
    assert!(matches!(err.posting(), Some(PostingError::RuleNotFound { .. })));
    assert!(engine.batch(&code("TX-404")).await.unwrap().is_none());

    let mut missing_fee = disbursement("LN-2", 100_000, 0);
    missing_fee.variables.fee = None;
    let err = engine.submit(missing_fee).await.unwrap_err();
    assert!(matches!(err.posting(), Some(PostingError::FormulaEvaluation { .. })));
    assert!(engine.batch(&code("LN-2")).await.unwrap().is_none());
}

#[tokio::test]
async fn missing_account_moves_batch_to_pending_retry_then_retry_commits() {
    let engine = engine().await;
    let request = PostingRequest::new(
        code("DEPOSIT@SAV001"),
        10_000,
        code("BR3"),
        code("TX-BR3"),
    );

    let err = engine.submit(request).await.unwrap_err();
    assert!(matches!(err.posting(), Some(PostingError::AccountNotFound { .. })));

    let staged = engine.batch(&code("TX-BR3")).await.unwrap().unwrap();
    assert_eq!(staged.status(), BatchStatus::RejectedPendingRetry);
    assert_eq!(staged.commit_failures(), 1);
    assert!(engine.entries(&code("TX-BR3")).await.unwrap().is_empty());

    open_chart(&engine, "BR3").await;
    let status = engine.retry_commit(&code("TX-BR3")).await.unwrap();

    assert_eq!(status, BatchStatus::Confirmed);
    assert_eq!(balance(&engine, "BR3", "1000").await, 7_000);
    assert_eq!(engine.entries(&code("TX-BR3")).await.unwrap().len(), 3);
}

#[tokio::test]
async fn closed_account_rolls_back_the_whole_batch() {
    let engine = engine().await;
    engine.close_account(&key("BR1", "1010")).await.unwrap();

    let err = engine.submit(deposit("TX-1", 10_000)).await.unwrap_err();

    assert!(matches!(err.posting(), Some(PostingError::AccountClosed { .. })));
    assert_eq!(balance(&engine, "BR1", "1000").await, 0);
    assert_eq!(balance(&engine, "BR1", "2100").await, 0);
    let staged = engine.batch(&code("TX-1")).await.unwrap().unwrap();
    assert_eq!(staged.status(), BatchStatus::RejectedPendingRetry);
    assert!(staged.last_commit_error().is_some_and(|e| e.contains("closed")));
}

#[tokio::test]
async fn retry_commit_requires_a_failed_commit() {
    let engine = engine().await;
    engine.submit(deposit("TX-1", 10_000)).await.unwrap();

    let err = engine.retry_commit(&code("TX-1")).await.unwrap_err();

    assert!(matches!(err.posting(), Some(PostingError::InvalidTransition { .. })));
}

#[tokio::test]
async fn reversal_nets_every_balance_to_zero() {
    let engine = engine().await;
    engine.submit(deposit("TX-1", 10_000)).await.unwrap();

    let outcome = engine.reverse(&code("TX-1")).await.unwrap();

    assert_eq!(outcome.reference.as_str(), "REV:TX-1");
    assert_eq!(outcome.status, BatchStatus::Confirmed);
    for account in ["1000", "1010", "2100"] {
        assert_eq!(balance(&engine, "BR1", account).await, 0, "account {account}");
    }

    let original = engine.batch(&code("TX-1")).await.unwrap().unwrap();
    assert_eq!(original.status(), BatchStatus::Reversed);
    assert_eq!(original.reversed_by(), Some(&outcome.reference));

    let reversal_entries = engine.entries(&outcome.reference).await.unwrap();
    assert_eq!(reversal_entries.len(), 3);
    assert!(reversal_entries.iter().all(|e| e.reverses.as_ref() == Some(&code("TX-1"))));

    let again = engine.reverse(&code("TX-1")).await.unwrap_err();
    assert!(matches!(again.posting(), Some(PostingError::InvalidTransition { .. })));
}

#[tokio::test]
async fn unknown_reference_is_reported() {
    let engine = engine().await;

    let err = engine.reverse(&code("NOPE")).await.unwrap_err();

    assert!(matches!(err, EngineError::UnknownTransaction(_)));
}

#[tokio::test]
async fn reversal_references_are_reserved() {
    let engine = engine().await;

    let err = engine.submit(deposit("REV:TX-1", 500)).await.unwrap_err();

    assert!(matches!(
        err.posting(),
        Some(PostingError::Domain(DomainError::InvalidCode { .. }))
    ));
    assert!(engine.batch(&code("REV:TX-1")).await.unwrap().is_none());
    assert_eq!(balance(&engine, "BR1", "2100").await, 0);
}

#[tokio::test]
async fn unrelated_batch_under_the_reversal_reference_blocks_the_reversal() {
    let engine = engine().await;
    let mut foreign = EntryBuilder::new(Resolver::new(&engine.registry()))
        .build(&transfer("XFER-1", 5_000))
        .unwrap();
    foreign.reference = code("REV:TX-2");
    let mut staged = StagedBatch::empty(foreign.reference.clone());
    staged
        .execute(&BatchCommand::Stage {
            batch: foreign,
            at: Utc::now(),
        })
        .unwrap();
    engine
        .staged_store()
        .save(&staged, ExpectedVersion::NEW)
        .await
        .unwrap();
    engine.submit(deposit("TX-2", 10_000)).await.unwrap();

    let err = engine.reverse(&code("TX-2")).await.unwrap_err();

    assert!(matches!(
        err.posting(),
        Some(PostingError::Domain(DomainError::Conflict(_)))
    ));
    let original = engine.batch(&code("TX-2")).await.unwrap().unwrap();
    assert_eq!(original.status(), BatchStatus::Confirmed);
    assert_eq!(original.reversed_by(), None);
    let foreign = engine.batch(&code("REV:TX-2")).await.unwrap().unwrap();
    assert_eq!(foreign.status(), BatchStatus::AwaitingAcknowledgement);
    assert!(engine.entries(&code("REV:TX-2")).await.unwrap().is_empty());
    assert_eq!(balance(&engine, "BR1", "2100").await, 10_000);
    assert_eq!(balance(&engine, "BR2", "2100").await, 0);
}

#[tokio::test]
async fn longest_accepted_reference_can_still_be_reversed() {
    let engine = engine().await;
    let longest = "T".repeat(TransactionRef::MAX_SUBMITTED_LEN);

    let too_long = engine.submit(deposit(&format!("{longest}X"), 100)).await;
    assert!(too_long.is_err());

    engine.submit(deposit(&longest, 10_000)).await.unwrap();
    let outcome = engine.reverse(&code(&longest)).await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Confirmed);
    assert_eq!(outcome.reference.as_str(), format!("REV:{longest}"));
    assert_eq!(engine.entries(&outcome.reference).await.unwrap().len(), 3);
    assert_eq!(balance(&engine, "BR1", "2100").await, 0);
}

#[tokio::test]
async fn every_transition_is_published_on_the_audit_bus() {
    let engine = engine().await;
    let audit = engine.audit_bus().subscribe();

    engine.submit(deposit("TX-1", 10_000)).await.unwrap();

    let envelopes = audit.drain();
    let types: Vec<&str> = envelopes.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec!["posting.batch.staged", "posting.batch.confirmed", "posting.batch.committed"]
    );
    let sequence: Vec<u64> = envelopes.iter().map(|e| e.sequence_number()).collect();
    assert_eq!(sequence, vec![1, 2, 3]);
    assert!(envelopes.iter().all(|e| e.branch_id().as_str() == "BR1"));
    assert_eq!(envelopes[2].payload().event_type(), "posting.batch.committed");
}

#[tokio::test]
async fn configuration_changes_swap_the_registry_snapshot() {
    let engine = engine().await;
    let before = engine.registry();

    let mismatch = ConfigCommand::ReplaceDeterminations {
        rule: code("R-DEP"),
        attribute: None,
        rows: vec![
            AccountDetermination {
                rule: code("R-DEP"),
                attribute: None,
                account: code("1000"),
                allocation_percentage: Percentage::from_whole(70).unwrap(),
                allocation_formula: None,
                branch_side: None,
            },
            AccountDetermination {
                rule: code("R-DEP"),
                attribute: None,
                account: code("1010"),
                allocation_percentage: Percentage::from_whole(20).unwrap(),
                allocation_formula: None,
                branch_side: None,
            },
        ],
    };
    let err = engine.apply_config(mismatch).unwrap_err();
    assert!(matches!(
        err.posting(),
        Some(PostingError::AllocationMismatch { actual_bp: 9_000, .. })
    ));
    assert_eq!(engine.registry().version(), before.version());

    let version = engine.apply_config(ConfigCommand::DeactivateRule(code("R-DEP"))).unwrap();
    assert_eq!(version, before.version() + 1);
    // the old snapshot is untouched
    assert!(before.rule(&code("R-DEP")).is_some_and(|r| r.active));

    let err = engine.submit(deposit("TX-1", 10_000)).await.unwrap_err();
    assert!(matches!(err.posting(), Some(PostingError::RuleNotFound { .. })));

    let version = engine.load_registry(registry().to_document()).unwrap();
    assert_eq!(version, before.version() + 2);
    engine.submit(deposit("TX-1", 10_000)).await.unwrap();
}

/// Ledger that reports optimistic conflicts for its first commits.
struct ContendedLedger {
    inner: InMemoryLedgerStore,
    conflicts: AtomicU32,
}

#[async_trait::async_trait]
impl LedgerStore for ContendedLedger {
    async fn open_account(&self, account: LedgerAccount) -> Result<LedgerAccount, StoreError> {
        self.inner.open_account(account).await
    }

    async fn set_account_status(
        &self,
        key: &AccountKey,
        status: AccountStatus,
    ) -> Result<LedgerAccount, StoreError> {
        self.inner.set_account_status(key, status).await
    }

    async fn account(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, StoreError> {
        self.inner.account(key).await
    }

    async fn commit(&self, batch: &EntryBatch, at: DateTime<Utc>) -> Result<CommitResult, StoreError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Concurrency("account moved underneath".into()));
        }
        self.inner.commit(batch, at).await
    }

    async fn committed(&self, reference: &TransactionRef) -> Result<Option<CommitResult>, StoreError> {
        self.inner.committed(reference).await
    }

    async fn entries_for(&self, reference: &TransactionRef) -> Result<Vec<PostedEntry>, StoreError> {
        self.inner.entries_for(reference).await
    }
}

type ContendedEngine = PostingEngine<
    InMemoryStagedBatchStore,
    ContendedLedger,
    InMemoryBranchGateway,
    InMemoryEventBus<EventEnvelope<BatchEvent>>,
    InMemoryEventBus<ReconciliationNotice>,
>;

async fn contended_engine(conflicts: u32) -> ContendedEngine {
    let engine = PostingEngine::new(
        registry(),
        Arc::new(InMemoryStagedBatchStore::new()),
        Arc::new(ContendedLedger {
            inner: InMemoryLedgerStore::new(),
            conflicts: AtomicU32::new(conflicts),
        }),
        Arc::new(InMemoryBranchGateway::new()),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(InMemoryEventBus::new()),
        test_config().with_commit_max_attempts(3),
    );
    for (account, name, kind) in CHART {
        engine
            .open_account(LedgerAccount::open(key("BR1", account), *name, *kind))
            .await
            .unwrap();
    }
    engine
}

#[tokio::test]
async fn commit_conflicts_are_retried_within_the_bound() {
    let engine = contended_engine(2).await;

    let outcome = engine.submit(deposit("TX-1", 10_000)).await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Confirmed);
    assert_eq!(outcome.posted_entries.len(), 3);
}

#[tokio::test]
async fn exhausted_commit_conflicts_surface_and_keep_the_batch_whole() {
    let engine = contended_engine(4).await;

    let err = engine.submit(deposit("TX-1", 10_000)).await.unwrap_err();

    assert!(matches!(err.posting(), Some(PostingError::CommitConflict { .. })));
    let staged = engine.batch(&code("TX-1")).await.unwrap().unwrap();
    assert_eq!(staged.status(), BatchStatus::RejectedPendingRetry);
    assert!(engine.entries(&code("TX-1")).await.unwrap().is_empty());

    // one conflict left, well inside the bound
    let status = engine.retry_commit(&code("TX-1")).await.unwrap();
    assert_eq!(status, BatchStatus::Confirmed);
    assert_eq!(engine.entries(&code("TX-1")).await.unwrap().len(), 3);
}

/// Staged store that loses the write recording a finished commit.
struct UnrecordedCommits {
    inner: InMemoryStagedBatchStore,
    failures: AtomicU32,
}

#[async_trait::async_trait]
impl StagedBatchStore for UnrecordedCommits {
    async fn load(&self, reference: &TransactionRef) -> Result<Option<StagedBatch>, StoreError> {
        self.inner.load(reference).await
    }

    async fn save(&self, batch: &StagedBatch, expected: ExpectedVersion) -> Result<(), StoreError> {
        if batch.is_committed() && self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Backend("connection reset".into()));
        }
        self.inner.save(batch, expected).await
    }

    async fn pending(&self) -> Result<Vec<StagedBatch>, StoreError> {
        self.inner.pending().await
    }
}

#[tokio::test]
async fn retry_records_a_commit_the_ledger_already_holds() {
    let engine = PostingEngine::new(
        registry(),
        Arc::new(UnrecordedCommits {
            inner: InMemoryStagedBatchStore::new(),
            failures: AtomicU32::new(1),
        }),
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(InMemoryBranchGateway::new()),
        Arc::new(InMemoryEventBus::<EventEnvelope<BatchEvent>>::new()),
        Arc::new(InMemoryEventBus::<ReconciliationNotice>::new()),
        test_config(),
    );
    for (account, name, kind) in CHART {
        engine
            .open_account(LedgerAccount::open(key("BR1", account), *name, *kind))
            .await
            .unwrap();
    }

    let err = engine.submit(deposit("TX-1", 10_000)).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::Backend(_))));
    let staged = engine.batch(&code("TX-1")).await.unwrap().unwrap();
    assert_eq!(staged.status(), BatchStatus::Confirmed);
    assert!(!staged.is_committed());
    let posted: Vec<_> = engine
        .entries(&code("TX-1"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(posted.len(), 3);

    let status = engine.retry_commit(&code("TX-1")).await.unwrap();

    assert_eq!(status, BatchStatus::Confirmed);
    let staged = engine.batch(&code("TX-1")).await.unwrap().unwrap();
    assert_eq!(staged.commit().map(|c| c.posted_entries.clone()), Some(posted));
    assert_eq!(engine.entries(&code("TX-1")).await.unwrap().len(), 3);
    assert_eq!(balance_of(&engine, "BR1", "2100").await, 10_000);

    // recorded now, so a second retry has nothing to do
    let again = engine.retry_commit(&code("TX-1")).await.unwrap_err();
    assert!(matches!(again.posting(), Some(PostingError::InvalidTransition { .. })));
}

async fn balance_of<S: StagedBatchStore>(
    engine: &PostingEngine<
        S,
        InMemoryLedgerStore,
        InMemoryBranchGateway,
        InMemoryEventBus<EventEnvelope<BatchEvent>>,
        InMemoryEventBus<ReconciliationNotice>,
    >,
    branch: &str,
    account: &str,
) -> i64 {
    engine
        .account(&key(branch, account))
        .await
        .unwrap()
        .map(|a| a.balance)
        .unwrap_or_default()
}
