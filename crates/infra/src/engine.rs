//! Posting engine: the application-level orchestration of a posting.
//!
//! ```text
//! submit
//!   ↓
//! 1. Build the batch against the current registry snapshot (pure)
//!   ↓
//! 2. Stage it under the reference lock (optimistic version check)
//!   ↓
//! 3. Direct confirm → commit, or request acknowledgements (no lock held)
//!   ↓
//! 4. Publish every batch event on the audit bus
//! ```
//!
//! Operations on one transaction reference are serialized by a per-reference
//! async mutex. Remote branches are contacted without holding it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{Span, error, info, instrument, warn};

use branchledger_accounting::{
    AccountKey, AccountStatus, AckDecision, BatchCommand, BatchEvent, BatchStatus, CommitResult,
    ConfigCommand, DeliveryOutcome, DeliveryState, EntryBuilder, LedgerAccount, PostedEntry,
    PostingError, PostingRequest, RegistryDocument, Resolver, RuleRegistry, StagedBatch,
};
use branchledger_core::{
    Aggregate, AggregateRoot, BranchId, DomainError, ExpectedVersion, PostedEntryId, TransactionRef,
};
use branchledger_events::{EventBus, EventEnvelope};

use crate::config::EngineConfig;
use crate::dispatcher::AcknowledgementDispatcher;
use crate::error::{EngineError, StoreError};
use crate::gateway::{AcknowledgementRequest, BranchGateway};
use crate::reconciliation::ReconciliationNotice;
use crate::store::{LedgerStore, StagedBatchStore};

/// Result of `submit` and `reverse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub reference: TransactionRef,
    pub status: BatchStatus,
    /// Branches whose approval the batch waits for.
    pub required_acknowledgers: Vec<BranchId>,
    /// Empty unless the batch was committed.
    pub posted_entries: Vec<PostedEntryId>,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub redispatched: usize,
    pub flagged: Vec<TransactionRef>,
}

#[derive(Debug, Default)]
struct ReferenceLocks {
    locks: Mutex<HashMap<TransactionRef, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReferenceLocks {
    async fn acquire(&self, reference: &TransactionRef) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(reference.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Accounting event posting engine.
///
/// ## Generic Parameters
///
/// - `S`: staged batch store
/// - `L`: ledger store
/// - `G`: counter-branch gateway
/// - `A`: audit bus for batch events
/// - `N`: operator bus for reconciliation notices
pub struct PostingEngine<S, L, G, A, N> {
    registry: RwLock<Arc<RuleRegistry>>,
    staged: Arc<S>,
    ledger: Arc<L>,
    dispatcher: AcknowledgementDispatcher<G>,
    audit: Arc<A>,
    notices: Arc<N>,
    locks: ReferenceLocks,
    config: EngineConfig,
}

impl<S, L, G, A, N> PostingEngine<S, L, G, A, N>
where
    S: StagedBatchStore,
    L: LedgerStore,
    G: BranchGateway,
    A: EventBus<EventEnvelope<BatchEvent>>,
    N: EventBus<ReconciliationNotice>,
{
    pub fn new(
        registry: RuleRegistry,
        staged: Arc<S>,
        ledger: Arc<L>,
        gateway: Arc<G>,
        audit: Arc<A>,
        notices: Arc<N>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
            staged,
            ledger,
            dispatcher: AcknowledgementDispatcher::new(gateway, config.dispatch_retry.clone()),
            audit,
            notices,
            locks: ReferenceLocks::default(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn staged_store(&self) -> &Arc<S> {
        &self.staged
    }

    pub fn ledger_store(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn gateway(&self) -> &Arc<G> {
        self.dispatcher.gateway()
    }

    pub fn audit_bus(&self) -> &Arc<A> {
        &self.audit
    }

    pub fn notice_bus(&self) -> &Arc<N> {
        &self.notices
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    /// Current registry snapshot. Requests keep the snapshot they started with.
    pub fn registry(&self) -> Arc<RuleRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Validate and apply a configuration command; returns the new version.
    #[instrument(skip(self, command), err)]
    pub fn apply_config(&self, command: ConfigCommand) -> Result<u64, EngineError> {
        let mut current = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let next = current.apply(command)?;
        let version = next.version();
        *current = Arc::new(next);
        info!(version, "registry updated");
        Ok(version)
    }

    /// Replace the whole registry with a validated document.
    #[instrument(skip(self, document), err)]
    pub fn load_registry(&self, document: RegistryDocument) -> Result<u64, EngineError> {
        let mut current = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let loaded = current.replace_with(document)?;
        let version = loaded.version();
        *current = Arc::new(loaded);
        info!(version, "registry replaced");
        Ok(version)
    }

    // ---------------------------------------------------------------------
    // Accounts
    // ---------------------------------------------------------------------

    #[instrument(skip(self, account), fields(account = %account.key), err)]
    pub async fn open_account(&self, account: LedgerAccount) -> Result<LedgerAccount, EngineError> {
        if account.balance != 0 {
            return Err(DomainError::validation("accounts open with a zero balance").into());
        }
        let opened = self.ledger.open_account(account).await?;
        info!("account opened");
        Ok(opened)
    }

    #[instrument(skip(self), fields(account = %key), err)]
    pub async fn close_account(&self, key: &AccountKey) -> Result<LedgerAccount, EngineError> {
        let closed = self.ledger.set_account_status(key, AccountStatus::Closed).await?;
        info!("account closed");
        Ok(closed)
    }

    pub async fn account(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, EngineError> {
        Ok(self.ledger.account(key).await?)
    }

    pub async fn entries(&self, reference: &TransactionRef) -> Result<Vec<PostedEntry>, EngineError> {
        Ok(self.ledger.entries_for(reference).await?)
    }

    pub async fn batch(&self, reference: &TransactionRef) -> Result<Option<StagedBatch>, EngineError> {
        Ok(self.staged.load(reference).await?)
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    /// Build, stage and (when no acknowledgement is required) commit a posting.
    ///
    /// Build failures abort with nothing staged. A commit failure leaves the
    /// batch in `RejectedPendingRetry` and is returned as the error.
    #[instrument(
        skip(self, request),
        fields(
            transaction_ref = %request.reference,
            event = %request.event,
            branch = %request.source_branch,
            status = tracing::field::Empty
        ),
        err
    )]
    pub async fn submit(&self, request: PostingRequest) -> Result<SubmitOutcome, EngineError> {
        let registry = self.registry();
        let batch = EntryBuilder::new(Resolver::new(&registry)).build(&request)?;
        let reference = batch.reference.clone();

        let staged = {
            let _guard = self.locks.acquire(&reference).await;
            if self.staged.load(&reference).await?.is_some() {
                return Err(PostingError::DuplicateTransaction(reference).into());
            }

            let mut staged = StagedBatch::empty(reference.clone());
            self.execute(&mut staged, BatchCommand::Stage { batch, at: Utc::now() })
                .await?;
            info!(
                status = %staged.status(),
                lines = staged.rows().len(),
                required = staged.required_acknowledgers().len(),
                "batch staged"
            );

            if staged.status() == BatchStatus::Confirmed {
                self.commit_confirmed(&mut staged).await?;
            }
            staged
        };

        if staged.status().is_pending() {
            self.dispatch(&staged, |_| true).await;
        }

        let current = self.load(&reference).await?;
        Span::current().record("status", current.status().as_str());
        Ok(outcome(&current))
    }

    /// Record one branch's decision; confirmation commits immediately.
    #[instrument(
        skip(self, decision),
        fields(transaction_ref = %reference, branch = %branch, approve = decision.is_approval()),
        err
    )]
    pub async fn acknowledge(
        &self,
        reference: &TransactionRef,
        branch: &BranchId,
        decision: AckDecision,
    ) -> Result<BatchStatus, EngineError> {
        let _guard = self.locks.acquire(reference).await;
        let mut staged = self.load(reference).await?;

        let events = self
            .execute(
                &mut staged,
                BatchCommand::Acknowledge {
                    branch: branch.clone(),
                    decision,
                    at: Utc::now(),
                },
            )
            .await?;

        for event in &events {
            match event {
                BatchEvent::BatchRejected { reason, .. } => {
                    info!(%reason, "batch rejected by acknowledger");
                }
                BatchEvent::BatchConfirmed { .. } => {
                    info!("batch confirmed");
                    self.commit_confirmed(&mut staged).await?;
                }
                _ => {}
            }
        }
        Ok(staged.status())
    }

    /// Cancel a batch still awaiting acknowledgement.
    #[instrument(skip(self, reason), fields(transaction_ref = %reference), err)]
    pub async fn cancel(
        &self,
        reference: &TransactionRef,
        reason: impl Into<String>,
    ) -> Result<BatchStatus, EngineError> {
        let _guard = self.locks.acquire(reference).await;
        let mut staged = self.load(reference).await?;
        let events = self
            .execute(
                &mut staged,
                BatchCommand::Cancel {
                    reason: reason.into(),
                    at: Utc::now(),
                },
            )
            .await?;
        if !events.is_empty() {
            info!("batch cancelled");
        }
        Ok(staged.status())
    }

    /// Post the mirror image of a committed batch under `REV:<reference>`.
    #[instrument(skip(self), fields(transaction_ref = %reference), err)]
    pub async fn reverse(&self, reference: &TransactionRef) -> Result<SubmitOutcome, EngineError> {
        let _guard = self.locks.acquire(reference).await;
        let mut original = self.load(reference).await?;

        let reversal_ref = TransactionRef::reversal_of(reference)?;
        // reject before touching the ledger
        original.handle(&BatchCommand::MarkReversed {
            reversal: reversal_ref.clone(),
            at: Utc::now(),
        })?;
        let reversal_batch = original
            .batch()
            .ok_or_else(|| DomainError::invariant(format!("staged batch {reference} has no lines")))?
            .reversal()?;

        let _reversal_guard = self.locks.acquire(&reversal_ref).await;
        let mut reversal = match self.staged.load(&reversal_ref).await? {
            // an earlier attempt staged it but did not finish
            Some(existing) if existing.batch().and_then(|b| b.reversal_of.as_ref()) == Some(reference) => {
                existing
            }
            Some(_) => {
                return Err(DomainError::conflict(format!(
                    "{reversal_ref} is staged but does not reverse {reference}"
                ))
                .into());
            }
            None => {
                let mut staged = StagedBatch::empty(reversal_ref.clone());
                self.execute(
                    &mut staged,
                    BatchCommand::Stage {
                        batch: reversal_batch,
                        at: Utc::now(),
                    },
                )
                .await?;
                staged
            }
        };

        if reversal.status() == BatchStatus::RejectedPendingRetry {
            self.execute(&mut reversal, BatchCommand::RetryCommit { at: Utc::now() })
                .await?;
        }
        if !reversal.is_committed() {
            self.commit_confirmed(&mut reversal).await?;
        }

        self.execute(
            &mut original,
            BatchCommand::MarkReversed {
                reversal: reversal_ref.clone(),
                at: Utc::now(),
            },
        )
        .await?;
        info!(reversal = %reversal_ref, "batch reversed");
        Ok(outcome(&reversal))
    }

    /// Send a `RejectedPendingRetry` batch back through commit.
    ///
    /// A `Confirmed` batch with no commit recorded is committed again; the
    /// ledger answers with the entries it already posted for the reference.
    #[instrument(skip(self), fields(transaction_ref = %reference), err)]
    pub async fn retry_commit(&self, reference: &TransactionRef) -> Result<BatchStatus, EngineError> {
        let _guard = self.locks.acquire(reference).await;
        let mut staged = self.load(reference).await?;
        let unrecorded = staged.status() == BatchStatus::Confirmed && !staged.is_committed();
        if !unrecorded {
            self.execute(&mut staged, BatchCommand::RetryCommit { at: Utc::now() })
                .await?;
        }
        self.commit_confirmed(&mut staged).await?;
        Ok(staged.status())
    }

    // ---------------------------------------------------------------------
    // Reconciliation
    // ---------------------------------------------------------------------

    /// One reconciliation pass over pending batches.
    ///
    /// Overdue batches are flagged and reported on the notice bus; the rest
    /// get their undelivered requests re-sent. Failures on one batch are
    /// logged and do not stop the pass.
    #[instrument(skip(self), err)]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let timeout = self.config.ack_timeout_chrono();
        let mut report = SweepReport::default();

        for batch in self.staged.pending().await? {
            report.inspected += 1;
            if batch.reconciliation().is_some() {
                continue;
            }

            if batch.is_overdue(now, timeout) {
                match self.flag(batch.reference(), now).await {
                    Ok(true) => report.flagged.push(batch.reference().clone()),
                    Ok(false) => {}
                    Err(err) => warn!(transaction_ref = %batch.reference(), error = %err, "failed to flag batch"),
                }
                continue;
            }

            report.redispatched += self
                .dispatch(&batch, |state| matches!(state, Some(DeliveryState::Undelivered { .. })))
                .await;
        }

        if report.redispatched > 0 || !report.flagged.is_empty() {
            info!(
                inspected = report.inspected,
                redispatched = report.redispatched,
                flagged = report.flagged.len(),
                "reconciliation pass"
            );
        }
        Ok(report)
    }

    async fn flag(&self, reference: &TransactionRef, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let _guard = self.locks.acquire(reference).await;
        let mut staged = self.load(reference).await?;
        let events = self
            .execute(&mut staged, BatchCommand::FlagForReconciliation { at: now })
            .await?;
        if events.is_empty() {
            return Ok(false);
        }

        let Some(notice) = ReconciliationNotice::for_batch(&staged, now) else {
            return Ok(false);
        };
        warn!(
            transaction_ref = %reference,
            pending = ?notice.pending,
            "acknowledgement timed out, flagged for manual reconciliation"
        );
        if let Err(err) = self.notices.publish(notice) {
            error!(transaction_ref = %reference, error = ?err, "failed to publish reconciliation notice");
        }
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    async fn load(&self, reference: &TransactionRef) -> Result<StagedBatch, EngineError> {
        self.staged
            .load(reference)
            .await?
            .ok_or_else(|| EngineError::UnknownTransaction(reference.clone()))
    }

    /// Run a command, persist the result and publish its events.
    async fn execute(
        &self,
        staged: &mut StagedBatch,
        command: BatchCommand,
    ) -> Result<Vec<BatchEvent>, EngineError> {
        let before = staged.version();
        let events = staged.execute(&command)?;
        if events.is_empty() {
            return Ok(events);
        }
        self.staged.save(staged, ExpectedVersion::Exact(before)).await?;
        self.publish(staged, before, &events);
        Ok(events)
    }

    fn publish(&self, staged: &StagedBatch, before: u64, events: &[BatchEvent]) {
        let Some(branch) = staged.originating_branch() else {
            return;
        };
        for (offset, event) in events.iter().enumerate() {
            let envelope = EventEnvelope::wrap(
                staged.reference().clone(),
                branch.clone(),
                before + offset as u64 + 1,
                event.clone(),
            );
            if let Err(err) = self.audit.publish(envelope) {
                warn!(transaction_ref = %staged.reference(), error = ?err, "failed to publish batch event");
            }
        }
    }

    /// Commit a confirmed batch, retrying optimistic conflicts a bounded
    /// number of times. Any failure moves the batch to `RejectedPendingRetry`.
    async fn commit_confirmed(&self, staged: &mut StagedBatch) -> Result<CommitResult, EngineError> {
        if staged.status() != BatchStatus::Confirmed || staged.is_committed() {
            return Err(PostingError::InvalidTransition {
                reference: staged.reference().clone(),
                status: staged.status().to_string(),
                action: "commit",
            }
            .into());
        }
        let batch = staged
            .batch()
            .cloned()
            .ok_or_else(|| DomainError::invariant(format!("staged batch {} has no lines", staged.reference())))?;

        let max_attempts = self.config.commit_max_attempts.max(1);
        let mut attempt = 0;
        let failure: EngineError = loop {
            attempt += 1;
            match self.ledger.commit(&batch, Utc::now()).await {
                Ok(result) => {
                    self.execute(
                        staged,
                        BatchCommand::MarkCommitted {
                            posted_entries: result.posted_entries.clone(),
                            at: result.committed_at,
                        },
                    )
                    .await?;
                    info!(
                        transaction_ref = %batch.reference,
                        entries = result.posted_entries.len(),
                        "batch committed"
                    );
                    return Ok(result);
                }
                Err(StoreError::Concurrency(detail)) if attempt < max_attempts => {
                    warn!(transaction_ref = %batch.reference, attempt, %detail, "commit conflict, retrying");
                    tokio::task::yield_now().await;
                }
                Err(StoreError::Concurrency(detail)) => {
                    error!(
                        transaction_ref = %batch.reference,
                        attempts = attempt,
                        %detail,
                        "commit conflict retries exhausted"
                    );
                    break PostingError::CommitConflict {
                        reference: batch.reference.clone(),
                        detail,
                    }
                    .into();
                }
                Err(StoreError::Rejected(err)) => break err.into(),
                Err(other) => break other.into(),
            }
        };

        self.execute(
            staged,
            BatchCommand::MarkCommitFailed {
                error: failure.to_string(),
                at: Utc::now(),
            },
        )
        .await?;
        warn!(transaction_ref = %batch.reference, error = %failure, "commit failed, batch awaits retry");
        Err(failure)
    }

    /// Deliver acknowledgement requests for the selected branches and record
    /// each outcome. Returns the number of requests attempted.
    async fn dispatch(
        &self,
        staged: &StagedBatch,
        select: impl Fn(Option<&DeliveryState>) -> bool,
    ) -> usize {
        let targets: Vec<BranchId> = staged
            .undelivered()
            .into_iter()
            .filter(|branch| select(staged.delivery(branch)))
            .collect();

        let mut attempted = 0;
        for branch in targets {
            let Some(request) = AcknowledgementRequest::for_branch(staged, &branch, Utc::now()) else {
                continue;
            };
            attempted += 1;
            let outcome = self.dispatcher.deliver(request).await;
            if let Err(err) = self.record_delivery(staged.reference(), &branch, outcome).await {
                warn!(
                    transaction_ref = %staged.reference(),
                    branch = %branch,
                    error = %err,
                    "failed to record delivery outcome"
                );
            }
        }
        attempted
    }

    async fn record_delivery(
        &self,
        reference: &TransactionRef,
        branch: &BranchId,
        outcome: DeliveryOutcome,
    ) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(reference).await;
        let mut staged = self.load(reference).await?;
        self.execute(
            &mut staged,
            BatchCommand::RecordDelivery {
                branch: branch.clone(),
                outcome,
                at: Utc::now(),
            },
        )
        .await?;
        Ok(())
    }
}

fn outcome(staged: &StagedBatch) -> SubmitOutcome {
    SubmitOutcome {
        reference: staged.reference().clone(),
        status: staged.status(),
        required_acknowledgers: staged.required_acknowledgers().to_vec(),
        posted_entries: staged
            .commit()
            .map(|c| c.posted_entries.clone())
            .unwrap_or_default(),
    }
}
