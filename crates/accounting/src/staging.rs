//! Staged entry batches and the inter-branch acknowledgement protocol.
//!
//! A [`StagedBatch`] is the aggregate for one transaction reference. It holds
//! the frozen `EntryTempData` rows of the batch and moves through
//!
//! ```text
//! Created -> AwaitingAcknowledgement -> PartiallyAcknowledged -> Confirmed -> Reversed
//!        \                          \                       \          \
//!         `-> Confirmed (direct)     `-> Rejected            `-> Rejected  `-> RejectedPendingRetry
//! ```
//!
//! Decisions happen in `handle`, state changes in `apply`, so the same event
//! stream can rebuild a batch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use branchledger_core::{
    AccountCode, Aggregate, AggregateRoot, BranchId, Direction, DomainError, EventCode,
    PostedEntryId, RuleId, TransactionRef,
};
use branchledger_events::Event;

use crate::builder::{EntryBatch, EntryLine};
use crate::error::{PostingError, PostingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Created,
    AwaitingAcknowledgement,
    PartiallyAcknowledged,
    Confirmed,
    Rejected,
    RejectedPendingRetry,
    Reversed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Created => "created",
            BatchStatus::AwaitingAcknowledgement => "awaiting_acknowledgement",
            BatchStatus::PartiallyAcknowledged => "partially_acknowledged",
            BatchStatus::Confirmed => "confirmed",
            BatchStatus::Rejected => "rejected",
            BatchStatus::RejectedPendingRetry => "rejected_pending_retry",
            BatchStatus::Reversed => "reversed",
        }
    }

    /// Waiting on at least one branch.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            BatchStatus::AwaitingAcknowledgement | BatchStatus::PartiallyAcknowledged
        )
    }

    /// No further transitions except operator retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Rejected | BatchStatus::Reversed)
    }
}

impl core::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AckDecision {
    Approve,
    Reject { reason: String },
}

impl AckDecision {
    pub fn is_approval(&self) -> bool {
        matches!(self, AckDecision::Approve)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgementRecord {
    pub branch: BranchId,
    pub decision: AckDecision,
    pub at: DateTime<Utc>,
}

/// Result of one dispatch attempt sequence to a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed { attempts: u32, error: String },
}

/// Delivery state of the acknowledgement request to one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered { at: DateTime<Utc> },
    Undelivered { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationFlag {
    pub flagged_at: DateTime<Utc>,
    pub pending: Vec<BranchId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub committed_at: DateTime<Utc>,
    pub posted_entries: Vec<PostedEntryId>,
}

/// One staged ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTempData {
    pub line_no: u32,
    pub rule: RuleId,
    pub event: EventCode,
    pub account: AccountCode,
    pub branch: BranchId,
    pub direction: Direction,
    pub amount: i64,
    pub description: String,
    pub reference: TransactionRef,
    pub originating_branch: BranchId,
    /// Counter-branch of an inter-branch transaction.
    pub external_branch: Option<BranchId>,
    pub consumed: bool,
}

impl EntryTempData {
    fn from_line(batch: &EntryBatch, line: &EntryLine) -> Self {
        let external_branch = match &batch.destination_branch {
            Some(dest) if batch.inter_branch => {
                if &line.branch == dest {
                    Some(batch.source_branch.clone())
                } else {
                    Some(dest.clone())
                }
            }
            _ => None,
        };
        Self {
            line_no: line.line_no,
            rule: line.rule.clone(),
            event: line.event.clone(),
            account: line.account.clone(),
            branch: line.branch.clone(),
            direction: line.direction,
            amount: line.amount,
            description: line.description.clone(),
            reference: batch.reference.clone(),
            originating_branch: batch.source_branch.clone(),
            external_branch,
            consumed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchCommand {
    Stage {
        batch: EntryBatch,
        at: DateTime<Utc>,
    },
    RecordDelivery {
        branch: BranchId,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    },
    Acknowledge {
        branch: BranchId,
        decision: AckDecision,
        at: DateTime<Utc>,
    },
    Cancel {
        reason: String,
        at: DateTime<Utc>,
    },
    FlagForReconciliation {
        at: DateTime<Utc>,
    },
    MarkCommitted {
        posted_entries: Vec<PostedEntryId>,
        at: DateTime<Utc>,
    },
    MarkCommitFailed {
        error: String,
        at: DateTime<Utc>,
    },
    RetryCommit {
        at: DateTime<Utc>,
    },
    MarkReversed {
        reversal: TransactionRef,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchEvent {
    BatchStaged {
        batch: EntryBatch,
        required: Vec<BranchId>,
        at: DateTime<Utc>,
    },
    AcknowledgementRequested {
        branches: Vec<BranchId>,
        at: DateTime<Utc>,
    },
    DeliveryRecorded {
        branch: BranchId,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    },
    AcknowledgementRecorded {
        branch: BranchId,
        decision: AckDecision,
        at: DateTime<Utc>,
    },
    BatchConfirmed {
        at: DateTime<Utc>,
    },
    BatchRejected {
        branch: BranchId,
        reason: String,
        at: DateTime<Utc>,
    },
    BatchCancelled {
        reason: String,
        at: DateTime<Utc>,
    },
    ReconciliationFlagged {
        pending: Vec<BranchId>,
        at: DateTime<Utc>,
    },
    BatchCommitted {
        posted_entries: Vec<PostedEntryId>,
        at: DateTime<Utc>,
    },
    CommitFailed {
        error: String,
        at: DateTime<Utc>,
    },
    CommitRetryRequested {
        at: DateTime<Utc>,
    },
    BatchReversed {
        reversal: TransactionRef,
        at: DateTime<Utc>,
    },
}

impl Event for BatchEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BatchEvent::BatchStaged { .. } => "posting.batch.staged",
            BatchEvent::AcknowledgementRequested { .. } => "posting.batch.acknowledgement_requested",
            BatchEvent::DeliveryRecorded { .. } => "posting.batch.delivery_recorded",
            BatchEvent::AcknowledgementRecorded { .. } => "posting.batch.acknowledgement_recorded",
            BatchEvent::BatchConfirmed { .. } => "posting.batch.confirmed",
            BatchEvent::BatchRejected { .. } => "posting.batch.rejected",
            BatchEvent::BatchCancelled { .. } => "posting.batch.cancelled",
            BatchEvent::ReconciliationFlagged { .. } => "posting.batch.reconciliation_flagged",
            BatchEvent::BatchCommitted { .. } => "posting.batch.committed",
            BatchEvent::CommitFailed { .. } => "posting.batch.commit_failed",
            BatchEvent::CommitRetryRequested { .. } => "posting.batch.commit_retry_requested",
            BatchEvent::BatchReversed { .. } => "posting.batch.reversed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BatchEvent::BatchStaged { at, .. }
            | BatchEvent::AcknowledgementRequested { at, .. }
            | BatchEvent::DeliveryRecorded { at, .. }
            | BatchEvent::AcknowledgementRecorded { at, .. }
            | BatchEvent::BatchConfirmed { at }
            | BatchEvent::BatchRejected { at, .. }
            | BatchEvent::BatchCancelled { at, .. }
            | BatchEvent::ReconciliationFlagged { at, .. }
            | BatchEvent::BatchCommitted { at, .. }
            | BatchEvent::CommitFailed { at, .. }
            | BatchEvent::CommitRetryRequested { at }
            | BatchEvent::BatchReversed { at, .. } => *at,
        }
    }
}

/// Aggregate root: the staged batch of one transaction reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedBatch {
    reference: TransactionRef,
    batch: Option<EntryBatch>,
    rows: Vec<EntryTempData>,
    status: BatchStatus,
    required: Vec<BranchId>,
    acknowledgements: BTreeMap<BranchId, AcknowledgementRecord>,
    deliveries: BTreeMap<BranchId, DeliveryState>,
    reconciliation: Option<ReconciliationFlag>,
    commit: Option<CommitRecord>,
    commit_failures: u32,
    last_commit_error: Option<String>,
    rejection_reason: Option<String>,
    reversed_by: Option<TransactionRef>,
    staged_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
}

impl StagedBatch {
    /// Empty aggregate for staging or rehydration.
    pub fn empty(reference: TransactionRef) -> Self {
        Self {
            reference,
            batch: None,
            rows: Vec::new(),
            status: BatchStatus::Created,
            required: Vec::new(),
            acknowledgements: BTreeMap::new(),
            deliveries: BTreeMap::new(),
            reconciliation: None,
            commit: None,
            commit_failures: 0,
            last_commit_error: None,
            rejection_reason: None,
            reversed_by: None,
            staged_at: None,
            updated_at: None,
            version: 0,
        }
    }

    /// Rebuild a batch from its event stream.
    pub fn replay<'a>(reference: TransactionRef, events: impl IntoIterator<Item = &'a BatchEvent>) -> Self {
        let mut batch = Self::empty(reference);
        for event in events {
            batch.apply(event);
        }
        batch
    }

    pub fn reference(&self) -> &TransactionRef {
        &self.reference
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn is_staged(&self) -> bool {
        self.batch.is_some()
    }

    pub fn batch(&self) -> Option<&EntryBatch> {
        self.batch.as_ref()
    }

    pub fn rows(&self) -> &[EntryTempData] {
        &self.rows
    }

    pub fn originating_branch(&self) -> Option<&BranchId> {
        self.batch.as_ref().map(|b| &b.source_branch)
    }

    pub fn required_acknowledgers(&self) -> &[BranchId] {
        &self.required
    }

    pub fn acknowledgements(&self) -> impl Iterator<Item = &AcknowledgementRecord> {
        self.acknowledgements.values()
    }

    /// Required branches that have not approved yet.
    pub fn pending_acknowledgers(&self) -> Vec<BranchId> {
        self.required
            .iter()
            .filter(|b| {
                !self
                    .acknowledgements
                    .get(*b)
                    .is_some_and(|a| a.decision.is_approval())
            })
            .cloned()
            .collect()
    }

    /// Counter-branches whose acknowledgement request has not been delivered.
    pub fn undelivered(&self) -> Vec<BranchId> {
        self.deliveries
            .iter()
            .filter(|(branch, state)| {
                !matches!(state, DeliveryState::Delivered { .. })
                    && !self.acknowledgements.contains_key(*branch)
            })
            .map(|(branch, _)| branch.clone())
            .collect()
    }

    pub fn delivery(&self, branch: &BranchId) -> Option<&DeliveryState> {
        self.deliveries.get(branch)
    }

    pub fn reconciliation(&self) -> Option<&ReconciliationFlag> {
        self.reconciliation.as_ref()
    }

    pub fn commit(&self) -> Option<&CommitRecord> {
        self.commit.as_ref()
    }

    pub fn is_committed(&self) -> bool {
        self.commit.is_some()
    }

    pub fn commit_failures(&self) -> u32 {
        self.commit_failures
    }

    pub fn last_commit_error(&self) -> Option<&str> {
        self.last_commit_error.as_deref()
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn reversed_by(&self) -> Option<&TransactionRef> {
        self.reversed_by.as_ref()
    }

    pub fn staged_at(&self) -> Option<DateTime<Utc>> {
        self.staged_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Pending longer than `timeout` as of `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.status.is_pending() && self.staged_at.is_some_and(|at| now - at >= timeout)
    }
}

impl AggregateRoot for StagedBatch {
    type Id = TransactionRef;

    fn id(&self) -> &Self::Id {
        &self.reference
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for StagedBatch {
    type Command = BatchCommand;
    type Event = BatchEvent;
    type Error = PostingError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BatchEvent::BatchStaged {
                batch,
                required,
                at,
            } => {
                self.rows = batch
                    .lines
                    .iter()
                    .map(|line| EntryTempData::from_line(batch, line))
                    .collect();
                self.batch = Some(batch.clone());
                self.required = required.clone();
                self.status = BatchStatus::Created;
                self.staged_at = Some(*at);
            }
            BatchEvent::AcknowledgementRequested { branches, .. } => {
                for branch in branches {
                    self.deliveries.insert(branch.clone(), DeliveryState::Pending);
                }
                self.status = BatchStatus::AwaitingAcknowledgement;
            }
            BatchEvent::DeliveryRecorded {
                branch,
                outcome,
                at,
            } => {
                let state = match outcome {
                    DeliveryOutcome::Delivered => DeliveryState::Delivered { at: *at },
                    DeliveryOutcome::Failed { attempts, error } => DeliveryState::Undelivered {
                        attempts: *attempts,
                        last_error: error.clone(),
                    },
                };
                self.deliveries.insert(branch.clone(), state);
            }
            BatchEvent::AcknowledgementRecorded {
                branch,
                decision,
                at,
            } => {
                self.acknowledgements.insert(
                    branch.clone(),
                    AcknowledgementRecord {
                        branch: branch.clone(),
                        decision: decision.clone(),
                        at: *at,
                    },
                );
                if self.status.is_pending() || self.status == BatchStatus::Created {
                    self.status = BatchStatus::PartiallyAcknowledged;
                }
            }
            BatchEvent::BatchConfirmed { .. } => {
                self.status = BatchStatus::Confirmed;
            }
            BatchEvent::BatchRejected { reason, .. } | BatchEvent::BatchCancelled { reason, .. } => {
                self.status = BatchStatus::Rejected;
                self.rejection_reason = Some(reason.clone());
            }
            BatchEvent::ReconciliationFlagged { pending, at } => {
                self.reconciliation = Some(ReconciliationFlag {
                    flagged_at: *at,
                    pending: pending.clone(),
                });
            }
            BatchEvent::BatchCommitted { posted_entries, at } => {
                self.commit = Some(CommitRecord {
                    committed_at: *at,
                    posted_entries: posted_entries.clone(),
                });
                for row in &mut self.rows {
                    row.consumed = true;
                }
                self.last_commit_error = None;
            }
            BatchEvent::CommitFailed { error, .. } => {
                self.status = BatchStatus::RejectedPendingRetry;
                self.commit_failures += 1;
                self.last_commit_error = Some(error.clone());
            }
            BatchEvent::CommitRetryRequested { .. } => {
                self.status = BatchStatus::Confirmed;
            }
            BatchEvent::BatchReversed { reversal, .. } => {
                self.status = BatchStatus::Reversed;
                self.reversed_by = Some(reversal.clone());
            }
        }

        self.updated_at = Some(event.occurred_at());
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if !matches!(command, BatchCommand::Stage { .. }) && !self.is_staged() {
            return Err(DomainError::not_found(format!("staged batch {}", self.reference)).into());
        }

        match command {
            BatchCommand::Stage { batch, at } => self.handle_stage(batch, *at),
            BatchCommand::RecordDelivery {
                branch,
                outcome,
                at,
            } => Ok(self.handle_delivery(branch, outcome, *at)),
            BatchCommand::Acknowledge {
                branch,
                decision,
                at,
            } => self.handle_acknowledge(branch, decision, *at),
            BatchCommand::Cancel { reason, at } => self.handle_cancel(reason, *at),
            BatchCommand::FlagForReconciliation { at } => Ok(self.handle_flag(*at)),
            BatchCommand::MarkCommitted { posted_entries, at } => {
                self.handle_committed(posted_entries, *at)
            }
            BatchCommand::MarkCommitFailed { error, at } => self.handle_commit_failed(error, *at),
            BatchCommand::RetryCommit { at } => {
                self.ensure_status(BatchStatus::RejectedPendingRetry, "retry commit")?;
                Ok(vec![BatchEvent::CommitRetryRequested { at: *at }])
            }
            BatchCommand::MarkReversed { reversal, at } => {
                self.ensure_status(BatchStatus::Confirmed, "reverse")?;
                if !self.is_committed() {
                    return Err(self.invalid("reverse"));
                }
                Ok(vec![BatchEvent::BatchReversed {
                    reversal: reversal.clone(),
                    at: *at,
                }])
            }
        }
    }
}

impl StagedBatch {
    fn invalid(&self, action: &'static str) -> PostingError {
        PostingError::InvalidTransition {
            reference: self.reference.clone(),
            status: self.status.to_string(),
            action,
        }
    }

    fn ensure_status(&self, expected: BatchStatus, action: &'static str) -> PostingResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn handle_stage(&self, batch: &EntryBatch, at: DateTime<Utc>) -> PostingResult<Vec<BatchEvent>> {
        if self.is_staged() {
            return Err(PostingError::DuplicateTransaction(self.reference.clone()));
        }
        if batch.reference != self.reference {
            return Err(DomainError::invariant(format!(
                "batch reference {} staged under {}",
                batch.reference, self.reference
            ))
            .into());
        }
        if batch.lines.is_empty() {
            return Err(DomainError::validation("cannot stage an empty batch").into());
        }
        if batch.lines.iter().any(|l| l.amount <= 0) {
            return Err(DomainError::validation("staged lines must have positive amounts").into());
        }
        if !batch.is_balanced() {
            return Err(PostingError::UnbalancedEntry {
                debits: batch.debit_total(),
                credits: batch.credit_total(),
            });
        }

        let required = batch.required_acknowledgers();
        let mut events = vec![BatchEvent::BatchStaged {
            batch: batch.clone(),
            required: required.clone(),
            at,
        }];

        if required.is_empty() {
            events.push(BatchEvent::BatchConfirmed { at });
        } else {
            // The originating branch acknowledges through the same inbound call;
            // only counter-branches are sent a request.
            let branches: Vec<BranchId> = required
                .iter()
                .filter(|b| *b != &batch.source_branch)
                .cloned()
                .collect();
            events.push(BatchEvent::AcknowledgementRequested { branches, at });
        }
        Ok(events)
    }

    fn handle_delivery(
        &self,
        branch: &BranchId,
        outcome: &DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> Vec<BatchEvent> {
        if !self.status.is_pending() || !self.deliveries.contains_key(branch) {
            return Vec::new();
        }
        if self.deliveries.get(branch).is_some_and(|s| matches!(s, DeliveryState::Delivered { .. })) {
            return Vec::new();
        }
        vec![BatchEvent::DeliveryRecorded {
            branch: branch.clone(),
            outcome: outcome.clone(),
            at,
        }]
    }

    fn handle_acknowledge(
        &self,
        branch: &BranchId,
        decision: &AckDecision,
        at: DateTime<Utc>,
    ) -> PostingResult<Vec<BatchEvent>> {
        if !self.required.contains(branch) {
            return Err(PostingError::UnexpectedAcknowledger {
                reference: self.reference.clone(),
                branch: branch.clone(),
            });
        }

        if let Some(previous) = self.acknowledgements.get(branch) {
            if previous.decision.is_approval() == decision.is_approval() {
                return Ok(Vec::new());
            }
            return Err(self.invalid("change acknowledgement"));
        }

        // Late acknowledgements after a terminal decision are recorded nowhere.
        if !self.status.is_pending() {
            return Ok(Vec::new());
        }

        let mut events = vec![BatchEvent::AcknowledgementRecorded {
            branch: branch.clone(),
            decision: decision.clone(),
            at,
        }];

        match decision {
            AckDecision::Reject { reason } => {
                events.push(BatchEvent::BatchRejected {
                    branch: branch.clone(),
                    reason: reason.clone(),
                    at,
                });
            }
            AckDecision::Approve => {
                let outstanding = self
                    .pending_acknowledgers()
                    .into_iter()
                    .filter(|b| b != branch)
                    .count();
                if outstanding == 0 {
                    events.push(BatchEvent::BatchConfirmed { at });
                }
            }
        }
        Ok(events)
    }

    fn handle_cancel(&self, reason: &str, at: DateTime<Utc>) -> PostingResult<Vec<BatchEvent>> {
        match self.status {
            BatchStatus::Rejected => Ok(Vec::new()),
            status if status.is_pending() || status == BatchStatus::Created => {
                Ok(vec![BatchEvent::BatchCancelled {
                    reason: reason.to_string(),
                    at,
                }])
            }
            _ => Err(self.invalid("cancel")),
        }
    }

    fn handle_flag(&self, at: DateTime<Utc>) -> Vec<BatchEvent> {
        if !self.status.is_pending() || self.reconciliation.is_some() {
            return Vec::new();
        }
        vec![BatchEvent::ReconciliationFlagged {
            pending: self.pending_acknowledgers(),
            at,
        }]
    }

    fn handle_committed(
        &self,
        posted_entries: &[PostedEntryId],
        at: DateTime<Utc>,
    ) -> PostingResult<Vec<BatchEvent>> {
        if self.is_committed() {
            return Ok(Vec::new());
        }
        self.ensure_status(BatchStatus::Confirmed, "commit")?;
        Ok(vec![BatchEvent::BatchCommitted {
            posted_entries: posted_entries.to_vec(),
            at,
        }])
    }

    fn handle_commit_failed(&self, error: &str, at: DateTime<Utc>) -> PostingResult<Vec<BatchEvent>> {
        if self.is_committed() {
            return Err(self.invalid("fail commit"));
        }
        self.ensure_status(BatchStatus::Confirmed, "fail commit")?;
        Ok(vec![BatchEvent::CommitFailed {
            error: error.to_string(),
            at,
        }])
    }
}
