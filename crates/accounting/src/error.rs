//! Posting error taxonomy.

use thiserror::Error;

use branchledger_core::{AccountCode, BranchId, DomainError, EventCode, TransactionRef};

pub type PostingResult<T> = Result<T, PostingError>;

/// Failures of the posting engine.
///
/// Configuration-time errors (`AllocationMismatch`, `ChainCycle`,
/// `Configuration`) are raised when a registry snapshot is built and never
/// reach transaction processing. `RuleNotFound`, `UnbalancedEntry` and
/// `FormulaEvaluation` abort a request before anything is staged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PostingError {
    #[error("no active accounting rule for event {event} on branch {branch}")]
    RuleNotFound { event: EventCode, branch: BranchId },

    #[error("allocation for {context} sums to {actual_bp} basis points, expected 10000")]
    AllocationMismatch { context: String, actual_bp: u64 },

    #[error("formula {formula:?} failed: {reason}")]
    FormulaEvaluation { formula: String, reason: String },

    #[error("unbalanced entry: debits {debits} != credits {credits}")]
    UnbalancedEntry { debits: i128, credits: i128 },

    #[error("chained rules form a cycle: {}", render_path(.path))]
    ChainCycle { path: Vec<EventCode> },

    #[error("ledger account {account} not found on branch {branch}")]
    AccountNotFound { branch: BranchId, account: AccountCode },

    #[error("ledger account {account} on branch {branch} is closed")]
    AccountClosed { branch: BranchId, account: AccountCode },

    #[error("acknowledgement for {reference} timed out waiting on {}", render_branches(.pending))]
    AcknowledgementTimeout {
        reference: TransactionRef,
        pending: Vec<BranchId>,
    },

    #[error("commit conflict on {reference}: {detail}")]
    CommitConflict {
        reference: TransactionRef,
        detail: String,
    },

    #[error("{action} not allowed for {reference} in status {status}")]
    InvalidTransition {
        reference: TransactionRef,
        status: String,
        action: &'static str,
    },

    #[error("branch {branch} is not a required acknowledger of {reference}")]
    UnexpectedAcknowledger {
        reference: TransactionRef,
        branch: BranchId,
    },

    #[error("transaction {0} already exists")]
    DuplicateTransaction(TransactionRef),

    #[error("configuration rejected: {0}")]
    Configuration(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl PostingError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn formula(formula: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FormulaEvaluation {
            formula: formula.into(),
            reason: reason.into(),
        }
    }

    /// Errors raised while validating configuration rather than a transaction.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            PostingError::AllocationMismatch { .. }
                | PostingError::ChainCycle { .. }
                | PostingError::Configuration(_)
        )
    }
}

fn render_path(path: &[EventCode]) -> String {
    path.iter()
        .map(EventCode::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn render_branches(branches: &[BranchId]) -> String {
    branches
        .iter()
        .map(BranchId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
