//! Infrastructure error model.

use thiserror::Error;

use branchledger_accounting::PostingError;
use branchledger_core::{DomainError, TransactionRef};

/// Failures of a staged-batch or ledger store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency failure; the caller may reload and retry.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// The store refused the write for a business reason.
    #[error(transparent)]
    Rejected(#[from] PostingError),

    /// Payload could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend failure (connection, I/O, lock poisoning).
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::Rejected(value.into())
    }
}

/// Errors returned by the posting engine's inbound operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Posting(#[from] PostingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionRef),
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        EngineError::Posting(value.into())
    }
}

impl EngineError {
    /// The posting error behind this failure, if any.
    pub fn posting(&self) -> Option<&PostingError> {
        match self {
            EngineError::Posting(err) | EngineError::Store(StoreError::Rejected(err)) => Some(err),
            _ => None,
        }
    }
}
