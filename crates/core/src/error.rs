//! Domain error model shared by every ledger crate.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failure of a domain rule.
///
/// Accounting-level failures (rules, allocations, acknowledgements) are
/// `PostingError`s in `branchledger-accounting`; this type covers the
/// building blocks underneath them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A branch, account, event, rule or reference code failed to parse.
    #[error("invalid {kind}: {reason}")]
    InvalidCode { kind: &'static str, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    /// Stale version or duplicate key.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_code(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidCode {
            kind,
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_code_kind() {
        let err = DomainError::invalid_code("BranchId", "must not be empty");
        assert_eq!(err.to_string(), "invalid BranchId: must not be empty");
        assert_eq!(
            DomainError::not_found("staged batch TX-1").to_string(),
            "staged batch TX-1 not found"
        );
    }
}
