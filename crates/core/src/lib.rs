//! `branchledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, aggregate mechanics and the money
//! value types shared by every ledger crate.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{
    AccountCode, AttributeCode, BranchId, EventCode, PostedEntryId, RuleId, TemplateId,
    TransactionRef,
};
pub use money::{Direction, Percentage};
