//! Accounting event posting engine (pure domain).
//!
//! Translates business events into balanced double-entry batches using
//! configurable rules, stages them for inter-branch acknowledgement and plans
//! their atomic posting. No IO, no async, no persistence concerns.

pub mod builder;
pub mod chain;
pub mod error;
pub mod formula;
pub mod ledger;
pub mod registry;
pub mod resolver;
pub mod staging;

pub use builder::{EntryBatch, EntryBuilder, EntryLine, PostingRequest};
pub use chain::ChainGraph;
pub use error::{PostingError, PostingResult};
pub use formula::{Formula, Variable, Variables};
pub use ledger::{
    AccountKey, AccountKind, AccountStatus, AccountUpdate, CommitPlan, CommitResult, LedgerAccount, PostedEntry,
};
pub use registry::{
    AccountDetermination, AccountingRule, AccountingTemplate, BranchSide, ChainLink,
    ConfigCommand, ContraAccountMapping, EntryType, OperationEvent, OperationEventAttribute,
    RegistryDocument, RuleRegistry, RulePosting, TemplateAccountMapping, TemplateContraMapping,
};
pub use resolver::{AccountShare, LegAmount, Resolution, Resolver};
pub use staging::{
    AckDecision, AcknowledgementRecord, BatchCommand, BatchEvent, BatchStatus, CommitRecord,
    DeliveryOutcome, DeliveryState, EntryTempData, ReconciliationFlag, StagedBatch,
};
