//! Persistence ports for staged batches and the ledger.
//!
//! Two stores, two lifetimes: staged batches are mutable working state keyed
//! by transaction reference, while the ledger holds accounts and the
//! immutable posted entries. Implementations must make `LedgerStore::commit`
//! atomic and idempotent per reference.

mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryLedgerStore, InMemoryStagedBatchStore};
pub use postgres::{PostgresLedgerStore, PostgresStagedBatchStore};

use chrono::{DateTime, Utc};

use branchledger_accounting::{
    AccountKey, AccountStatus, CommitResult, EntryBatch, LedgerAccount, PostedEntry, StagedBatch,
};
use branchledger_core::{ExpectedVersion, TransactionRef};

use crate::error::StoreError;

#[async_trait::async_trait]
pub trait StagedBatchStore: Send + Sync {
    async fn load(&self, reference: &TransactionRef) -> Result<Option<StagedBatch>, StoreError>;

    /// Persist the batch if the stored version still matches `expected`.
    async fn save(&self, batch: &StagedBatch, expected: ExpectedVersion) -> Result<(), StoreError>;

    /// Batches still waiting on acknowledgements.
    async fn pending(&self) -> Result<Vec<StagedBatch>, StoreError>;
}

#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create an account; fails with a conflict if the key exists.
    async fn open_account(&self, account: LedgerAccount) -> Result<LedgerAccount, StoreError>;

    async fn set_account_status(
        &self,
        key: &AccountKey,
        status: AccountStatus,
    ) -> Result<LedgerAccount, StoreError>;

    async fn account(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, StoreError>;

    /// Post every line of a balanced batch and update balances, all or nothing.
    ///
    /// Committing an already committed reference returns the original result.
    async fn commit(&self, batch: &EntryBatch, at: DateTime<Utc>) -> Result<CommitResult, StoreError>;

    async fn committed(&self, reference: &TransactionRef) -> Result<Option<CommitResult>, StoreError>;

    async fn entries_for(&self, reference: &TransactionRef) -> Result<Vec<PostedEntry>, StoreError>;
}
