use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use branchledger_accounting::{
    AccountKey, AccountStatus, CommitPlan, CommitResult, EntryBatch, LedgerAccount, PostedEntry,
    StagedBatch,
};
use branchledger_core::{AggregateRoot, DomainError, ExpectedVersion, TransactionRef};

use super::{LedgerStore, StagedBatchStore};
use crate::error::StoreError;

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

/// In-memory staged batch store.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStagedBatchStore {
    batches: RwLock<HashMap<TransactionRef, StagedBatch>>,
}

impl InMemoryStagedBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.batches.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl StagedBatchStore for InMemoryStagedBatchStore {
    async fn load(&self, reference: &TransactionRef) -> Result<Option<StagedBatch>, StoreError> {
        let batches = self.batches.read().map_err(|_| poisoned())?;
        Ok(batches.get(reference).cloned())
    }

    async fn save(&self, batch: &StagedBatch, expected: ExpectedVersion) -> Result<(), StoreError> {
        let mut batches = self.batches.write().map_err(|_| poisoned())?;
        let current = batches.get(batch.reference()).map(|b| b.version()).unwrap_or(0);
        expected
            .check(current)
            .map_err(|conflict| StoreError::Concurrency(format!("batch {}: {conflict}", batch.reference())))?;
        batches.insert(batch.reference().clone(), batch.clone());
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<StagedBatch>, StoreError> {
        let batches = self.batches.read().map_err(|_| poisoned())?;
        let mut pending: Vec<StagedBatch> = batches
            .values()
            .filter(|b| b.status().is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.staged_at().cmp(&b.staged_at()));
        Ok(pending)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: BTreeMap<AccountKey, LedgerAccount>,
    entries: Vec<PostedEntry>,
    commits: HashMap<TransactionRef, CommitResult>,
}

/// In-memory ledger.
///
/// One lock guards accounts, entries and commit records together, so a
/// commit is observed entirely or not at all.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<LedgerState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All posted entries in posting order.
    pub fn all_entries(&self) -> Vec<PostedEntry> {
        self.state.read().map(|s| s.entries.clone()).unwrap_or_default()
    }

    pub fn accounts(&self) -> Vec<LedgerAccount> {
        self.state
            .read()
            .map(|s| s.accounts.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn open_account(&self, account: LedgerAccount) -> Result<LedgerAccount, StoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.accounts.contains_key(&account.key) {
            return Err(DomainError::conflict(format!("account {} already exists", account.key)).into());
        }
        state.accounts.insert(account.key.clone(), account.clone());
        Ok(account)
    }

    async fn set_account_status(
        &self,
        key: &AccountKey,
        status: AccountStatus,
    ) -> Result<LedgerAccount, StoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let account = state
            .accounts
            .get_mut(key)
            .ok_or_else(|| branchledger_accounting::PostingError::AccountNotFound {
                branch: key.branch.clone(),
                account: key.code.clone(),
            })?;
        if account.status != status {
            account.status = status;
            account.version += 1;
        }
        Ok(account.clone())
    }

    async fn account(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.accounts.get(key).cloned())
    }

    async fn commit(&self, batch: &EntryBatch, at: DateTime<Utc>) -> Result<CommitResult, StoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if let Some(existing) = state.commits.get(&batch.reference) {
            return Ok(existing.clone());
        }

        let plan = CommitPlan::prepare(batch, &state.accounts, at)?;
        plan.apply_to(&mut state.accounts)?;
        state.entries.extend(plan.entries.iter().cloned());
        let result = plan.result();
        state.commits.insert(batch.reference.clone(), result.clone());
        Ok(result)
    }

    async fn committed(&self, reference: &TransactionRef) -> Result<Option<CommitResult>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.commits.get(reference).cloned())
    }

    async fn entries_for(&self, reference: &TransactionRef) -> Result<Vec<PostedEntry>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .entries
            .iter()
            .filter(|e| &e.reference == reference)
            .cloned()
            .collect())
    }
}
