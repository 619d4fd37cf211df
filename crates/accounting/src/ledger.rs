//! Permanent ledger: accounts, posted entries and commit planning.
//!
//! `Account.balance` is only ever changed by applying a [`CommitPlan`]. A plan
//! is computed purely from a confirmed batch and the current account rows;
//! stores apply it atomically or not at all.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use branchledger_core::{
    AccountCode, BranchId, Direction, DomainError, PostedEntryId, TransactionRef,
};

use crate::builder::EntryBatch;
use crate::error::{PostingError, PostingResult};

/// High-level account kind (determines normal balance side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountKind {
    /// Direction that increases the balance.
    pub fn normal_side(self) -> Direction {
        match self {
            AccountKind::Asset | AccountKind::Expense => Direction::Debit,
            AccountKind::Liability | AccountKind::Equity | AccountKind::Revenue => {
                Direction::Credit
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::Asset => "asset",
            AccountKind::Liability => "liability",
            AccountKind::Equity => "equity",
            AccountKind::Revenue => "revenue",
            AccountKind::Expense => "expense",
        }
    }
}

impl core::str::FromStr for AccountKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asset" => Ok(AccountKind::Asset),
            "liability" => Ok(AccountKind::Liability),
            "equity" => Ok(AccountKind::Equity),
            "revenue" => Ok(AccountKind::Revenue),
            "expense" => Ok(AccountKind::Expense),
            other => Err(DomainError::validation(format!("unknown account kind {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Open,
    Closed,
}

/// A chart account on one branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub branch: BranchId,
    pub code: AccountCode,
}

impl AccountKey {
    pub fn new(branch: BranchId, code: AccountCode) -> Self {
        Self { branch, code }
    }
}

impl core::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.branch, self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub key: AccountKey,
    pub name: String,
    pub kind: AccountKind,
    pub status: AccountStatus,
    /// Running balance on the normal side, in minor units.
    pub balance: i64,
    pub version: u64,
}

impl LedgerAccount {
    pub fn open(key: AccountKey, name: impl Into<String>, kind: AccountKind) -> Self {
        Self {
            key,
            name: name.into(),
            kind,
            status: AccountStatus::Open,
            balance: 0,
            version: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == AccountStatus::Open
    }

    /// Balance with debits positive, whatever the account kind.
    pub fn debit_balance(&self) -> i128 {
        match self.kind.normal_side() {
            Direction::Debit => self.balance as i128,
            Direction::Credit => -(self.balance as i128),
        }
    }

    fn balance_after(&self, direction: Direction, amount: i64) -> Option<i64> {
        if direction == self.kind.normal_side() {
            self.balance.checked_add(amount)
        } else {
            self.balance.checked_sub(amount)
        }
    }
}

/// Immutable, dated debit or credit against one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedEntry {
    pub id: PostedEntryId,
    pub reference: TransactionRef,
    pub line_no: u32,
    pub branch: BranchId,
    pub account: AccountCode,
    pub direction: Direction,
    pub amount: i64,
    pub description: String,
    pub posted_at: DateTime<Utc>,
    /// Original reference when this entry belongs to a reversal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses: Option<TransactionRef>,
}

impl PostedEntry {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.branch.clone(), self.account.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub reference: TransactionRef,
    pub posted_entries: Vec<PostedEntryId>,
    pub committed_at: DateTime<Utc>,
}

/// New balance of one account, guarded by the version it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub key: AccountKey,
    pub expected_version: u64,
    pub new_balance: i64,
}

/// Everything a store must write to commit one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPlan {
    pub reference: TransactionRef,
    pub entries: Vec<PostedEntry>,
    pub updates: Vec<AccountUpdate>,
    pub committed_at: DateTime<Utc>,
}

impl CommitPlan {
    /// Accounts a batch touches, in lock order.
    pub fn keys_for(batch: &EntryBatch) -> BTreeSet<AccountKey> {
        batch
            .lines
            .iter()
            .map(|l| AccountKey::new(l.branch.clone(), l.account.clone()))
            .collect()
    }

    /// Validate a batch against the current accounts and compute the writes.
    ///
    /// Any failing line fails the whole plan.
    pub fn prepare(
        batch: &EntryBatch,
        accounts: &BTreeMap<AccountKey, LedgerAccount>,
        at: DateTime<Utc>,
    ) -> PostingResult<Self> {
        if batch.lines.is_empty() {
            return Err(DomainError::validation("cannot commit an empty batch").into());
        }
        if batch.lines.iter().any(|l| l.amount <= 0) {
            return Err(DomainError::validation("amount must be positive").into());
        }
        if !batch.is_balanced() {
            return Err(PostingError::UnbalancedEntry {
                debits: batch.debit_total(),
                credits: batch.credit_total(),
            });
        }

        let mut working: BTreeMap<AccountKey, LedgerAccount> = BTreeMap::new();
        let mut entries = Vec::with_capacity(batch.lines.len());

        for line in &batch.lines {
            let key = AccountKey::new(line.branch.clone(), line.account.clone());
            let account = match working.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let current = accounts.get(&key).ok_or_else(|| PostingError::AccountNotFound {
                        branch: line.branch.clone(),
                        account: line.account.clone(),
                    })?;
                    entry.insert(current.clone())
                }
            };
            if !account.is_open() {
                return Err(PostingError::AccountClosed {
                    branch: line.branch.clone(),
                    account: line.account.clone(),
                });
            }
            account.balance = account
                .balance_after(line.direction, line.amount)
                .ok_or_else(|| DomainError::invariant(format!("balance overflow on {key}")))?;

            entries.push(PostedEntry {
                id: PostedEntryId::new(),
                reference: batch.reference.clone(),
                line_no: line.line_no,
                branch: line.branch.clone(),
                account: line.account.clone(),
                direction: line.direction,
                amount: line.amount,
                description: line.description.clone(),
                posted_at: at,
                reverses: batch.reversal_of.clone(),
            });
        }

        let updates = working
            .into_values()
            .map(|account| AccountUpdate {
                expected_version: account.version,
                new_balance: account.balance,
                key: account.key,
            })
            .collect();

        Ok(Self {
            reference: batch.reference.clone(),
            entries,
            updates,
            committed_at: at,
        })
    }

    pub fn result(&self) -> CommitResult {
        CommitResult {
            reference: self.reference.clone(),
            posted_entries: self.entries.iter().map(|e| e.id).collect(),
            committed_at: self.committed_at,
        }
    }

    /// Apply the balance updates to in-memory accounts, all or nothing.
    pub fn apply_to(&self, accounts: &mut BTreeMap<AccountKey, LedgerAccount>) -> PostingResult<()> {
        for update in &self.updates {
            let account = accounts.get(&update.key).ok_or_else(|| PostingError::AccountNotFound {
                branch: update.key.branch.clone(),
                account: update.key.code.clone(),
            })?;
            if account.version != update.expected_version {
                return Err(PostingError::CommitConflict {
                    reference: self.reference.clone(),
                    detail: format!(
                        "account {} moved from version {} to {}",
                        update.key, update.expected_version, account.version
                    ),
                });
            }
            if !account.is_open() {
                return Err(PostingError::AccountClosed {
                    branch: update.key.branch.clone(),
                    account: update.key.code.clone(),
                });
            }
        }

        for update in &self.updates {
            if let Some(account) = accounts.get_mut(&update.key) {
                account.balance = update.new_balance;
                account.version += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EntryLine;
    use crate::registry::EntryType;
    use proptest::prelude::*;

    fn code<T: core::str::FromStr>(s: &str) -> T
    where
        T::Err: core::fmt::Debug,
    {
        s.parse().unwrap()
    }

    fn key(branch: &str, account: &str) -> AccountKey {
        AccountKey::new(code(branch), code(account))
    }

    fn chart() -> BTreeMap<AccountKey, LedgerAccount> {
        [
            ("BR1", "1000", AccountKind::Asset),
            ("BR1", "2100", AccountKind::Liability),
            ("BR2", "1000", AccountKind::Asset),
            ("BR2", "2100", AccountKind::Liability),
        ]
        .into_iter()
        .map(|(b, a, kind)| (key(b, a), LedgerAccount::open(key(b, a), a, kind)))
        .collect()
    }

    fn line(no: u32, branch: &str, account: &str, direction: Direction, amount: i64) -> EntryLine {
        EntryLine {
            line_no: no,
            leg_number: 0,
            rule: code("R-DEP"),
            event: code("DEPOSIT@SAV001"),
            branch: code(branch),
            account: code(account),
            direction,
            amount,
            description: "deposit".into(),
        }
    }

    fn batch(reference: &str, lines: Vec<EntryLine>) -> EntryBatch {
        EntryBatch {
            reference: code(reference),
            rule: code("R-DEP"),
            event: code("DEPOSIT@SAV001"),
            entry_type: EntryType::Cash,
            source_branch: code("BR1"),
            destination_branch: None,
            inter_branch: false,
            double_validation: false,
            reversal_of: None,
            lines,
        }
    }

    #[test]
    fn deposit_increases_cash_and_deposits() {
        let mut accounts = chart();
        let deposit = batch(
            "TXN-1",
            vec![
                line(1, "BR1", "1000", Direction::Debit, 10_000),
                line(2, "BR1", "2100", Direction::Credit, 10_000),
            ],
        );

        let plan = CommitPlan::prepare(&deposit, &accounts, Utc::now()).unwrap();
        assert_eq!(plan.entries.len(), 2);
        plan.apply_to(&mut accounts).unwrap();

        assert_eq!(accounts[&key("BR1", "1000")].balance, 10_000);
        assert_eq!(accounts[&key("BR1", "2100")].balance, 10_000);
        assert_eq!(accounts[&key("BR1", "1000")].version, 1);
    }

    #[test]
    fn missing_or_closed_account_fails_the_whole_plan() {
        let mut accounts = chart();
        let lines = vec![
            line(1, "BR1", "1000", Direction::Debit, 500),
            line(2, "BR1", "2999", Direction::Credit, 500),
        ];
        let err = CommitPlan::prepare(&batch("TXN-2", lines), &accounts, Utc::now()).unwrap_err();
        assert!(matches!(err, PostingError::AccountNotFound { .. }));

        if let Some(account) = accounts.get_mut(&key("BR1", "2100")) {
            account.status = AccountStatus::Closed;
        }
        let lines = vec![
            line(1, "BR1", "1000", Direction::Debit, 500),
            line(2, "BR1", "2100", Direction::Credit, 500),
        ];
        let err = CommitPlan::prepare(&batch("TXN-3", lines), &accounts, Utc::now()).unwrap_err();
        assert!(matches!(err, PostingError::AccountClosed { .. }));
        assert_eq!(accounts[&key("BR1", "1000")].balance, 0);
    }

    #[test]
    fn stale_plan_is_a_commit_conflict() {
        let mut accounts = chart();
        let deposit = batch(
            "TXN-4",
            vec![
                line(1, "BR1", "1000", Direction::Debit, 100),
                line(2, "BR1", "2100", Direction::Credit, 100),
            ],
        );
        let first = CommitPlan::prepare(&deposit, &accounts, Utc::now()).unwrap();
        let second = CommitPlan::prepare(&deposit, &accounts, Utc::now()).unwrap();
        first.apply_to(&mut accounts).unwrap();

        let err = second.apply_to(&mut accounts).unwrap_err();
        assert!(matches!(err, PostingError::CommitConflict { .. }));
        assert_eq!(accounts[&key("BR1", "1000")].balance, 100);
    }

    #[test]
    fn reversal_restores_every_balance() {
        let mut accounts = chart();
        let transfer = EntryBatch {
            inter_branch: true,
            destination_branch: Some(code("BR2")),
            ..batch(
                "TXN-5",
                vec![
                    line(1, "BR1", "2100", Direction::Debit, 5_000),
                    line(2, "BR2", "2100", Direction::Credit, 5_000),
                ],
            )
        };
        CommitPlan::prepare(&transfer, &accounts, Utc::now())
            .unwrap()
            .apply_to(&mut accounts)
            .unwrap();
        assert_eq!(accounts[&key("BR1", "2100")].balance, -5_000);
        assert_eq!(accounts[&key("BR2", "2100")].balance, 5_000);

        let reversal = transfer.reversal().unwrap();
        let plan = CommitPlan::prepare(&reversal, &accounts, Utc::now()).unwrap();
        assert!(plan.entries.iter().all(|e| e.reverses == Some(code("TXN-5"))));
        plan.apply_to(&mut accounts).unwrap();

        assert!(accounts.values().all(|a| a.balance == 0));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: after any sequence of balanced commits, debits and
        /// credits across the whole ledger net to zero.
        #[test]
        fn ledger_debits_equal_credits(
            amounts in prop::collection::vec((1i64..1_000_000i64, 0usize..4, 0usize..4), 1..10)
        ) {
            let mut accounts = chart();
            let keys: Vec<AccountKey> = accounts.keys().cloned().collect();

            for (i, (amount, from, to)) in amounts.into_iter().enumerate() {
                let (d, c) = (&keys[from], &keys[to]);
                let lines = vec![
                    line(1, d.branch.as_str(), d.code.as_str(), Direction::Debit, amount),
                    line(2, c.branch.as_str(), c.code.as_str(), Direction::Credit, amount),
                ];
                let plan = CommitPlan::prepare(&batch(&format!("TXN-{i}"), lines), &accounts, Utc::now()).unwrap();
                plan.apply_to(&mut accounts).unwrap();
            }

            let total: i128 = accounts.values().map(LedgerAccount::debit_balance).sum();
            prop_assert_eq!(total, 0);
        }
    }
}
