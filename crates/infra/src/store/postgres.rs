//! Postgres-backed stores.
//!
//! The ledger store commits a batch in a single SQL transaction: touched
//! accounts are locked with `SELECT ... FOR UPDATE` in key order, balance
//! updates are guarded by the account version, and posted entries plus the
//! batch header are inserted before the transaction commits.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | StoreError | Scenario |
//! |----------------------|------------|----------|
//! | `23505` | `Concurrency` | Reference committed or staged concurrently |
//! | `40001` | `Concurrency` | Serialization failure |
//! | `40P01` | `Concurrency` | Deadlock detected |
//! | other / pool / io | `Backend` | Connection failures and the like |

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use branchledger_accounting::{
    AccountKey, AccountKind, AccountStatus, CommitPlan, CommitResult, EntryBatch, LedgerAccount,
    PostedEntry, PostingError, StagedBatch,
};
use branchledger_core::{
    AggregateRoot, DomainError, Direction, ExpectedVersion, PostedEntryId, TransactionRef,
};

use super::{LedgerStore, StagedBatchStore};
use crate::error::StoreError;

/// Tables used by both stores. Statements are idempotent.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ledger_accounts (
        branch_id    TEXT        NOT NULL,
        account_code TEXT        NOT NULL,
        name         TEXT        NOT NULL,
        kind         TEXT        NOT NULL,
        status       TEXT        NOT NULL,
        balance      BIGINT      NOT NULL DEFAULT 0,
        version      BIGINT      NOT NULL DEFAULT 0,
        PRIMARY KEY (branch_id, account_code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS committed_batches (
        reference    TEXT        PRIMARY KEY,
        committed_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS posted_entries (
        entry_id     UUID        PRIMARY KEY,
        reference    TEXT        NOT NULL REFERENCES committed_batches (reference),
        line_no      INTEGER     NOT NULL,
        branch_id    TEXT        NOT NULL,
        account_code TEXT        NOT NULL,
        direction    TEXT        NOT NULL CHECK (direction IN ('debit', 'credit')),
        amount       BIGINT      NOT NULL CHECK (amount > 0),
        description  TEXT        NOT NULL,
        posted_at    TIMESTAMPTZ NOT NULL,
        reverses     TEXT,
        UNIQUE (reference, line_no),
        FOREIGN KEY (branch_id, account_code) REFERENCES ledger_accounts (branch_id, account_code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS staged_batches (
        reference  TEXT        PRIMARY KEY,
        status     TEXT        NOT NULL,
        version    BIGINT      NOT NULL,
        body       JSONB       NOT NULL,
        staged_at  TIMESTAMPTZ,
        updated_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS staged_batches_status_idx ON staged_batches (status)",
];

/// Create the tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to apply ledger schema")?;
    }
    Ok(())
}

/// Connect and make sure the schema exists.
pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .with_context(|| "failed to connect to ledger database")?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

/// Postgres ledger: accounts, posted entries and committed batch headers.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, account), fields(account = %account.key), err)]
    async fn open_account(&self, account: LedgerAccount) -> Result<LedgerAccount, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_accounts (branch_id, account_code, name, kind, status, balance, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(account.key.branch.as_str())
        .bind(account.key.code.as_str())
        .bind(&account.name)
        .bind(account.kind.as_str())
        .bind(status_str(account.status))
        .bind(account.balance)
        .bind(account.version as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DomainError::conflict(format!("account {} already exists", account.key)).into()
            } else {
                map_sqlx_error("open_account", e)
            }
        })?;
        Ok(account)
    }

    #[instrument(skip(self), fields(account = %key), err)]
    async fn set_account_status(
        &self,
        key: &AccountKey,
        status: AccountStatus,
    ) -> Result<LedgerAccount, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE ledger_accounts
            SET status = $3,
                version = CASE WHEN status = $3 THEN version ELSE version + 1 END
            WHERE branch_id = $1 AND account_code = $2
            RETURNING branch_id, account_code, name, kind, status, balance, version
            "#,
        )
        .bind(key.branch.as_str())
        .bind(key.code.as_str())
        .bind(status_str(status))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_account_status", e))?;

        match row {
            Some(row) => account_from_row(&row),
            None => Err(PostingError::AccountNotFound {
                branch: key.branch.clone(),
                account: key.code.clone(),
            }
            .into()),
        }
    }

    #[instrument(skip(self), fields(account = %key), err)]
    async fn account(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT branch_id, account_code, name, kind, status, balance, version
            FROM ledger_accounts
            WHERE branch_id = $1 AND account_code = $2
            "#,
        )
        .bind(key.branch.as_str())
        .bind(key.code.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_account", e))?;

        row.as_ref().map(account_from_row).transpose()
    }

    #[instrument(
        skip(self, batch),
        fields(reference = %batch.reference, lines = batch.lines.len(), accounts = tracing::field::Empty),
        err
    )]
    async fn commit(&self, batch: &EntryBatch, at: DateTime<Utc>) -> Result<CommitResult, StoreError> {
        let span = Span::current();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(existing) = load_commit(&mut tx, &batch.reference).await? {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(existing);
        }

        // Lock in key order so concurrent commits over shared accounts queue
        // instead of deadlocking.
        let keys = CommitPlan::keys_for(batch);
        span.record("accounts", keys.len());
        let mut accounts = BTreeMap::new();
        for key in keys {
            if let Some(account) = lock_account(&mut tx, &key).await? {
                accounts.insert(key, account);
            }
        }

        let plan = match CommitPlan::prepare(batch, &accounts, at) {
            Ok(plan) => plan,
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err.into());
            }
        };

        for update in &plan.updates {
            let result = sqlx::query(
                r#"
                UPDATE ledger_accounts
                SET balance = $3, version = version + 1
                WHERE branch_id = $1 AND account_code = $2 AND version = $4
                "#,
            )
            .bind(update.key.branch.as_str())
            .bind(update.key.code.as_str())
            .bind(update.new_balance)
            .bind(update.expected_version as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_balance", e))?;

            if result.rows_affected() != 1 {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::Concurrency(format!(
                    "account {} changed since version {}",
                    update.key, update.expected_version
                )));
            }
        }

        sqlx::query("INSERT INTO committed_batches (reference, committed_at) VALUES ($1, $2)")
            .bind(plan.reference.as_str())
            .bind(plan.committed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_batch_header", e))?;

        for entry in &plan.entries {
            sqlx::query(
                r#"
                INSERT INTO posted_entries (
                    entry_id, reference, line_no, branch_id, account_code,
                    direction, amount, description, posted_at, reverses
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(entry.id.as_uuid())
            .bind(entry.reference.as_str())
            .bind(entry.line_no as i32)
            .bind(entry.branch.as_str())
            .bind(entry.account.as_str())
            .bind(direction_str(entry.direction))
            .bind(entry.amount)
            .bind(&entry.description)
            .bind(entry.posted_at)
            .bind(entry.reverses.as_ref().map(|r| r.as_str()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_posted_entry", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(plan.result())
    }

    #[instrument(skip(self), fields(reference = %reference), err)]
    async fn committed(&self, reference: &TransactionRef) -> Result<Option<CommitResult>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let result = load_commit(&mut tx, reference).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(result)
    }

    #[instrument(skip(self), fields(reference = %reference), err)]
    async fn entries_for(&self, reference: &TransactionRef) -> Result<Vec<PostedEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, reference, line_no, branch_id, account_code,
                   direction, amount, description, posted_at, reverses
            FROM posted_entries
            WHERE reference = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(reference.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }
}

/// Postgres staged batch store; the aggregate is kept as a JSONB document.
#[derive(Debug, Clone)]
pub struct PostgresStagedBatchStore {
    pool: Arc<PgPool>,
}

impl PostgresStagedBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl StagedBatchStore for PostgresStagedBatchStore {
    #[instrument(skip(self), fields(reference = %reference), err)]
    async fn load(&self, reference: &TransactionRef) -> Result<Option<StagedBatch>, StoreError> {
        let row = sqlx::query("SELECT body FROM staged_batches WHERE reference = $1")
            .bind(reference.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_staged_batch", e))?;

        row.map(|row| {
            let body: serde_json::Value = row
                .try_get("body")
                .map_err(|e| map_sqlx_error("decode_staged_batch", e))?;
            serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    #[instrument(
        skip(self, batch),
        fields(reference = %batch.reference(), version = batch.version(), expected = ?expected),
        err
    )]
    async fn save(&self, batch: &StagedBatch, expected: ExpectedVersion) -> Result<(), StoreError> {
        let body = serde_json::to_value(batch).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM staged_batches WHERE reference = $1 FOR UPDATE")
                .bind(batch.reference().as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("check_staged_version", e))?;
        let current = current.unwrap_or(0) as u64;

        if let Err(conflict) = expected.check(current) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Concurrency(format!("batch {}: {conflict}", batch.reference())));
        }

        sqlx::query(
            r#"
            INSERT INTO staged_batches (reference, status, version, body, staged_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (reference) DO UPDATE
            SET status = EXCLUDED.status,
                version = EXCLUDED.version,
                body = EXCLUDED.body,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(batch.reference().as_str())
        .bind(batch.status().as_str())
        .bind(batch.version() as i64)
        .bind(&body)
        .bind(batch.staged_at())
        .bind(batch.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("save_staged_batch", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn pending(&self) -> Result<Vec<StagedBatch>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM staged_batches
            WHERE status IN ('awaiting_acknowledgement', 'partially_acknowledged')
            ORDER BY staged_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_pending", e))?;

        rows.iter()
            .map(|row| {
                let body: serde_json::Value = row
                    .try_get("body")
                    .map_err(|e| map_sqlx_error("decode_staged_batch", e))?;
                serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

async fn lock_account(
    tx: &mut Transaction<'_, Postgres>,
    key: &AccountKey,
) -> Result<Option<LedgerAccount>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT branch_id, account_code, name, kind, status, balance, version
        FROM ledger_accounts
        WHERE branch_id = $1 AND account_code = $2
        FOR UPDATE
        "#,
    )
    .bind(key.branch.as_str())
    .bind(key.code.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_account", e))?;

    row.as_ref().map(account_from_row).transpose()
}

async fn load_commit(
    tx: &mut Transaction<'_, Postgres>,
    reference: &TransactionRef,
) -> Result<Option<CommitResult>, StoreError> {
    let committed_at: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT committed_at FROM committed_batches WHERE reference = $1")
            .bind(reference.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_commit", e))?;

    let Some(committed_at) = committed_at else {
        return Ok(None);
    };

    let ids: Vec<uuid::Uuid> =
        sqlx::query_scalar("SELECT entry_id FROM posted_entries WHERE reference = $1 ORDER BY line_no ASC")
            .bind(reference.as_str())
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_commit_entries", e))?;

    Ok(Some(CommitResult {
        reference: reference.clone(),
        posted_entries: ids.into_iter().map(PostedEntryId::from_uuid).collect(),
        committed_at,
    }))
}

fn account_from_row(row: &PgRow) -> Result<LedgerAccount, StoreError> {
    let decode = |e| map_sqlx_error("decode_account", e);
    let branch: String = row.try_get("branch_id").map_err(decode)?;
    let code: String = row.try_get("account_code").map_err(decode)?;
    let kind: String = row.try_get("kind").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;

    Ok(LedgerAccount {
        key: AccountKey::new(branch.parse()?, code.parse()?),
        name: row.try_get("name").map_err(decode)?,
        kind: kind.parse::<AccountKind>()?,
        status: parse_status(&status)?,
        balance: row.try_get("balance").map_err(decode)?,
        version: version as u64,
    })
}

fn entry_from_row(row: &PgRow) -> Result<PostedEntry, StoreError> {
    let decode = |e| map_sqlx_error("decode_posted_entry", e);
    let id: uuid::Uuid = row.try_get("entry_id").map_err(decode)?;
    let reference: String = row.try_get("reference").map_err(decode)?;
    let line_no: i32 = row.try_get("line_no").map_err(decode)?;
    let branch: String = row.try_get("branch_id").map_err(decode)?;
    let account: String = row.try_get("account_code").map_err(decode)?;
    let direction: String = row.try_get("direction").map_err(decode)?;
    let reverses: Option<String> = row.try_get("reverses").map_err(decode)?;

    Ok(PostedEntry {
        id: PostedEntryId::from_uuid(id),
        reference: reference.parse()?,
        line_no: line_no as u32,
        branch: branch.parse()?,
        account: account.parse()?,
        direction: parse_direction(&direction)?,
        amount: row.try_get("amount").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        posted_at: row.try_get("posted_at").map_err(decode)?,
        reverses: reverses.map(|r| r.parse()).transpose()?,
    })
}

fn status_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Open => "open",
        AccountStatus::Closed => "closed",
    }
}

fn parse_status(raw: &str) -> Result<AccountStatus, DomainError> {
    match raw {
        "open" => Ok(AccountStatus::Open),
        "closed" => Ok(AccountStatus::Closed),
        other => Err(DomainError::validation(format!("unknown account status {other:?}"))),
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Debit => "debit",
        Direction::Credit => "credit",
    }
}

fn parse_direction(raw: &str) -> Result<Direction, DomainError> {
    match raw {
        "debit" => Ok(Direction::Debit),
        "credit" => Ok(Direction::Credit),
        other => Err(DomainError::validation(format!("unknown direction {other:?}"))),
    }
}

/// Map SQLx errors to store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // unique violation, serialization failure, deadlock
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Concurrency(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}
