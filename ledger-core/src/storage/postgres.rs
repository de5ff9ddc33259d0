//! Postgres ledger store (sqlx)
//!
//! # Tables
//!
//! - `accounts` - one row per (user, currency, type), guarded by `version`
//! - `entries` - append-only mutation log
//! - `transfers` - two-leg moves
//!
//! The schema ships in `schema.sql` and is applied idempotently by
//! [`PgLedgerStore::ensure_schema`].

use super::{IsolationLevel, LedgerStore, UnitOfWork};
use crate::config::DatabaseConfig;
use crate::types::{Account, AccountType, Currency, Entry, Transfer};
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("../../schema.sql");

const ACCOUNT_COLUMNS: &str = r#"id, user_id, "type", currency, balance, available, hold, status,
    created_at, updated_at, version"#;

const ENTRY_COLUMNS: &str =
    r#"id, account_id, "type", amount, balance, reference, description, created_at"#;

const TRANSFER_COLUMNS: &str = r#"id, from_account_id, to_account_id, amount, currency, reference,
    status, created_at, completed_at"#;

/// Postgres-backed [`LedgerStore`]
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgLedgerStore {
    /// Connect a pool
    pub async fn connect(config: &DatabaseConfig, lock_timeout_ms: u64) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "Connected to Postgres ledger store"
        );

        Ok(Self::from_pool(pool, lock_timeout_ms))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indices if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        self.pool.execute(SCHEMA_SQL).await?;
        tracing::info!("Ledger schema ensured");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgUnitOfWork;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Tx> {
        let mut tx = self.pool.begin().await?;

        // Must be the first statement of the transaction.
        sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()))
            .execute(&mut *tx)
            .await?;

        if self.lock_timeout_ms > 0 {
            sqlx::query(&format!("SET LOCAL lock_timeout = {}", self.lock_timeout_ms))
                .execute(&mut *tx)
                .await?;
        }

        Ok(PgUnitOfWork { tx })
    }

    async fn insert_account(&self, account: &Account) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (id, user_id, "type", currency, balance, available, hold, status,
                                  created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(account.id)
        .bind(account.user_id)
        .bind(account.account_type.as_str())
        .bind(account.currency.as_str())
        .bind(account.balance)
        .bind(account.available)
        .bind(account.hold)
        .bind(account.status.as_str())
        .bind(account.created_at)
        .bind(account.updated_at)
        .bind(account.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(Error::AccountExists(format!(
                    "{}/{}/{}",
                    account.user_id, account.currency, account.account_type
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS))
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_account(
        &self,
        user_id: Uuid,
        currency: &Currency,
        account_type: AccountType,
    ) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            r#"SELECT {} FROM accounts WHERE user_id = $1 AND currency = $2 AND "type" = $3"#,
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .bind(currency.as_str())
        .bind(account_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn recent_entries(&self, account_id: Uuid, limit: usize) -> Result<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM entries
            WHERE account_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            ENTRY_COLUMNS
        ))
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn entry_log(&self, account_id: Uuid) -> Result<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM entries
            WHERE account_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
            ENTRY_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn get_transfer(&self, transfer_id: Uuid) -> Result<Option<Transfer>> {
        let row = sqlx::query(&format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS))
            .bind(transfer_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(transfer_from_row).transpose()
    }
}

/// Unit of work over one Postgres transaction.
///
/// Dropping it without `commit` rolls the transaction back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUnitOfWork").finish_non_exhaustive()
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_account(&mut self, account_id: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| Error::from(e).for_account(account_id))?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn update_account(&mut self, account: &Account, expected_version: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $1,
                available = $2,
                hold = $3,
                status = $4,
                updated_at = $5,
                version = $6
            WHERE id = $7 AND version = $8
            "#,
        )
        .bind(account.balance)
        .bind(account.available)
        .bind(account.hold)
        .bind(account.status.as_str())
        .bind(account.updated_at)
        .bind(account.version)
        .bind(account.id)
        .bind(expected_version)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| Error::from(e).for_account(account.id))?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_entry(&mut self, entry: &Entry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entries (id, account_id, "type", amount, balance, reference, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.account_id)
        .bind(entry.entry_type.as_str())
        .bind(entry.amount)
        .bind(entry.resulting_balance)
        .bind(&entry.reference)
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| Error::from(e).for_account(entry.account_id))?;

        Ok(())
    }

    async fn insert_transfer(&mut self, transfer: &Transfer) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transfers (id, from_account_id, to_account_id, amount, currency, reference,
                                   status, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(transfer.id)
        .bind(transfer.from_account_id)
        .bind(transfer.to_account_id)
        .bind(transfer.amount)
        .bind(transfer.currency.as_str())
        .bind(&transfer.reference)
        .bind(transfer.status.as_str())
        .bind(transfer.created_at)
        .bind(transfer.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| Error::from(e).for_account(transfer.from_account_id))?;

        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        account_type: row.try_get::<String, _>("type")?.parse()?,
        currency: Currency::new(&row.try_get::<String, _>("currency")?)?,
        balance: row.try_get("balance")?,
        available: row.try_get("available")?,
        hold: row.try_get("hold")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<Entry> {
    Ok(Entry {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        entry_type: row.try_get::<String, _>("type")?.parse()?,
        amount: row.try_get("amount")?,
        resulting_balance: row.try_get("balance")?,
        reference: row.try_get("reference")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<Transfer> {
    Ok(Transfer {
        id: row.try_get("id")?,
        from_account_id: row.try_get("from_account_id")?,
        to_account_id: row.try_get("to_account_id")?,
        amount: row.try_get("amount")?,
        currency: Currency::new(&row.try_get::<String, _>("currency")?)?,
        reference: row.try_get("reference")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
