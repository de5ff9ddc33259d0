//! Storage boundary
//!
//! The engine talks to storage through two traits:
//!
//! - [`LedgerStore`] - committed-state reads and account creation
//! - [`UnitOfWork`] - one transaction: locking reads, conditional writes,
//!   appends, commit/rollback
//!
//! # Backends
//!
//! - [`PgLedgerStore`] - Postgres via sqlx (`SELECT ... FOR UPDATE`)
//! - [`MemoryLedgerStore`] - in-process tables with per-row async locks
//!
//! # Contract
//!
//! - `lock_account` blocks until the row lock is granted and holds it until
//!   the unit of work ends.
//! - `update_account` is conditional on the stored version and reports whether
//!   a row matched; it never errors on a version mismatch.
//! - Dropping a unit of work without committing rolls it back.
//! - Reads on the store itself see committed state only.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryLedgerStore, MemoryUnitOfWork};
pub use postgres::{PgLedgerStore, PgUnitOfWork};

use crate::types::{Account, AccountType, Currency, Entry, Transfer};
use crate::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Transaction isolation requested for a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Default level for single-account mutations (row locks do the work)
    ReadCommitted,
    /// Strictest level, used for transfers
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Persistent ledger tables
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Transaction handle
    type Tx: UnitOfWork;

    /// Open a unit of work
    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Tx>;

    /// Insert a freshly opened account.
    ///
    /// Fails with `AccountExists` when (user, currency, type) is taken.
    async fn insert_account(&self, account: &Account) -> Result<()>;

    /// Committed account row
    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>>;

    /// Committed account row by owner key
    async fn find_account(
        &self,
        user_id: Uuid,
        currency: &Currency,
        account_type: AccountType,
    ) -> Result<Option<Account>>;

    /// Most recent entries first, at most `limit`
    async fn recent_entries(&self, account_id: Uuid, limit: usize) -> Result<Vec<Entry>>;

    /// Full entry log, oldest first
    async fn entry_log(&self, account_id: Uuid) -> Result<Vec<Entry>>;

    /// Committed transfer row
    async fn get_transfer(&self, transfer_id: Uuid) -> Result<Option<Transfer>>;
}

/// One storage transaction
#[async_trait]
pub trait UnitOfWork: Send {
    /// Locking read (`SELECT ... FOR UPDATE`); `None` if the row does not exist
    async fn lock_account(&mut self, account_id: Uuid) -> Result<Option<Account>>;

    /// Write `account` if the stored row still has `expected_version`.
    ///
    /// Returns `false` when no row matched.
    async fn update_account(&mut self, account: &Account, expected_version: i64) -> Result<bool>;

    /// Append an entry
    async fn insert_entry(&mut self, entry: &Entry) -> Result<()>;

    /// Insert a transfer row
    async fn insert_transfer(&mut self, transfer: &Transfer) -> Result<()>;

    /// Make every write visible atomically and release locks
    async fn commit(self) -> Result<()>;

    /// Discard every write and release locks
    async fn rollback(self) -> Result<()>;
}
