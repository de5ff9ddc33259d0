//! In-process ledger store
//!
//! Committed tables live behind a `parking_lot::RwLock`. Row locks are one
//! `tokio::sync::Mutex` per account, held by the unit of work that took them
//! until it commits or is dropped. Writes are staged inside the unit of work
//! and applied to the tables in a single critical section on commit, so
//! readers never observe a half-applied operation.

use super::{IsolationLevel, LedgerStore, UnitOfWork};
use crate::types::{Account, AccountType, Currency, Entry, Transfer};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    entries: HashMap<Uuid, Vec<Entry>>,
    transfers: HashMap<Uuid, Transfer>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<Tables>,
    row_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Inner {
    fn row_lock(&self, account_id: Uuid) -> Arc<Mutex<()>> {
        self.row_locks.entry(account_id).or_default().clone()
    }
}

/// In-memory [`LedgerStore`]
///
/// Cheap to clone; clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    inner: Arc<Inner>,
}

impl MemoryLedgerStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed accounts
    pub fn account_count(&self) -> usize {
        self.inner.tables.read().accounts.len()
    }

    /// Number of committed transfers
    pub fn transfer_count(&self) -> usize {
        self.inner.tables.read().transfers.len()
    }

    /// Bump a row's version without taking its lock, the way a writer that
    /// skips the locking read path would.
    #[cfg(test)]
    pub(crate) fn bump_version_unlocked(&self, account_id: Uuid) {
        if let Some(account) = self.inner.tables.write().accounts.get_mut(&account_id) {
            account.version += 1;
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Tx = MemoryUnitOfWork;

    async fn begin(&self, _isolation: IsolationLevel) -> Result<Self::Tx> {
        // Row locks already serialize every account a unit of work touches.
        Ok(MemoryUnitOfWork {
            inner: self.inner.clone(),
            locks: HashMap::new(),
            accounts: HashMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
        })
    }

    async fn insert_account(&self, account: &Account) -> Result<()> {
        let mut tables = self.inner.tables.write();

        let taken = tables.accounts.values().any(|existing| {
            existing.user_id == account.user_id
                && existing.currency == account.currency
                && existing.account_type == account.account_type
        });
        if taken {
            return Err(Error::AccountExists(format!(
                "{}/{}/{}",
                account.user_id, account.currency, account.account_type
            )));
        }
        if tables.accounts.contains_key(&account.id) {
            return Err(Error::AccountExists(account.id.to_string()));
        }

        tables.accounts.insert(account.id, account.clone());
        tracing::debug!(account_id = %account.id, "Account inserted");
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        Ok(self.inner.tables.read().accounts.get(&account_id).cloned())
    }

    async fn find_account(
        &self,
        user_id: Uuid,
        currency: &Currency,
        account_type: AccountType,
    ) -> Result<Option<Account>> {
        let tables = self.inner.tables.read();
        Ok(tables
            .accounts
            .values()
            .find(|a| a.user_id == user_id && &a.currency == currency && a.account_type == account_type)
            .cloned())
    }

    async fn recent_entries(&self, account_id: Uuid, limit: usize) -> Result<Vec<Entry>> {
        let tables = self.inner.tables.read();
        Ok(tables
            .entries
            .get(&account_id)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn entry_log(&self, account_id: Uuid) -> Result<Vec<Entry>> {
        let tables = self.inner.tables.read();
        Ok(tables.entries.get(&account_id).cloned().unwrap_or_default())
    }

    async fn get_transfer(&self, transfer_id: Uuid) -> Result<Option<Transfer>> {
        Ok(self.inner.tables.read().transfers.get(&transfer_id).cloned())
    }
}

/// Unit of work over [`MemoryLedgerStore`]
#[derive(Debug)]
pub struct MemoryUnitOfWork {
    inner: Arc<Inner>,
    locks: HashMap<Uuid, OwnedMutexGuard<()>>,
    accounts: HashMap<Uuid, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

impl MemoryUnitOfWork {
    fn current(&self, account_id: Uuid) -> Option<Account> {
        self.accounts
            .get(&account_id)
            .cloned()
            .or_else(|| self.inner.tables.read().accounts.get(&account_id).cloned())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_account(&mut self, account_id: Uuid) -> Result<Option<Account>> {
        if !self.locks.contains_key(&account_id) {
            let exists = self.inner.tables.read().accounts.contains_key(&account_id);
            if !exists {
                return Ok(None);
            }
            let guard = self.inner.row_lock(account_id).lock_owned().await;
            self.locks.insert(account_id, guard);
            tracing::debug!(account_id = %account_id, "Row lock acquired");
        }
        Ok(self.current(account_id))
    }

    async fn update_account(&mut self, account: &Account, expected_version: i64) -> Result<bool> {
        match self.current(account.id) {
            Some(stored) if stored.version == expected_version => {
                self.accounts.insert(account.id, account.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_entry(&mut self, entry: &Entry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    async fn insert_transfer(&mut self, transfer: &Transfer) -> Result<()> {
        self.transfers.push(transfer.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        {
            let mut tables = self.inner.tables.write();
            for (id, account) in self.accounts.drain() {
                tables.accounts.insert(id, account);
            }
            for entry in self.entries.drain(..) {
                tables.entries.entry(entry.account_id).or_default().push(entry);
            }
            for transfer in self.transfers.drain(..) {
                tables.transfers.insert(transfer.id, transfer);
            }
        }
        // Row locks are released when `self` drops here, after the tables are updated.
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
