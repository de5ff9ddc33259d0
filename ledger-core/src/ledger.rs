//! Ledger engine
//!
//! Every mutation runs as one unit of work:
//!
//! ```text
//! begin -> lock rows -> validate -> conditional write + append -> commit -> publish
//!                          |                |
//!                          +-- rollback <---+
//! ```
//!
//! Rows are locked for the whole unit of work; the version-conditional write
//! is a second, independent guard. Transfers lock both accounts in ascending
//! id order so opposing transfers cannot deadlock. The engine never retries:
//! `Error::is_retryable` tells the caller what is worth another attempt.
//!
//! Dropping an in-flight call (cancellation or `operation_timeout_ms`) drops
//! its unit of work, which rolls it back.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{AccountType, Currency, EngineConfig, Ledger, MemoryLedgerStore};
//! use rust_decimal::Decimal;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> ledger_core::Result<()> {
//!     let ledger = Ledger::new(MemoryLedgerStore::new(), EngineConfig::default());
//!
//!     let account = ledger
//!         .open_account(Uuid::now_v7(), Currency::new("USD")?, AccountType::Asset)
//!         .await?;
//!     ledger
//!         .credit(account.id, Decimal::new(10_000, 2), "dep-1", "bank deposit")
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

use crate::config::EngineConfig;
use crate::events::{EventPublisher, LedgerEntryEvent, NoopPublisher};
use crate::metrics::Metrics;
use crate::storage::{IsolationLevel, LedgerStore, UnitOfWork};
use crate::types::{
    Account, AccountType, Currency, Entry, EntryType, ReplayReport, Transfer, TransferStatus,
};
use crate::{Error, Result};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Single-account state transition
#[derive(Debug, Clone, Copy)]
enum Mutation {
    Credit(Decimal),
    Debit(Decimal),
    Hold(Decimal),
    Release(Decimal),
    Close,
}

impl Mutation {
    fn apply(self, account: &mut Account) -> Result<()> {
        match self {
            Mutation::Credit(amount) => account.apply_credit(amount),
            Mutation::Debit(amount) => account.apply_debit(amount),
            Mutation::Hold(amount) => account.apply_hold(amount),
            Mutation::Release(amount) => account.apply_release(amount),
            Mutation::Close => account.apply_close(),
        }
    }

    /// Entry recorded for this transition, if any
    fn entry(self) -> Option<(EntryType, Decimal)> {
        match self {
            Mutation::Credit(amount) => Some((EntryType::Credit, amount)),
            Mutation::Debit(amount) => Some((EntryType::Debit, amount)),
            Mutation::Hold(_) | Mutation::Release(_) | Mutation::Close => None,
        }
    }
}

/// Main ledger interface
pub struct Ledger<S: LedgerStore> {
    store: Arc<S>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Option<Arc<Metrics>>,
    config: EngineConfig,
}

impl<S: LedgerStore> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            publisher: self.publisher.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: LedgerStore> std::fmt::Debug for Ledger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("config", &self.config)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: LedgerStore> Ledger<S> {
    /// Engine over `store` that publishes nowhere
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Engine over a store shared with other components
    pub fn from_shared(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            publisher: Arc::new(NoopPublisher),
            metrics: None,
            config,
        }
    }

    /// Set the entry event publisher
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Record metrics into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a zero-balance account for (user, currency, type)
    #[tracing::instrument(skip_all, fields(user_id = %user_id, currency = %currency, account_type = %account_type))]
    pub async fn open_account(
        &self,
        user_id: Uuid,
        currency: Currency,
        account_type: AccountType,
    ) -> Result<Account> {
        self.run("open_account", async move {
            let account = Account::open(user_id, currency, account_type);
            self.store.insert_account(&account).await?;
            info!(account_id = %account.id, "Account opened");
            Ok(account)
        })
        .await
    }

    /// Add funds
    #[tracing::instrument(skip_all, fields(account_id = %account_id, amount = %amount, reference = %reference))]
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        reference: &str,
        description: &str,
    ) -> Result<Entry> {
        self.posting("credit", account_id, Mutation::Credit(amount), reference, description)
            .await
    }

    /// Remove funds.
    ///
    /// Checked against `balance`; a debit that would leave `available`
    /// negative because of outstanding holds is rejected too.
    #[tracing::instrument(skip_all, fields(account_id = %account_id, amount = %amount, reference = %reference))]
    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        reference: &str,
        description: &str,
    ) -> Result<Entry> {
        self.posting("debit", account_id, Mutation::Debit(amount), reference, description)
            .await
    }

    /// Move `amount` from one account to another
    #[tracing::instrument(skip_all, fields(from = %from_account_id, to = %to_account_id, amount = %amount, reference = %reference))]
    pub async fn transfer(
        &self,
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount: Decimal,
        reference: &str,
    ) -> Result<Transfer> {
        let (transfer, entries) = self
            .run("transfer", async {
                self.validate_amount(amount)?;
                if from_account_id == to_account_id {
                    return Err(Error::SameAccount(from_account_id));
                }
                self.transfer_tx(from_account_id, to_account_id, amount, reference)
                    .await
            })
            .await?;

        info!(transfer_id = %transfer.id, "Transfer completed");
        self.publish(&entries).await;
        Ok(transfer)
    }

    /// Earmark funds without moving them
    #[tracing::instrument(skip_all, fields(account_id = %account_id, amount = %amount, reference = %reference))]
    pub async fn hold(&self, account_id: Uuid, amount: Decimal, reference: &str) -> Result<Account> {
        let (account, _) = self
            .run("hold", async {
                self.validate_amount(amount)?;
                self.mutate(account_id, Mutation::Hold(amount), reference, "").await
            })
            .await?;
        info!(hold = %account.hold, available = %account.available, "Funds held");
        Ok(account)
    }

    /// Give back held funds
    #[tracing::instrument(skip_all, fields(account_id = %account_id, amount = %amount))]
    pub async fn release_hold(&self, account_id: Uuid, amount: Decimal) -> Result<Account> {
        let (account, _) = self
            .run("release_hold", async {
                self.validate_amount(amount)?;
                self.mutate(account_id, Mutation::Release(amount), "", "").await
            })
            .await?;
        info!(hold = %account.hold, available = %account.available, "Hold released");
        Ok(account)
    }

    /// Close an empty account
    #[tracing::instrument(skip_all, fields(account_id = %account_id))]
    pub async fn close_account(&self, account_id: Uuid) -> Result<Account> {
        let (account, _) = self
            .run("close_account", self.mutate(account_id, Mutation::Close, "", ""))
            .await?;
        info!("Account closed");
        Ok(account)
    }

    /// Committed account state
    pub async fn get_account(&self, account_id: Uuid) -> Result<Account> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or(Error::AccountNotFound(account_id))
    }

    /// Account by owner key, if one has been opened
    pub async fn find_account(
        &self,
        user_id: Uuid,
        currency: &Currency,
        account_type: AccountType,
    ) -> Result<Option<Account>> {
        self.store.find_account(user_id, currency, account_type).await
    }

    /// Most recent entries first.
    ///
    /// `None` uses `default_entries_limit`; larger limits are capped at
    /// `max_entries_limit`.
    pub async fn get_entries(&self, account_id: Uuid, limit: Option<usize>) -> Result<Vec<Entry>> {
        let limit = limit
            .unwrap_or(self.config.default_entries_limit)
            .min(self.config.max_entries_limit);

        if self.store.get_account(account_id).await?.is_none() {
            return Err(Error::AccountNotFound(account_id));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.recent_entries(account_id, limit).await
    }

    /// Committed transfer
    pub async fn get_transfer(&self, transfer_id: Uuid) -> Result<Transfer> {
        self.store
            .get_transfer(transfer_id)
            .await?
            .ok_or(Error::TransferNotFound(transfer_id))
    }

    /// Replay the entry log and compare it with the stored account
    #[tracing::instrument(skip_all, fields(account_id = %account_id))]
    pub async fn verify_account(&self, account_id: Uuid) -> Result<ReplayReport> {
        let account = self.get_account(account_id).await?;
        let entries = self.store.entry_log(account_id).await?;
        let report = ReplayReport::replay(&account, &entries);

        if !report.is_consistent() {
            error!(
                replayed = %report.replayed_balance,
                stored = %report.stored_balance,
                divergent_entry = ?report.first_divergent_entry,
                "Entry log does not reproduce account state"
            );
        }
        Ok(report)
    }

    /// Credit or debit: one entry, published after commit
    async fn posting(
        &self,
        operation: &'static str,
        account_id: Uuid,
        mutation: Mutation,
        reference: &str,
        description: &str,
    ) -> Result<Entry> {
        let (account, entry) = self
            .run(operation, async {
                if let Mutation::Credit(amount) | Mutation::Debit(amount) = mutation {
                    self.validate_amount(amount)?;
                }
                self.mutate(account_id, mutation, reference, description).await
            })
            .await?;
        let entry = entry.ok_or_else(|| {
            Error::InvariantViolation(format!("{} committed without an entry", operation))
        })?;

        info!(entry_id = %entry.id, balance = %account.balance, "Entry committed");
        self.publish(std::slice::from_ref(&entry)).await;
        Ok(entry)
    }

    /// One locked, version-checked transition on one account
    async fn mutate(
        &self,
        account_id: Uuid,
        mutation: Mutation,
        reference: &str,
        description: &str,
    ) -> Result<(Account, Option<Entry>)> {
        let mut uow = self.store.begin(IsolationLevel::ReadCommitted).await?;

        let mut account = match uow.lock_account(account_id).await? {
            Some(account) => account,
            None => return Err(abort(uow, Error::AccountNotFound(account_id)).await),
        };

        if let Err(e) = mutation.apply(&mut account) {
            return Err(abort(uow, e).await);
        }

        let expected = account.stamp();
        if !uow.update_account(&account, expected).await? {
            return Err(abort(uow, Error::ConcurrentModification(account_id)).await);
        }

        let entry = match mutation.entry() {
            Some((entry_type, amount)) => {
                let entry = Entry::record(&account, entry_type, amount, reference, description);
                uow.insert_entry(&entry)
                    .await
                    .map_err(|e| e.for_account(account_id))?;
                Some(entry)
            }
            None => None,
        };

        uow.commit()
            .await
            .map_err(|e| e.for_account(account_id))?;

        if let Some(metrics) = &self.metrics {
            metrics.record_entries_written(entry.iter().count());
        }
        Ok((account, entry))
    }

    async fn transfer_tx(
        &self,
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount: Decimal,
        reference: &str,
    ) -> Result<(Transfer, [Entry; 2])> {
        let isolation = if self.config.transfer_serializable {
            IsolationLevel::Serializable
        } else {
            IsolationLevel::ReadCommitted
        };
        let mut uow = self.store.begin(isolation).await?;

        // Ascending id order, whichever way the money moves.
        let (first_id, second_id) = if from_account_id < to_account_id {
            (from_account_id, to_account_id)
        } else {
            (to_account_id, from_account_id)
        };
        let first = match uow.lock_account(first_id).await? {
            Some(account) => account,
            None => return Err(abort(uow, Error::AccountNotFound(first_id)).await),
        };
        let second = match uow.lock_account(second_id).await? {
            Some(account) => account,
            None => return Err(abort(uow, Error::AccountNotFound(second_id)).await),
        };
        let (mut source, mut destination) = if first_id == from_account_id {
            (first, second)
        } else {
            (second, first)
        };

        if let Err(e) = apply_transfer(&mut source, &mut destination, amount) {
            return Err(abort(uow, e).await);
        }

        let source_expected = source.stamp();
        let destination_expected = destination.stamp();
        if !uow.update_account(&source, source_expected).await? {
            return Err(abort(uow, Error::ConcurrentModification(source.id)).await);
        }
        if !uow.update_account(&destination, destination_expected).await? {
            return Err(abort(uow, Error::ConcurrentModification(destination.id)).await);
        }

        let debit = Entry::record(&source, EntryType::Debit, amount, reference, "transfer out");
        let credit = Entry::record(&destination, EntryType::Credit, amount, reference, "transfer in");
        uow.insert_entry(&debit)
            .await
            .map_err(|e| e.for_account(source.id))?;
        uow.insert_entry(&credit)
            .await
            .map_err(|e| e.for_account(destination.id))?;

        let completed_at = source.updated_at;
        let transfer = Transfer {
            id: Uuid::now_v7(),
            from_account_id,
            to_account_id,
            amount,
            currency: source.currency.clone(),
            reference: reference.to_string(),
            status: TransferStatus::Completed,
            created_at: completed_at,
            completed_at: Some(completed_at),
        };
        uow.insert_transfer(&transfer)
            .await
            .map_err(|e| e.for_account(from_account_id))?;

        uow.commit()
            .await
            .map_err(|e| e.for_account(from_account_id))?;

        if let Some(metrics) = &self.metrics {
            metrics.record_entries_written(2);
        }
        Ok((transfer, [debit, credit]))
    }

    /// Run one unit of work under the operation timeout and record its outcome
    async fn run<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let budget = Duration::from_millis(self.config.operation_timeout_ms);

        let result = match tokio::time::timeout(budget, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} exceeded {}ms",
                operation, self.config.operation_timeout_ms
            ))),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_operation(operation, &result, started.elapsed());
        }

        if let Err(e) = &result {
            match e {
                Error::Storage(_) | Error::InvariantViolation(_) => {
                    error!(operation, error = %e, "Ledger operation failed")
                }
                _ => warn!(operation, kind = e.kind(), error = %e, "Ledger operation rejected"),
            }
        }
        result
    }

    /// Best effort: failures are logged and counted, never returned
    async fn publish(&self, entries: &[Entry]) {
        for entry in entries {
            let event = LedgerEntryEvent::from(entry);
            if let Err(e) = self.publisher.publish(&event).await {
                error!(
                    entry_id = %entry.id,
                    account_id = %entry.account_id,
                    error = %e,
                    "Failed to publish ledger entry event"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_publish_failure();
                }
            }
        }
    }

    fn validate_amount(&self, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!("{} is not positive", amount)));
        }
        if amount.normalize().scale() > self.config.amount_scale {
            return Err(Error::InvalidAmount(format!(
                "{} has more than {} decimal places",
                amount, self.config.amount_scale
            )));
        }
        Ok(())
    }
}

/// Both legs of a transfer on locked copies; nothing is written on error
fn apply_transfer(source: &mut Account, destination: &mut Account, amount: Decimal) -> Result<()> {
    if source.currency != destination.currency {
        return Err(Error::CurrencyMismatch {
            from: source.currency.to_string(),
            to: destination.currency.to_string(),
        });
    }
    destination.ensure_active()?;
    source.apply_transfer_out(amount)?;
    destination.apply_credit(amount)
}

/// Roll back and hand back the error that caused it
async fn abort<U: UnitOfWork>(uow: U, err: Error) -> Error {
    if let Err(rollback_err) = uow.rollback().await {
        warn!(error = %rollback_err, "Rollback failed; transaction dropped");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryPublisher;
    use crate::storage::{MemoryLedgerStore, MemoryUnitOfWork};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    fn usd() -> Currency {
        Currency::new("USD").unwrap()
    }

    async fn funded(ledger: &Ledger<MemoryLedgerStore>, amount: Decimal) -> Account {
        let account = ledger
            .open_account(Uuid::now_v7(), usd(), AccountType::Asset)
            .await
            .unwrap();
        if amount > Decimal::ZERO {
            ledger.credit(account.id, amount, "seed", "seed").await.unwrap();
        }
        ledger.get_account(account.id).await.unwrap()
    }

    fn ledger() -> Ledger<MemoryLedgerStore> {
        Ledger::new(MemoryLedgerStore::new(), EngineConfig::default())
    }

    #[tokio::test]
    async fn test_credit_records_entry_and_event() {
        let publisher = Arc::new(InMemoryPublisher::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let ledger = ledger()
            .with_publisher(publisher.clone())
            .with_metrics(metrics.clone());
        let account = funded(&ledger, Decimal::ZERO).await;

        let entry = ledger
            .credit(account.id, dec!(100.25), "dep-1", "deposit")
            .await
            .unwrap();
        assert_eq!(entry.entry_type, EntryType::Credit);
        assert_eq!(entry.resulting_balance, dec!(100.25));

        let stored = ledger.get_account(account.id).await.unwrap();
        assert_eq!(stored.balance, dec!(100.25));
        assert_eq!(stored.available, dec!(100.25));
        assert_eq!(stored.version, 2);

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entry_id, entry.id);
        assert_eq!(events[0].balance, dec!(100.25));

        assert_eq!(metrics.operation_count("credit", "ok"), 1);
        assert_eq!(metrics.entries_written.get(), 1);
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected_before_any_write() {
        let ledger = ledger();
        let account = funded(&ledger, dec!(10)).await;

        for amount in [dec!(0), dec!(-1), dec!(0.000000001)] {
            let err = ledger.credit(account.id, amount, "r", "d").await.unwrap_err();
            assert!(matches!(err, Error::InvalidAmount(_)), "{amount}: {err}");
        }
        // Trailing zeros do not count towards the scale.
        ledger
            .credit(account.id, dec!(1.5000000000), "r", "d")
            .await
            .unwrap();

        assert_eq!(ledger.get_account(account.id).await.unwrap().balance, dec!(11.5));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let ledger = ledger();
        let missing = Uuid::now_v7();

        assert!(matches!(
            ledger.credit(missing, dec!(1), "r", "d").await,
            Err(Error::AccountNotFound(id)) if id == missing
        ));
        assert!(matches!(
            ledger.get_entries(missing, None).await,
            Err(Error::AccountNotFound(_))
        ));
        assert!(matches!(
            ledger.get_transfer(missing).await,
            Err(Error::TransferNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transfer_moves_funds() {
        let publisher = Arc::new(InMemoryPublisher::new());
        let ledger = ledger().with_publisher(publisher.clone());
        let a = funded(&ledger, dec!(100)).await;
        let b = funded(&ledger, Decimal::ZERO).await;
        let published_before = publisher.len();

        let transfer = ledger.transfer(a.id, b.id, dec!(40), "t-1").await.unwrap();
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert!(transfer.completed_at.is_some());
        assert_eq!(ledger.get_transfer(transfer.id).await.unwrap(), transfer);

        let a_after = ledger.get_account(a.id).await.unwrap();
        let b_after = ledger.get_account(b.id).await.unwrap();
        assert_eq!(a_after.balance, dec!(60));
        assert_eq!(b_after.balance, dec!(40));

        let a_entries = ledger.get_entries(a.id, Some(1)).await.unwrap();
        let b_entries = ledger.get_entries(b.id, Some(1)).await.unwrap();
        assert_eq!(a_entries[0].entry_type, EntryType::Debit);
        assert_eq!(b_entries[0].entry_type, EntryType::Credit);
        assert_eq!(a_entries[0].reference, "t-1");

        assert_eq!(publisher.len(), published_before + 2);
    }

    #[tokio::test]
    async fn test_transfer_over_available_changes_nothing() {
        let ledger = ledger();
        let a = funded(&ledger, dec!(100)).await;
        let b = funded(&ledger, dec!(5)).await;
        ledger.hold(a.id, dec!(30), "h-1").await.unwrap();
        let a_before = ledger.get_account(a.id).await.unwrap();

        let err = ledger.transfer(a.id, b.id, dec!(80), "t-1").await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));

        assert_eq!(ledger.get_account(a.id).await.unwrap(), a_before);
        assert_eq!(ledger.get_account(b.id).await.unwrap(), b);
        assert_eq!(ledger.store().transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_transfer_guards() {
        let ledger = ledger();
        let a = funded(&ledger, dec!(10)).await;
        let eur = ledger
            .open_account(a.user_id, Currency::new("EUR").unwrap(), AccountType::Asset)
            .await
            .unwrap();

        assert!(matches!(
            ledger.transfer(a.id, a.id, dec!(1), "t").await,
            Err(Error::SameAccount(_))
        ));
        assert!(matches!(
            ledger.transfer(a.id, eur.id, dec!(1), "t").await,
            Err(Error::CurrencyMismatch { .. })
        ));
        assert!(matches!(
            ledger.transfer(a.id, Uuid::now_v7(), dec!(1), "t").await,
            Err(Error::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hold_writes_no_entry() {
        let ledger = ledger();
        let account = funded(&ledger, dec!(50)).await;

        let held = ledger.hold(account.id, dec!(20), "order-9").await.unwrap();
        assert_eq!(held.hold, dec!(20));
        assert_eq!(held.available, dec!(30));
        assert_eq!(ledger.get_entries(account.id, None).await.unwrap().len(), 1);

        let err = ledger.release_hold(account.id, dec!(21)).await.unwrap_err();
        assert!(matches!(err, Error::HoldExceedsHeld { .. }));
    }

    #[tokio::test]
    async fn test_close_account_lifecycle() {
        let ledger = ledger();
        let account = funded(&ledger, dec!(5)).await;

        assert!(matches!(
            ledger.close_account(account.id).await,
            Err(Error::AccountNotEmpty(_))
        ));
        ledger.debit(account.id, dec!(5), "w-1", "withdrawal").await.unwrap();

        let closed = ledger.close_account(account.id).await.unwrap();
        assert!(closed.is_closed());
        assert!(matches!(
            ledger.credit(account.id, dec!(1), "r", "d").await,
            Err(Error::AccountClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_open_account_twice_rejected() {
        let ledger = ledger();
        let user = Uuid::now_v7();
        let first = ledger.open_account(user, usd(), AccountType::Asset).await.unwrap();

        assert!(matches!(
            ledger.open_account(user, usd(), AccountType::Asset).await,
            Err(Error::AccountExists(_))
        ));
        let found = ledger.find_account(user, &usd(), AccountType::Asset).await.unwrap();
        assert_eq!(found.map(|a| a.id), Some(first.id));
        assert!(ledger
            .find_account(user, &usd(), AccountType::Liability)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_entries_limit_is_clamped() {
        let config = EngineConfig {
            default_entries_limit: 2,
            max_entries_limit: 3,
            ..EngineConfig::default()
        };
        let ledger = Ledger::new(MemoryLedgerStore::new(), config);
        let account = funded(&ledger, Decimal::ZERO).await;
        for i in 1..=5 {
            ledger
                .credit(account.id, Decimal::from(i), &format!("r-{i}"), "d")
                .await
                .unwrap();
        }

        let recent = ledger.get_entries(account.id, None).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].reference, "r-5");
        assert_eq!(recent[1].reference, "r-4");
        assert_eq!(ledger.get_entries(account.id, Some(100)).await.unwrap().len(), 3);
        assert!(ledger.get_entries(account.id, Some(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_account_replays_log() {
        let ledger = ledger();
        let a = funded(&ledger, dec!(100)).await;
        let b = funded(&ledger, Decimal::ZERO).await;
        ledger.debit(a.id, dec!(12.5), "w", "withdrawal").await.unwrap();
        ledger.transfer(a.id, b.id, dec!(7.5), "t").await.unwrap();

        let report = ledger.verify_account(a.id).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.entry_count, 3);
        assert_eq!(report.replayed_balance, dec!(80));
    }

    /// Failure injected into every unit of work a `FaultyStore` begins
    #[derive(Clone, Copy)]
    enum Fault {
        /// The version moves right after locking, as if another writer had
        /// skipped the locking read. `None` hits every locked account.
        BumpAfterLock(Option<Uuid>),
        /// Writing the transfer row fails outright
        TransferInsertFails,
        /// Writing the transfer row hits a serialization failure
        TransferInsertConflicts,
    }

    #[derive(Clone)]
    struct FaultyStore {
        inner: MemoryLedgerStore,
        fault: Fault,
    }

    impl FaultyStore {
        fn new(fault: Fault) -> Self {
            Self {
                inner: MemoryLedgerStore::new(),
                fault,
            }
        }
    }

    struct FaultyUnitOfWork {
        inner: MemoryUnitOfWork,
        store: MemoryLedgerStore,
        fault: Fault,
    }

    #[async_trait]
    impl LedgerStore for FaultyStore {
        type Tx = FaultyUnitOfWork;

        async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Tx> {
            Ok(FaultyUnitOfWork {
                inner: self.inner.begin(isolation).await?,
                store: self.inner.clone(),
                fault: self.fault,
            })
        }

        async fn insert_account(&self, account: &Account) -> Result<()> {
            self.inner.insert_account(account).await
        }

        async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
            self.inner.get_account(account_id).await
        }

        async fn find_account(
            &self,
            user_id: Uuid,
            currency: &Currency,
            account_type: AccountType,
        ) -> Result<Option<Account>> {
            self.inner.find_account(user_id, currency, account_type).await
        }

        async fn recent_entries(&self, account_id: Uuid, limit: usize) -> Result<Vec<Entry>> {
            self.inner.recent_entries(account_id, limit).await
        }

        async fn entry_log(&self, account_id: Uuid) -> Result<Vec<Entry>> {
            self.inner.entry_log(account_id).await
        }

        async fn get_transfer(&self, transfer_id: Uuid) -> Result<Option<Transfer>> {
            self.inner.get_transfer(transfer_id).await
        }
    }

    #[async_trait]
    impl UnitOfWork for FaultyUnitOfWork {
        async fn lock_account(&mut self, account_id: Uuid) -> Result<Option<Account>> {
            let locked = self.inner.lock_account(account_id).await?;
            if let Fault::BumpAfterLock(target) = self.fault {
                if target.map_or(true, |id| id == account_id) {
                    self.store.bump_version_unlocked(account_id);
                }
            }
            Ok(locked)
        }

        async fn update_account(&mut self, account: &Account, expected_version: i64) -> Result<bool> {
            self.inner.update_account(account, expected_version).await
        }

        async fn insert_entry(&mut self, entry: &Entry) -> Result<()> {
            self.inner.insert_entry(entry).await
        }

        async fn insert_transfer(&mut self, transfer: &Transfer) -> Result<()> {
            match self.fault {
                Fault::TransferInsertFails => Err(Error::Storage("disk full".to_string())),
                Fault::TransferInsertConflicts => Err(Error::ConcurrentModification(Uuid::nil())),
                Fault::BumpAfterLock(_) => self.inner.insert_transfer(transfer).await,
            }
        }

        async fn commit(self) -> Result<()> {
            self.inner.commit().await
        }

        async fn rollback(self) -> Result<()> {
            self.inner.rollback().await
        }
    }

    /// Open and fund two accounts directly on the backing store
    async fn funded_pair(store: &MemoryLedgerStore) -> (Account, Account) {
        let plain = Ledger::new(store.clone(), EngineConfig::default());
        (funded(&plain, dec!(100)).await, funded(&plain, dec!(20)).await)
    }

    async fn assert_transfer_left_no_trace(store: &FaultyStore, before: [&Account; 2]) {
        for account in before {
            let stored = store.inner.get_account(account.id).await.unwrap().unwrap();
            assert_eq!(stored.balance, account.balance);
            assert_eq!(stored.hold, account.hold);
            assert_eq!(stored.available, account.available);
            assert_eq!(store.inner.entry_log(account.id).await.unwrap().len(), 1);
        }
        assert_eq!(store.inner.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_version_check_catches_unlocked_writer() {
        let store = FaultyStore::new(Fault::BumpAfterLock(None));
        let ledger = Ledger::new(store.clone(), EngineConfig::default());
        let account = ledger
            .open_account(Uuid::now_v7(), usd(), AccountType::Asset)
            .await
            .unwrap();

        let err = ledger
            .credit(account.id, dec!(10), "r", "d")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification(id) if id == account.id));
        assert!(err.is_retryable());

        let stored = store.inner.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::ZERO);
        assert!(store.inner.entry_log(account.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_conflict_on_second_write_rolls_back_first() {
        let backing = MemoryLedgerStore::new();
        let (a, b) = funded_pair(&backing).await;
        // Only the destination moves, so the source update is already staged
        // when the destination's conditional write misses.
        let store = FaultyStore {
            inner: backing,
            fault: Fault::BumpAfterLock(Some(b.id)),
        };
        let ledger = Ledger::new(store.clone(), EngineConfig::default());

        let err = ledger.transfer(a.id, b.id, dec!(40), "t-1").await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification(id) if id == b.id));

        assert_transfer_left_no_trace(&store, [&a, &b]).await;
        let source = store.inner.get_account(a.id).await.unwrap().unwrap();
        assert_eq!(source.version, a.version);
    }

    #[tokio::test]
    async fn test_transfer_row_failure_rolls_back_both_legs() {
        let store = FaultyStore::new(Fault::TransferInsertFails);
        let (a, b) = funded_pair(&store.inner).await;
        let metrics = Arc::new(Metrics::new().unwrap());
        let ledger = Ledger::new(store.clone(), EngineConfig::default()).with_metrics(metrics.clone());

        let err = ledger.transfer(a.id, b.id, dec!(40), "t-1").await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        assert_transfer_left_no_trace(&store, [&a, &b]).await;
        for account in [&a, &b] {
            let stored = store.inner.get_account(account.id).await.unwrap().unwrap();
            assert_eq!(stored.version, account.version);
        }
        assert_eq!(metrics.entries_written.get(), 0);

        // The row locks were released with the rolled-back unit of work.
        let plain = Ledger::new(store.inner.clone(), EngineConfig::default());
        plain.transfer(a.id, b.id, dec!(40), "t-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_row_conflict_names_source_account() {
        let store = FaultyStore::new(Fault::TransferInsertConflicts);
        let (a, b) = funded_pair(&store.inner).await;
        let ledger = Ledger::new(store.clone(), EngineConfig::default());

        let err = ledger.transfer(a.id, b.id, dec!(1), "t-1").await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification(id) if id == a.id));
        assert!(err.is_retryable());
        assert_transfer_left_no_trace(&store, [&a, &b]).await;
    }

    #[tokio::test]
    async fn test_credit_overflow_is_rejected() {
        let ledger = ledger();
        let account = funded(&ledger, Decimal::MAX).await;

        let err = ledger
            .credit(account.id, Decimal::ONE, "r", "d")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AmountOutOfRange(_)));
        assert!(!err.is_retryable());

        assert_eq!(ledger.get_account(account.id).await.unwrap(), account);
        assert_eq!(ledger.get_entries(account.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_overflowing_destination_is_rejected() {
        let ledger = ledger();
        let a = funded(&ledger, dec!(5)).await;
        let b = funded(&ledger, Decimal::MAX).await;

        let err = ledger.transfer(a.id, b.id, dec!(5), "t-1").await.unwrap_err();
        assert!(matches!(err, Error::AmountOutOfRange(_)));

        assert_eq!(ledger.get_account(a.id).await.unwrap(), a);
        assert_eq!(ledger.get_account(b.id).await.unwrap(), b);
        assert_eq!(ledger.store().transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_operation_timeout_rolls_back() {
        let config = EngineConfig {
            operation_timeout_ms: 50,
            ..EngineConfig::default()
        };
        let store = MemoryLedgerStore::new();
        let ledger = Ledger::new(store.clone(), config);
        let account = funded(&ledger, dec!(10)).await;

        // Hold the row lock from outside so the credit waits past its budget.
        let mut blocker = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        blocker.lock_account(account.id).await.unwrap();

        let err = ledger.credit(account.id, dec!(1), "r", "d").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        blocker.rollback().await.unwrap();

        assert_eq!(ledger.get_account(account.id).await.unwrap().balance, dec!(10));
        ledger.credit(account.id, dec!(1), "r", "d").await.unwrap();
    }
}
