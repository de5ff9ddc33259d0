//! Core types for the ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money, never floats)
//! - Time-ordered identifiers (UUIDv7)
//! - Pure state transitions: the `apply_*` methods never touch storage

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Currency or asset code (`USD`, `BTC`, `USDT`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Parse and normalise a currency code (upper-case ASCII alphanumerics, 2-10 chars)
    pub fn new(code: &str) -> Result<Self> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() < 2 || code.len() > 10 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidCurrency(code));
        }
        Ok(Self(code))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accounting type of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// Asset
    Asset,
    /// Liability
    Liability,
    /// Equity
    Equity,
    /// Revenue
    Revenue,
    /// Expense
    Expense,
}

impl AccountType {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "asset",
            AccountType::Liability => "liability",
            AccountType::Equity => "equity",
            AccountType::Revenue => "revenue",
            AccountType::Expense => "expense",
        }
    }
}

impl FromStr for AccountType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asset" => Ok(AccountType::Asset),
            "liability" => Ok(AccountType::Liability),
            "equity" => Ok(AccountType::Equity),
            "revenue" => Ok(AccountType::Revenue),
            "expense" => Ok(AccountType::Expense),
            other => Err(Error::Storage(format!("unknown account type '{}'", other))),
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Open for mutations
    Active,
    /// Closed; kept for history, rejects mutations
    Closed,
}

impl AccountStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Closed => "closed",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "closed" => Ok(AccountStatus::Closed),
            other => Err(Error::Storage(format!("unknown account status '{}'", other))),
        }
    }
}

/// Balance-holding account, one per (user, currency, type)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Accounting type
    pub account_type: AccountType,

    /// Currency of every amount on this account
    pub currency: Currency,

    /// Total funds held
    pub balance: Decimal,

    /// `balance - hold`; eligible for new holds and transfers
    pub available: Decimal,

    /// Funds earmarked by outstanding holds
    pub hold: Decimal,

    /// Lifecycle status
    pub status: AccountStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,

    /// Optimistic concurrency counter, starts at 1
    pub version: i64,
}

impl Account {
    /// New account with zero balances at version 1
    pub fn open(user_id: Uuid, currency: Currency, account_type: AccountType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            user_id,
            account_type,
            currency,
            balance: Decimal::ZERO,
            available: Decimal::ZERO,
            hold: Decimal::ZERO,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Whether the account has been closed
    pub fn is_closed(&self) -> bool {
        self.status == AccountStatus::Closed
    }

    /// Reject mutations on closed accounts
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::AccountClosed(self.id));
        }
        Ok(())
    }

    /// Add funds; a balance past `Decimal::MAX` is rejected, not wrapped
    pub fn apply_credit(&mut self, amount: Decimal) -> Result<()> {
        self.ensure_active()?;
        self.balance = self.balance.checked_add(amount).ok_or_else(|| {
            Error::AmountOutOfRange(format!(
                "account {}: balance {} + {} overflows",
                self.id, self.balance, amount
            ))
        })?;
        self.recompute_available();
        self.check_invariants()
    }

    /// Remove funds.
    ///
    /// The precondition is on `balance`, not `available`. A debit that passes
    /// it but would still leave `available` negative (funds under hold) is
    /// rejected as well, so the invariant holds either way.
    pub fn apply_debit(&mut self, amount: Decimal) -> Result<()> {
        self.ensure_active()?;
        if self.balance - amount < Decimal::ZERO {
            return Err(Error::InsufficientBalance {
                required: amount,
                available: self.balance,
            });
        }
        if self.balance - amount - self.hold < Decimal::ZERO {
            return Err(Error::InsufficientBalance {
                required: amount,
                available: self.available,
            });
        }
        self.balance -= amount;
        self.recompute_available();
        self.check_invariants()
    }

    /// Debit leg of a transfer: checked against `available`
    pub fn apply_transfer_out(&mut self, amount: Decimal) -> Result<()> {
        self.ensure_active()?;
        if self.available < amount {
            return Err(Error::InsufficientBalance {
                required: amount,
                available: self.available,
            });
        }
        self.balance -= amount;
        self.recompute_available();
        self.check_invariants()
    }

    /// Earmark funds without moving them
    pub fn apply_hold(&mut self, amount: Decimal) -> Result<()> {
        self.ensure_active()?;
        if self.available < amount {
            return Err(Error::InsufficientAvailableBalance {
                required: amount,
                available: self.available,
            });
        }
        self.hold += amount;
        self.recompute_available();
        self.check_invariants()
    }

    /// Give back previously held funds
    pub fn apply_release(&mut self, amount: Decimal) -> Result<()> {
        self.ensure_active()?;
        if amount > self.hold {
            return Err(Error::HoldExceedsHeld {
                requested: amount,
                held: self.hold,
            });
        }
        self.hold -= amount;
        self.recompute_available();
        self.check_invariants()
    }

    /// Mark closed; only empty accounts may close
    pub fn apply_close(&mut self) -> Result<()> {
        self.ensure_active()?;
        if !self.balance.is_zero() || !self.hold.is_zero() {
            return Err(Error::AccountNotEmpty(self.id));
        }
        self.status = AccountStatus::Closed;
        Ok(())
    }

    /// Advance version and timestamp ahead of a conditional write.
    ///
    /// Returns the version the stored row must still carry.
    pub fn stamp(&mut self) -> i64 {
        let expected = self.version;
        self.version += 1;
        self.updated_at = Utc::now();
        expected
    }

    /// Check balance invariants
    pub fn check_invariants(&self) -> Result<()> {
        if self.available != self.balance - self.hold {
            return Err(Error::InvariantViolation(format!(
                "account {}: available {} != balance {} - hold {}",
                self.id, self.available, self.balance, self.hold
            )));
        }
        if self.balance < Decimal::ZERO || self.hold < Decimal::ZERO || self.available < Decimal::ZERO {
            return Err(Error::InvariantViolation(format!(
                "account {}: negative amount (balance {}, hold {}, available {})",
                self.id, self.balance, self.hold, self.available
            )));
        }
        Ok(())
    }

    fn recompute_available(&mut self) {
        self.available = self.balance - self.hold;
    }
}

/// Direction of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Balance decrease
    Debit,
    /// Balance increase
    Credit,
}

impl EntryType {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "debit",
            EntryType::Credit => "credit",
        }
    }
}

impl FromStr for EntryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debit" => Ok(EntryType::Debit),
            "credit" => Ok(EntryType::Credit),
            other => Err(Error::Storage(format!("unknown entry type '{}'", other))),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one balance mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Account mutated
    pub account_id: Uuid,

    /// Debit or credit
    pub entry_type: EntryType,

    /// Positive amount
    pub amount: Decimal,

    /// Account balance right after this entry
    pub resulting_balance: Decimal,

    /// Caller-supplied correlation id
    pub reference: String,

    /// Free-form description
    pub description: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// Build an entry for an account that has already been mutated
    pub fn record(
        account: &Account,
        entry_type: EntryType,
        amount: Decimal,
        reference: &str,
        description: &str,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id: account.id,
            entry_type,
            amount,
            resulting_balance: account.balance,
            reference: reference.to_string(),
            description: description.to_string(),
            created_at: account.updated_at,
        }
    }

    /// Amount with sign applied (credit positive, debit negative)
    pub fn signed_amount(&self) -> Decimal {
        match self.entry_type {
            EntryType::Credit => self.amount,
            EntryType::Debit => -self.amount,
        }
    }
}

/// Transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Recorded, not yet applied
    Pending,
    /// Both legs applied
    Completed,
    /// Rejected or rolled back
    Failed,
}

impl TransferStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }
}

impl FromStr for TransferStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(Error::Storage(format!("unknown transfer status '{}'", other))),
        }
    }
}

/// Paired debit + credit between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Transfer ID
    pub id: Uuid,

    /// Debited account
    pub from_account_id: Uuid,

    /// Credited account
    pub to_account_id: Uuid,

    /// Amount moved
    pub amount: Decimal,

    /// Shared currency of both accounts
    pub currency: Currency,

    /// Caller-supplied correlation id
    pub reference: String,

    /// Status
    pub status: TransferStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of replaying an account's entry log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Account replayed
    pub account_id: Uuid,

    /// Number of entries replayed
    pub entry_count: usize,

    /// Sum of signed entry amounts
    pub replayed_balance: Decimal,

    /// Balance stored on the account row
    pub stored_balance: Decimal,

    /// First entry whose `resulting_balance` disagrees with the running sum
    pub first_divergent_entry: Option<Uuid>,

    /// Whether the stored row satisfies the balance invariants
    pub invariants_hold: bool,
}

impl ReplayReport {
    /// Replay entries (oldest first) against the stored account
    pub fn replay(account: &Account, entries: &[Entry]) -> Self {
        let mut running = Decimal::ZERO;
        let mut first_divergent_entry = None;

        for entry in entries {
            running = match running.checked_add(entry.signed_amount()) {
                Some(next) => next,
                None => {
                    first_divergent_entry.get_or_insert(entry.id);
                    break;
                }
            };
            if first_divergent_entry.is_none() && entry.resulting_balance != running {
                first_divergent_entry = Some(entry.id);
            }
        }

        Self {
            account_id: account.id,
            entry_count: entries.len(),
            replayed_balance: running,
            stored_balance: account.balance,
            first_divergent_entry,
            invariants_hold: account.check_invariants().is_ok(),
        }
    }

    /// Entry log, snapshots and row all agree
    pub fn is_consistent(&self) -> bool {
        self.replayed_balance == self.stored_balance
            && self.first_divergent_entry.is_none()
            && self.invariants_hold
    }
}
