//! Error types for the ledger

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Account does not exist
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    /// Transfer does not exist
    #[error("Transfer not found: {0}")]
    TransferNotFound(Uuid),

    /// Debit or transfer would take the account below zero
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Amount requested
        required: Decimal,
        /// Amount the account could cover
        available: Decimal,
    },

    /// Hold larger than the available balance
    #[error("Insufficient available balance: required {required}, available {available}")]
    InsufficientAvailableBalance {
        /// Amount requested
        required: Decimal,
        /// Current available balance
        available: Decimal,
    },

    /// Release larger than the amount currently held
    #[error("Hold release of {requested} exceeds held amount {held}")]
    HoldExceedsHeld {
        /// Amount requested for release
        requested: Decimal,
        /// Current hold
        held: Decimal,
    },

    /// Conditional write matched no row (version moved underneath us)
    #[error("Concurrent modification of account {0}")]
    ConcurrentModification(Uuid),

    /// Account state would break `available == balance - hold` or go negative
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Amount is zero, negative or too precise
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Result does not fit the decimal type or the stored column
    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),

    /// Malformed currency code
    #[error("Invalid currency: {0}")]
    InvalidCurrency(String),

    /// Account has been closed
    #[error("Account closed: {0}")]
    AccountClosed(Uuid),

    /// Account still carries funds and cannot be closed
    #[error("Account not empty: {0}")]
    AccountNotEmpty(Uuid),

    /// Account already exists for (user, currency, type)
    #[error("Account already exists: {0}")]
    AccountExists(String),

    /// Transfer source and destination are the same account
    #[error("Transfer source and destination are the same account: {0}")]
    SameAccount(Uuid),

    /// Transfer between accounts of different currencies
    #[error("Currency mismatch: {from} -> {to}")]
    CurrencyMismatch {
        /// Source currency
        from: String,
        /// Destination currency
        to: String,
    },

    /// Unit of work exceeded its time budget (or lock wait timed out)
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Storage error (transaction or connectivity failure)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Event publication failure
    #[error("Publish error: {0}")]
    Publish(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the operation as-is.
    ///
    /// The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConcurrentModification(_) | Error::Timeout(_) | Error::Storage(_)
        )
    }

    /// Attach an account id to a conflict raised without one
    pub fn for_account(self, account_id: Uuid) -> Self {
        match self {
            Error::ConcurrentModification(id) if id.is_nil() => {
                Error::ConcurrentModification(account_id)
            }
            other => other,
        }
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AccountNotFound(_) => "account_not_found",
            Error::TransferNotFound(_) => "transfer_not_found",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::InsufficientAvailableBalance { .. } => "insufficient_available_balance",
            Error::HoldExceedsHeld { .. } => "hold_exceeds_held",
            Error::ConcurrentModification(_) => "concurrent_modification",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::InvalidAmount(_) => "invalid_amount",
            Error::AmountOutOfRange(_) => "amount_out_of_range",
            Error::InvalidCurrency(_) => "invalid_currency",
            Error::AccountClosed(_) => "account_closed",
            Error::AccountNotEmpty(_) => "account_not_empty",
            Error::AccountExists(_) => "account_exists",
            Error::SameAccount(_) => "same_account",
            Error::CurrencyMismatch { .. } => "currency_mismatch",
            Error::Timeout(_) => "timeout",
            Error::Storage(_) => "storage_failure",
            Error::Publish(_) => "publish_failure",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

// Postgres SQLSTATE codes we translate instead of surfacing as storage failures.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

impl Error {
    /// Translate a database error code, if it has a dedicated variant
    pub(crate) fn from_sqlstate(code: &str, message: &str) -> Option<Self> {
        match code {
            // The row id is not known here; callers that hold it re-map.
            SERIALIZATION_FAILURE | DEADLOCK_DETECTED => {
                Some(Error::ConcurrentModification(Uuid::nil()))
            }
            LOCK_NOT_AVAILABLE => Some(Error::Timeout(message.to_string())),
            NUMERIC_VALUE_OUT_OF_RANGE => Some(Error::AmountOutOfRange(message.to_string())),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if let Some(code) = db_err.code() {
                if let Some(mapped) = Error::from_sqlstate(&code, db_err.message()) {
                    return mapped;
                }
            }
        }
        if let sqlx::Error::PoolTimedOut = err {
            return Error::Timeout("connection pool acquire timed out".to_string());
        }
        Error::Storage(err.to_string())
    }
}

impl From<async_nats::PublishError> for Error {
    fn from(err: async_nats::PublishError) -> Self {
        Error::Publish(err.to_string())
    }
}
