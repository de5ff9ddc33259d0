//! Wallet Ledger Core
//!
//! Double-entry wallet ledger: accounts with balance, available and hold,
//! an append-only entry log, atomic transfers and holds.
//!
//! # Architecture
//!
//! - **Row locks + versions**: every mutation locks its rows and writes
//!   conditionally on the row version
//! - **One unit of work per call**: validation, writes and appends commit
//!   together or not at all
//! - **Pluggable storage**: Postgres in production, in-memory for tests
//! - **Events after commit**: one event per entry, best effort
//!
//! # Invariants
//!
//! - `available == balance - hold`, and none of them negative
//! - Replaying an account's entries reproduces its balance
//! - A transfer writes exactly one debit and one credit of the same amount
//! - Every failed call leaves storage as it found it

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-exports
pub use config::{Config, DatabaseConfig, EngineConfig, EventsConfig};
pub use error::{Error, Result};
pub use events::{EventPublisher, InMemoryPublisher, LedgerEntryEvent, NatsPublisher, NoopPublisher};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use storage::{IsolationLevel, LedgerStore, MemoryLedgerStore, PgLedgerStore, UnitOfWork};
pub use types::{
    Account, AccountStatus, AccountType, Currency, Entry, EntryType, ReplayReport, Transfer,
    TransferStatus,
};
