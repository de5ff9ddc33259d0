//! Entry events
//!
//! One [`LedgerEntryEvent`] per committed entry, handed to an
//! [`EventPublisher`] after the unit of work commits. Delivery is best effort:
//! the engine logs and counts failures and never rolls back because of them.

use crate::types::{Entry, EntryType};
use crate::{Error, Result};
use async_nats::Client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Published for every committed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntryEvent {
    /// Entry ID
    pub entry_id: Uuid,

    /// Account mutated
    pub account_id: Uuid,

    /// Debit or credit
    #[serde(rename = "type")]
    pub entry_type: EntryType,

    /// Positive amount
    pub amount: Decimal,

    /// Account balance right after the entry
    pub balance: Decimal,

    /// Caller-supplied correlation id
    pub reference: String,

    /// Free-form description
    pub description: String,

    /// Entry timestamp
    pub created_at: DateTime<Utc>,
}

impl From<&Entry> for LedgerEntryEvent {
    fn from(entry: &Entry) -> Self {
        Self {
            entry_id: entry.id,
            account_id: entry.account_id,
            entry_type: entry.entry_type,
            amount: entry.amount,
            balance: entry.resulting_balance,
            reference: entry.reference.clone(),
            description: entry.description.clone(),
            created_at: entry.created_at,
        }
    }
}

/// Sink for entry events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event
    async fn publish(&self, event: &LedgerEntryEvent) -> Result<()>;
}

/// Publishes JSON events to NATS on `<prefix>.ledger.entries`
#[derive(Debug, Clone)]
pub struct NatsPublisher {
    client: Client,
    subject: String,
}

impl NatsPublisher {
    /// Connect to a NATS server
    pub async fn connect(url: &str, subject_prefix: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Publish(format!("Failed to connect to NATS at {}: {}", url, e)))?;

        tracing::info!("Connected to NATS at {}", url);

        Ok(Self::new(client, subject_prefix))
    }

    /// Wrap an existing client
    pub fn new(client: Client, subject_prefix: &str) -> Self {
        Self {
            client,
            subject: entries_subject(subject_prefix),
        }
    }

    /// Subject events go to
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl EventPublisher for NatsPublisher {
    async fn publish(&self, event: &LedgerEntryEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await?;

        debug!(
            entry_id = %event.entry_id,
            account_id = %event.account_id,
            subject = %self.subject,
            "Published ledger entry event"
        );
        Ok(())
    }
}

/// Subject for entry events under `prefix`
pub fn entries_subject(prefix: &str) -> String {
    format!("{}.ledger.entries", prefix)
}

/// Keeps events in memory, in publication order
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    events: Mutex<Vec<LedgerEntryEvent>>,
}

impl InMemoryPublisher {
    /// Empty publisher
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of published events
    pub fn events(&self) -> Vec<LedgerEntryEvent> {
        self.events.lock().clone()
    }

    /// Number of published events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Nothing published yet
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, event: &LedgerEntryEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _event: &LedgerEntryEvent) -> Result<()> {
        Ok(())
    }
}
