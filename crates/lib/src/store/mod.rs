//! Relay store: durable per-contact tables of relay records plus the ticket thread directory.
//!
//! All flag transitions go through conditional updates on the store so that
//! concurrent attempts never both believe they own a record.

mod memory;
mod threads;

pub use memory::MemoryRelayStore;
pub use threads::{MemoryThreadDirectory, OpenThread, RegisterOutcome, ThreadDirectory};

use crate::record::{ContactKey, RecordKey, RelayRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Store failure. Fatal to the current relay attempt.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {record_key} not found for contact {contact_key}")]
    NotFound {
        contact_key: ContactKey,
        record_key: RecordKey,
    },
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store snapshot invalid: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of an atomic `lock: false -> true` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Already locked by another attempt, or already handled.
    Conflict,
}

/// Result of a commit or unlock guarded by the lock stamp of the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The record is no longer locked with this stamp (the lease expired and the sweep
    /// released it, possibly to a newer attempt). Nothing was written.
    LeaseLost,
}

/// Kind of change published on the store's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Modify,
    Remove,
}

/// One entry of the change feed (`{contactKey, recordKey, eventType}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub contact_key: ContactKey,
    pub record_key: RecordKey,
    pub event_type: EventType,
}

impl ChangeEvent {
    pub fn insert(contact_key: impl Into<ContactKey>, record_key: impl Into<RecordKey>) -> Self {
        Self {
            contact_key: contact_key.into(),
            record_key: record_key.into(),
            event_type: EventType::Insert,
        }
    }
}

/// Keyed table of relay records with consistent reads and conditional updates.
#[async_trait]
pub trait RelayStore<P>: Send + Sync {
    /// Insert a new record in the initial state unless `(contact, record)` already exists.
    /// Returns true when inserted.
    async fn insert(&self, record: RelayRecord<P>) -> Result<bool, StoreError>;

    /// Consistent read of every record for the contact with `handled = false AND lock = false`.
    async fn query_unhandled_unlocked(
        &self,
        contact_key: &str,
    ) -> Result<Vec<RelayRecord<P>>, StoreError>;

    /// Atomic compare-and-set of `lock` from false to true, stamping `locked_at = now_ms`.
    async fn try_lock(
        &self,
        contact_key: &str,
        record_key: &str,
        now_ms: i64,
    ) -> Result<LockOutcome, StoreError>;

    /// Sets `handled = true, lock = false`, only while the record is still locked with
    /// `lock_stamp` (the `now_ms` its `try_lock` was given).
    async fn commit(
        &self,
        contact_key: &str,
        record_key: &str,
        lock_stamp: i64,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Sets `lock = false`, only while the record is still locked with `lock_stamp`;
    /// `handled` is left unchanged.
    async fn unlock(
        &self,
        contact_key: &str,
        record_key: &str,
        lock_stamp: i64,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Unlocks every unhandled record whose lock is at least `lease_ms` old.
    async fn release_expired_locks(
        &self,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Vec<(ContactKey, RecordKey)>, StoreError>;

    /// Contacts with a pending record (`handled = false AND lock = false`) last touched
    /// at or before `idle_before_ms`.
    async fn idle_pending_contacts(
        &self,
        idle_before_ms: i64,
    ) -> Result<Vec<ContactKey>, StoreError>;
}
