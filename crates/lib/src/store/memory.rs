//! In-process relay table with optional JSON snapshot persistence and a change feed.

use super::{ChangeEvent, EventType, LockOutcome, ReleaseOutcome, RelayStore, StoreError};
use crate::record::{ContactKey, RecordKey, RelayRecord};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, RwLock};

const CHANGE_FEED_CAPACITY: usize = 1024;

type Table<P> = BTreeMap<ContactKey, Vec<RelayRecord<P>>>;

/// Relay table keyed by contact, records kept in arrival order.
///
/// Every conditional update runs under the table's write lock, which makes the
/// check and the write a single atomic step for all callers sharing the store.
/// When a snapshot path is set, the whole table is rewritten after each mutation
/// and a failed write rolls the in-memory change back.
pub struct MemoryRelayStore<P> {
    path: Option<PathBuf>,
    table: RwLock<Table<P>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl<P> Default for MemoryRelayStore<P>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P> MemoryRelayStore<P>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Memory-only store (nothing survives the process).
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            path: None,
            table: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Open a durable store backed by a JSON snapshot. Missing file => empty table.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut table: Table<P> = BTreeMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => {
                let records: Vec<RelayRecord<P>> = serde_json::from_str(&s)?;
                for r in records {
                    table.entry(r.contact_key.clone()).or_default().push(r);
                }
                log::debug!("relay store loaded from {}", path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("relay store snapshot not found, starting empty: {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            path: Some(path),
            table: RwLock::new(table),
            changes,
        })
    }

    /// Subscribe to the change feed. Only events published after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Point read of one record.
    pub async fn get(&self, contact_key: &str, record_key: &str) -> Option<RelayRecord<P>> {
        let table = self.table.read().await;
        table
            .get(contact_key)?
            .iter()
            .find(|r| r.record_key == record_key)
            .cloned()
    }

    /// All records of a contact in arrival order.
    pub async fn records(&self, contact_key: &str) -> Vec<RelayRecord<P>> {
        let table = self.table.read().await;
        table.get(contact_key).cloned().unwrap_or_default()
    }

    fn publish(&self, contact_key: &str, record_key: &str, event_type: EventType) {
        // No subscribers is fine; the feed is best-effort.
        let _ = self.changes.send(ChangeEvent {
            contact_key: contact_key.to_string(),
            record_key: record_key.to_string(),
            event_type,
        });
    }

    async fn persist(&self, table: &Table<P>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let records: Vec<&RelayRecord<P>> = table.values().flatten().collect();
        let json = serde_json::to_string_pretty(&records)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Apply `f` to one record under the write lock. `f` returns its result and
    /// whether it changed the record; changes are persisted (or rolled back) and
    /// published as `Modify`.
    async fn update<T, F>(&self, contact_key: &str, record_key: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut RelayRecord<P>) -> (T, bool),
    {
        let mut table = self.table.write().await;
        let record = find_mut(&mut table, contact_key, record_key)?;
        let before = record.clone();
        let (out, changed) = f(record);
        if !changed {
            return Ok(out);
        }
        if let Err(e) = self.persist(&table).await {
            if let Ok(r) = find_mut(&mut table, contact_key, record_key) {
                *r = before;
            }
            return Err(e);
        }
        drop(table);
        self.publish(contact_key, record_key, EventType::Modify);
        Ok(out)
    }

    /// Clear the lock of a record still held under `lock_stamp`, marking it handled
    /// when `handled` is set. Anything else is a lost lease and leaves the record as is.
    async fn release(
        &self,
        contact_key: &str,
        record_key: &str,
        lock_stamp: i64,
        handled: bool,
    ) -> Result<ReleaseOutcome, StoreError> {
        self.update(contact_key, record_key, |r| {
            if !r.lock || r.locked_at != Some(lock_stamp) {
                return (ReleaseOutcome::LeaseLost, false);
            }
            r.handled |= handled;
            r.lock = false;
            r.locked_at = None;
            r.touched_at = Some(wall_clock_ms());
            (ReleaseOutcome::Released, true)
        })
        .await
    }
}

fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn find_mut<'a, P>(
    table: &'a mut Table<P>,
    contact_key: &str,
    record_key: &str,
) -> Result<&'a mut RelayRecord<P>, StoreError> {
    table
        .get_mut(contact_key)
        .and_then(|records| records.iter_mut().find(|r| r.record_key == record_key))
        .ok_or_else(|| StoreError::NotFound {
            contact_key: contact_key.to_string(),
            record_key: record_key.to_string(),
        })
}

#[async_trait]
impl<P> RelayStore<P> for MemoryRelayStore<P>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    async fn insert(&self, mut record: RelayRecord<P>) -> Result<bool, StoreError> {
        record.handled = false;
        record.lock = false;
        record.locked_at = None;
        record.touched_at = Some(wall_clock_ms());
        let contact_key = record.contact_key.clone();
        let record_key = record.record_key.clone();

        let mut table = self.table.write().await;
        let records = table.entry(contact_key.clone()).or_default();
        if records.iter().any(|r| r.record_key == record_key) {
            return Ok(false);
        }
        records.push(record);
        if let Err(e) = self.persist(&table).await {
            if let Some(records) = table.get_mut(&contact_key) {
                records.retain(|r| r.record_key != record_key);
                if records.is_empty() {
                    table.remove(&contact_key);
                }
            }
            return Err(e);
        }
        drop(table);
        self.publish(&contact_key, &record_key, EventType::Insert);
        Ok(true)
    }

    async fn query_unhandled_unlocked(
        &self,
        contact_key: &str,
    ) -> Result<Vec<RelayRecord<P>>, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .get(contact_key)
            .map(|records| records.iter().filter(|r| r.is_pending()).cloned().collect())
            .unwrap_or_default())
    }

    async fn try_lock(
        &self,
        contact_key: &str,
        record_key: &str,
        now_ms: i64,
    ) -> Result<LockOutcome, StoreError> {
        self.update(contact_key, record_key, |r| {
            if r.handled || r.lock {
                (LockOutcome::Conflict, false)
            } else {
                r.lock = true;
                r.locked_at = Some(now_ms);
                r.touched_at = Some(now_ms);
                (LockOutcome::Acquired, true)
            }
        })
        .await
    }

    async fn commit(
        &self,
        contact_key: &str,
        record_key: &str,
        lock_stamp: i64,
    ) -> Result<ReleaseOutcome, StoreError> {
        self.release(contact_key, record_key, lock_stamp, true).await
    }

    async fn unlock(
        &self,
        contact_key: &str,
        record_key: &str,
        lock_stamp: i64,
    ) -> Result<ReleaseOutcome, StoreError> {
        self.release(contact_key, record_key, lock_stamp, false).await
    }

    async fn release_expired_locks(
        &self,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Vec<(ContactKey, RecordKey)>, StoreError> {
        let mut table = self.table.write().await;
        let before = table.clone();
        let mut released = Vec::new();
        for records in table.values_mut() {
            for r in records.iter_mut().filter(|r| r.lock && !r.handled) {
                // A lock without a timestamp predates leases; treat it as expired.
                let expired = r.locked_at.map_or(true, |at| at + lease_ms <= now_ms);
                if expired {
                    r.lock = false;
                    r.locked_at = None;
                    r.touched_at = Some(now_ms);
                    released.push((r.contact_key.clone(), r.record_key.clone()));
                }
            }
        }
        if released.is_empty() {
            return Ok(released);
        }
        if let Err(e) = self.persist(&table).await {
            *table = before;
            return Err(e);
        }
        drop(table);
        for (contact_key, record_key) in &released {
            self.publish(contact_key, record_key, EventType::Modify);
        }
        Ok(released)
    }

    async fn idle_pending_contacts(
        &self,
        idle_before_ms: i64,
    ) -> Result<Vec<ContactKey>, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .iter()
            .filter(|(_, records)| {
                records.iter().any(|r| {
                    r.is_pending() && r.touched_at.map_or(true, |at| at <= idle_before_ms)
                })
            })
            .map(|(contact, _)| contact.clone())
            .collect())
    }
}
