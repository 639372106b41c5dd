//! Thread directory: which ticket is the open thread for a contact.

use super::StoreError;
use crate::record::ContactKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// An open ticket and the requester that authors the contact's comments on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenThread {
    pub thread_id: i64,
    pub requester_id: i64,
}

/// Outcome of a create-or-get registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    /// The contact already had an open thread; it is returned unchanged.
    Existing(OpenThread),
}

#[async_trait]
pub trait ThreadDirectory: Send + Sync {
    /// Every open thread recorded for the contact. More than one is an invariant violation
    /// the caller must surface.
    async fn find_open(&self, contact_key: &str) -> Result<Vec<OpenThread>, StoreError>;

    /// Record `thread` as the contact's open thread unless one already exists.
    async fn register(
        &self,
        contact_key: &str,
        thread: OpenThread,
    ) -> Result<RegisterOutcome, StoreError>;
}

/// Directory kept in memory, optionally mirrored to a JSON file.
pub struct MemoryThreadDirectory {
    path: Option<PathBuf>,
    threads: RwLock<BTreeMap<ContactKey, Vec<OpenThread>>>,
}

impl Default for MemoryThreadDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryThreadDirectory {
    pub fn new() -> Self {
        Self {
            path: None,
            threads: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load from path; a missing file starts empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let threads = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            threads: RwLock::new(threads),
        })
    }

    /// Seed a thread without the uniqueness check (imports, tests).
    pub async fn insert_unchecked(&self, contact_key: &str, thread: OpenThread) {
        self.threads
            .write()
            .await
            .entry(contact_key.to_string())
            .or_default()
            .push(thread);
    }

    /// Write to `<file>.tmp`, then rename over the snapshot, so a crash mid-write never
    /// leaves a truncated directory behind.
    async fn save(&self, threads: &BTreeMap<ContactKey, Vec<OpenThread>>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(threads)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ThreadDirectory for MemoryThreadDirectory {
    async fn find_open(&self, contact_key: &str) -> Result<Vec<OpenThread>, StoreError> {
        Ok(self
            .threads
            .read()
            .await
            .get(contact_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn register(
        &self,
        contact_key: &str,
        thread: OpenThread,
    ) -> Result<RegisterOutcome, StoreError> {
        let mut threads = self.threads.write().await;
        if let Some(existing) = threads.get(contact_key).and_then(|t| t.first()) {
            return Ok(RegisterOutcome::Existing(*existing));
        }
        threads.insert(contact_key.to_string(), vec![thread]);
        if let Err(e) = self.save(&threads).await {
            threads.remove(contact_key);
            return Err(e);
        }
        Ok(RegisterOutcome::Registered)
    }
}
