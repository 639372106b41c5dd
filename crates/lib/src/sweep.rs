//! Lock lease sweep.
//!
//! An attempt killed between lock and commit/unlock leaves its records locked.
//! The sweep releases locks older than the lease and re-triggers the affected
//! contacts so the records get delivered again.
//!
//! It also resumes contacts whose pending records have sat untouched for a whole
//! lease: records left unlocked after an attempt ran out of retries have no insert
//! event left to trigger them.

use crate::record::{ContactKey, RecordKey};
use crate::relay::now_ms;
use crate::sink::Sink;
use crate::store::StoreError;
use crate::trigger::TriggerAdapter;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one sweep pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Records whose expired lock was released.
    pub released: Vec<(ContactKey, RecordKey)>,
    /// Contacts re-triggered because of idle pending records only.
    pub resumed: Vec<ContactKey>,
}

/// Releases expired locks and resumes idle pending records for one direction.
pub struct LockSweeper<P, K> {
    trigger: Arc<TriggerAdapter<P, K>>,
    lease: Duration,
    interval: Duration,
}

impl<P, K> LockSweeper<P, K>
where
    P: Send + Sync + 'static,
    K: Sink<P> + 'static,
{
    pub fn new(trigger: Arc<TriggerAdapter<P, K>>, lease: Duration, interval: Duration) -> Self {
        Self {
            trigger,
            lease,
            interval,
        }
    }

    /// One pass: unlock expired records, find contacts with pending records idle for
    /// longer than the lease, and re-trigger each of those contacts once.
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        let now = now_ms();
        let store = self.trigger.engine().store();
        let name = self.trigger.engine().name();

        let released = store.release_expired_locks(now, lease_ms).await?;
        let mut contacts: BTreeSet<ContactKey> =
            released.iter().map(|(c, _)| c.clone()).collect();
        if !released.is_empty() {
            log::warn!(
                "{}: released {} expired lock(s) across {} contact(s)",
                name,
                released.len(),
                contacts.len()
            );
        }

        let idle = store
            .idle_pending_contacts(now.saturating_sub(lease_ms))
            .await?;
        let resumed: Vec<ContactKey> = idle
            .into_iter()
            .filter(|c| !contacts.contains(c))
            .collect();
        if !resumed.is_empty() {
            log::info!(
                "{}: resuming {} contact(s) with idle pending records",
                name,
                resumed.len()
            );
        }
        contacts.extend(resumed.iter().cloned());

        for contact in contacts {
            self.trigger.kick(contact);
        }
        Ok(SweepReport { released, resumed })
    }

    /// Sweep every `interval` until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.sweep_once().await {
                    log::warn!("{}: lock sweep failed: {}", self.trigger.engine().name(), e);
                }
            }
        })
    }
}
