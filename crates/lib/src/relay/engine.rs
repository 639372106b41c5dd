//! Relay engine: fetch, lock, order, deliver, then commit or recover.

use super::commit::{commit_batch, unlock_all};
use super::deliver::deliver_batch;
use super::fetch::{fetch_batch, Fetched};
use super::lock::{lock_batch, LockReport};
use super::order::order_batch;
use super::{now_ms, RelayError};
use crate::record::RelayRecord;
use crate::sink::Sink;
use crate::store::RelayStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Successful end of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Nothing unhandled and unlocked for the contact.
    Empty,
    /// Every fetched record was owned by another attempt.
    Contended { conflicts: usize },
    /// The locked batch was delivered and committed.
    Delivered { delivered: usize, conflicts: usize },
}

/// One direction of the relay: records of type `P` from `store` into sink `K`.
pub struct RelayEngine<P, K> {
    name: &'static str,
    store: Arc<dyn RelayStore<P>>,
    sink: K,
}

impl<P, K> RelayEngine<P, K>
where
    P: Send + Sync + 'static,
    K: Sink<P>,
{
    pub fn new(name: &'static str, store: Arc<dyn RelayStore<P>>, sink: K) -> Self {
        Self { name, store, sink }
    }

    /// Direction name used in logs (e.g. "whatsapp->zendesk").
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn store(&self) -> &Arc<dyn RelayStore<P>> {
        &self.store
    }

    /// Run one attempt for `contact_key`.
    ///
    /// On any attempt-level failure every record locked by this attempt is unlocked
    /// again (handled unchanged) before the error is returned, including records that
    /// were delivered before a sibling failed.
    pub async fn run(
        &self,
        contact_key: &str,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, RelayError> {
        let batch = match fetch_batch(&*self.store, contact_key).await? {
            Fetched::Empty => {
                log::debug!("{}: no records to process for {}", self.name, contact_key);
                return Ok(AttemptOutcome::Empty);
            }
            Fetched::Batch(batch) => batch,
        };

        let LockReport {
            mut locked,
            conflicts,
        } = lock_batch(&*self.store, batch, now_ms()).await?;
        if locked.is_empty() {
            log::debug!(
                "{}: all {} record(s) for {} are owned by another attempt",
                self.name,
                conflicts.len(),
                contact_key
            );
            return Ok(AttemptOutcome::Contended {
                conflicts: conflicts.len(),
            });
        }

        order_batch(&mut locked);
        log::debug!(
            "{}: locked {} record(s) for {}",
            self.name,
            locked.len(),
            contact_key
        );

        match self.deliver_locked(contact_key, &locked, cancel).await {
            Ok(delivered) => {
                let committed = commit_batch(&*self.store, &locked).await;
                if !committed.is_complete() {
                    return Err(RelayError::CommitIncomplete {
                        stuck: committed.stuck,
                    });
                }
                log::info!(
                    "{}: relayed {} record(s) for {}",
                    self.name,
                    delivered,
                    contact_key
                );
                Ok(AttemptOutcome::Delivered {
                    delivered,
                    conflicts: conflicts.len(),
                })
            }
            Err(e) => {
                log::warn!(
                    "{}: attempt for {} failed: {}; unlocking {} record(s)",
                    self.name,
                    contact_key,
                    e,
                    locked.len()
                );
                let released = unlock_all(&*self.store, &locked).await;
                if !released.is_complete() {
                    log::error!(
                        "{}: {} record(s) for {} left locked after recovery",
                        self.name,
                        released.stuck.len(),
                        contact_key
                    );
                }
                Err(e)
            }
        }
    }

    async fn deliver_locked(
        &self,
        contact_key: &str,
        locked: &[RelayRecord<P>],
        cancel: &CancellationToken,
    ) -> Result<usize, RelayError> {
        let mut cursor = self.sink.begin(contact_key).await?;
        let report = deliver_batch(&self.sink, &mut cursor, locked, cancel).await?;
        if report.failed.is_empty() {
            Ok(report.delivered.len())
        } else {
            Err(RelayError::Delivery {
                failed: report.failed,
            })
        }
    }
}
