//! Trigger adapter: turns store change events into relay attempts.
//!
//! Only `INSERT` events start an attempt; every insert starts one, so several
//! attempts for the same contact can be in flight at once. The locks on the
//! records keep them from delivering the same record twice.

use crate::record::ContactKey;
use crate::relay::{AttemptOutcome, RelayEngine, RelayError};
use crate::retry::RetryPolicy;
use crate::sink::Sink;
use crate::store::{ChangeEvent, EventType};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Outcome of handling a batch of change events, one entry per insert event.
#[derive(Debug, Default)]
pub struct TriggerReport {
    pub succeeded: Vec<(ChangeEvent, AttemptOutcome)>,
    pub failed: Vec<(ChangeEvent, RelayError)>,
}

impl TriggerReport {
    /// False means the event source should redeliver the batch.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct TriggerAdapter<P, K> {
    engine: RelayEngine<P, K>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<P, K> TriggerAdapter<P, K>
where
    P: Send + Sync + 'static,
    K: Sink<P> + 'static,
{
    pub fn new(engine: RelayEngine<P, K>, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            engine,
            retry,
            cancel,
        }
    }

    pub fn engine(&self) -> &RelayEngine<P, K> {
        &self.engine
    }

    /// Handle one delivery of change events: a single attempt per insert event, in order.
    /// Non-insert events are ignored.
    pub async fn handle_events(&self, events: &[ChangeEvent]) -> TriggerReport {
        let mut report = TriggerReport::default();
        for event in events.iter().filter(|e| e.event_type == EventType::Insert) {
            match self.engine.run(&event.contact_key, &self.cancel).await {
                Ok(outcome) => report.succeeded.push((event.clone(), outcome)),
                Err(e) => {
                    log::warn!(
                        "{}: event {}/{} failed: {}",
                        self.engine.name(),
                        event.contact_key,
                        event.record_key,
                        e
                    );
                    report.failed.push((event.clone(), e));
                }
            }
        }
        report
    }

    /// Run attempts for `contact_key` until one succeeds, the failure is not retryable,
    /// or the retry policy is exhausted.
    pub async fn relay(&self, contact_key: &str) -> Result<AttemptOutcome, RelayError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.engine.run(contact_key, &self.cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };
            if let RelayError::InvariantViolation(ref msg) = err {
                log::error!(
                    "{}: invariant violation for {}, not retrying; operator action required: {}",
                    self.engine.name(),
                    contact_key,
                    msg
                );
                return Err(err);
            }
            if !err.is_retryable() {
                return Err(err);
            }
            if !self.retry.can_retry(attempts) {
                log::error!(
                    "{}: giving up on {} after {} attempt(s): {}",
                    self.engine.name(),
                    contact_key,
                    attempts,
                    err
                );
                return Err(err);
            }
            let delay = self.retry.delay(attempts);
            log::debug!(
                "{}: retrying {} in {:?} (attempt {} failed: {})",
                self.engine.name(),
                contact_key,
                delay,
                attempts,
                err
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Consume the change feed until cancelled, one task per insert event.
    /// In-flight attempts are awaited before the returned task finishes.
    pub fn spawn(self: Arc<Self>, mut changes: broadcast::Receiver<ChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!("{}: trigger adapter started", self.engine.name());
            let mut in_flight = JoinSet::new();
            loop {
                let received = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
                    r = changes.recv() => r,
                };
                match received {
                    Ok(event) if event.event_type == EventType::Insert => {
                        let this = Arc::clone(&self);
                        in_flight.spawn(async move {
                            let _ = this.relay(&event.contact_key).await;
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        log::warn!(
                            "{}: change feed lagged, {} event(s) dropped; pending records wait for the next insert or sweep",
                            self.engine.name(),
                            n
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            while in_flight.join_next().await.is_some() {}
            log::info!("{}: trigger adapter stopped", self.engine.name());
        })
    }

    /// Start a retried attempt for a contact outside the change feed (e.g. after a sweep).
    pub fn kick(self: &Arc<Self>, contact_key: ContactKey) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.relay(&contact_key).await;
        })
    }
}
