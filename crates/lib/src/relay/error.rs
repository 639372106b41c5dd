//! Attempt-level errors and per-record delivery failures.

use crate::record::RecordKey;
use crate::sink::SinkError;
use crate::store::StoreError;

/// One record whose delivery failed in an attempt.
#[derive(Debug)]
pub struct FailedDelivery {
    pub record_key: RecordKey,
    pub error: SinkError,
}

/// Why a relay attempt did not complete.
///
/// An empty batch or a lock conflict is not an error; see [`super::AttemptOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("{} record(s) failed delivery", failed.len())]
    Delivery { failed: Vec<FailedDelivery> },

    /// Broken data invariant (e.g. two open threads for one contact). Needs an operator.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("commit left {} record(s) locked", stuck.len())]
    CommitIncomplete { stuck: Vec<RecordKey> },

    #[error("attempt cancelled")]
    Cancelled,
}

impl RelayError {
    /// Whether redelivering the triggering event may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvariantViolation(_) | Self::Cancelled)
    }
}
