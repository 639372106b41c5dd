//! Delivery pipeline: hand each record to the sink, in order, one at a time.

use super::{FailedDelivery, RelayError};
use crate::record::{RecordKey, RelayRecord};
use crate::sink::{Sink, SinkError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<RecordKey>,
    pub failed: Vec<FailedDelivery>,
}

/// Deliver `batch` sequentially. A failed record does not stop the ones after it;
/// failures are collected in the report.
///
/// Fatal sink errors (invariant violations, store faults) and cancellation end the
/// pass immediately with an error.
pub async fn deliver_batch<P, K>(
    sink: &K,
    cursor: &mut K::Cursor,
    batch: &[RelayRecord<P>],
    cancel: &CancellationToken,
) -> Result<DeliveryReport, RelayError>
where
    P: Send + Sync,
    K: Sink<P> + ?Sized,
{
    let mut report = DeliveryReport::default();
    for record in batch {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            r = sink.deliver(cursor, record) => r,
        };
        match result {
            Ok(()) => report.delivered.push(record.record_key.clone()),
            Err(SinkError::Invariant(msg)) => return Err(RelayError::InvariantViolation(msg)),
            Err(SinkError::Store(e)) => return Err(RelayError::Persistence(e)),
            Err(error) => {
                log::warn!(
                    "delivery of {}/{} failed: {}",
                    record.contact_key,
                    record.record_key,
                    error
                );
                report.failed.push(FailedDelivery {
                    record_key: record.record_key.clone(),
                    error,
                });
            }
        }
    }
    Ok(report)
}
