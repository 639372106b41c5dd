//! Order resolver.

use crate::record::RelayRecord;

/// Stable ascending sort by timestamp; equal timestamps keep fetch order.
pub fn order_batch<P>(batch: &mut [RelayRecord<P>]) {
    batch.sort_by_key(|r| r.timestamp);
}
