//! Batch fetcher: the pending records of one contact.

use crate::record::RelayRecord;
use crate::store::{RelayStore, StoreError};

/// Result of a fetch. `Empty` is the benign "nothing to do" signal, not an error.
#[derive(Debug)]
pub enum Fetched<P> {
    Empty,
    Batch(Vec<RelayRecord<P>>),
}

/// Consistent read of every `handled = false AND lock = false` record for the contact.
/// Store faults propagate and end the attempt.
pub async fn fetch_batch<P, S>(
    store: &S,
    contact_key: &str,
) -> Result<Fetched<P>, StoreError>
where
    S: RelayStore<P> + ?Sized,
{
    let records = store.query_unhandled_unlocked(contact_key).await?;
    if records.is_empty() {
        Ok(Fetched::Empty)
    } else {
        Ok(Fetched::Batch(records))
    }
}
