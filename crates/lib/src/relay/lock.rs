//! Batch locker.
//!
//! Locking is transactional over the locks acquired so far: a store failure part way
//! through releases every lock this call took before the error is returned.

use super::commit::unlock_all;
use super::RelayError;
use crate::record::RelayRecord;
use crate::store::{LockOutcome, RelayStore};

/// Partition of a fetched batch after locking.
#[derive(Debug)]
pub struct LockReport<P> {
    /// Records this attempt now owns, in fetch order.
    pub locked: Vec<RelayRecord<P>>,
    /// Records another attempt got first (or that were handled meanwhile).
    pub conflicts: Vec<RelayRecord<P>>,
}

/// Try to take the lock of every record in `batch` with an atomic `false -> true` update.
///
/// Conflicts exclude the record from this attempt and are not fatal. A store error aborts
/// the batch after unlocking the subset already locked.
pub async fn lock_batch<P, S>(
    store: &S,
    batch: Vec<RelayRecord<P>>,
    now_ms: i64,
) -> Result<LockReport<P>, RelayError>
where
    S: RelayStore<P> + ?Sized,
{
    let mut locked = Vec::with_capacity(batch.len());
    let mut conflicts = Vec::new();
    for mut record in batch {
        match store
            .try_lock(&record.contact_key, &record.record_key, now_ms)
            .await
        {
            Ok(LockOutcome::Acquired) => {
                record.lock = true;
                record.locked_at = Some(now_ms);
                locked.push(record);
            }
            Ok(LockOutcome::Conflict) => {
                log::debug!(
                    "lock conflict on {}/{}, owned by another attempt",
                    record.contact_key,
                    record.record_key
                );
                conflicts.push(record);
            }
            Err(e) => {
                log::warn!(
                    "locking {}/{} failed: {}; releasing {} lock(s) taken so far",
                    record.contact_key,
                    record.record_key,
                    e,
                    locked.len()
                );
                let released = unlock_all(store, &locked).await;
                if !released.is_complete() {
                    log::error!("{} record(s) left locked after aborted lock pass", released.stuck.len());
                }
                return Err(RelayError::Persistence(e));
            }
        }
    }
    Ok(LockReport { locked, conflicts })
}
