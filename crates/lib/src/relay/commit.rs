//! Commit on full success, recovery (unlock everything this attempt locked) otherwise.
//!
//! Both are per-record, not batch-atomic. A record whose commit write fails stays
//! `handled = false, lock = true` until the lock lease sweep releases it, after which
//! it is delivered again.
//!
//! Every write is conditional on the lock stamp this attempt took (`locked_at` of the
//! batch record). Once the sweep has released an expired lease, the record may belong
//! to a newer attempt and the write is skipped.

use crate::record::{RecordKey, RelayRecord};
use crate::store::{ReleaseOutcome, RelayStore, StoreError};

/// Per-record outcome of a commit or unlock pass.
#[derive(Debug, Default)]
pub struct FlagReport {
    pub updated: usize,
    /// Records whose write failed; they remain locked.
    pub stuck: Vec<RecordKey>,
    /// Records whose lease had already been released; left to their new owner.
    pub lost: Vec<RecordKey>,
}

impl FlagReport {
    pub fn is_complete(&self) -> bool {
        self.stuck.is_empty()
    }
}

/// Mark every record `handled = true, lock = false`.
pub async fn commit_batch<P, S>(store: &S, batch: &[RelayRecord<P>]) -> FlagReport
where
    S: RelayStore<P> + ?Sized,
{
    let mut report = FlagReport::default();
    for r in batch {
        let result = match r.locked_at {
            Some(stamp) => store.commit(&r.contact_key, &r.record_key, stamp).await,
            None => Ok(ReleaseOutcome::LeaseLost),
        };
        tally(&mut report, r, "commit", result);
    }
    report
}

/// Set `lock = false` on every record, leaving `handled` untouched.
pub async fn unlock_all<P, S>(store: &S, batch: &[RelayRecord<P>]) -> FlagReport
where
    S: RelayStore<P> + ?Sized,
{
    let mut report = FlagReport::default();
    for r in batch {
        let result = match r.locked_at {
            Some(stamp) => store.unlock(&r.contact_key, &r.record_key, stamp).await,
            None => Ok(ReleaseOutcome::LeaseLost),
        };
        tally(&mut report, r, "unlock", result);
    }
    report
}

fn tally<P>(
    report: &mut FlagReport,
    r: &RelayRecord<P>,
    op: &str,
    result: Result<ReleaseOutcome, StoreError>,
) {
    match result {
        Ok(ReleaseOutcome::Released) => report.updated += 1,
        Ok(ReleaseOutcome::LeaseLost) => {
            log::warn!(
                "{} skipped for {}/{}: lock lease expired and was released",
                op,
                r.contact_key,
                r.record_key
            );
            report.lost.push(r.record_key.clone());
        }
        Err(e) => {
            log::error!(
                "{} failed for {}/{}: {}; record stays locked until the lease expires",
                op,
                r.contact_key,
                r.record_key,
                e
            );
            report.stuck.push(r.record_key.clone());
        }
    }
}
