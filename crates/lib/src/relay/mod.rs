//! Ordered, lock-coordinated relay protocol shared by both directions.
//!
//! For one contact key: fetch unhandled and unlocked records, lock them with an
//! atomic compare-and-set, sort by timestamp, deliver sequentially to the sink,
//! then commit all of them or unlock all of them.

mod commit;
mod deliver;
mod engine;
mod error;
mod fetch;
mod lock;
mod order;

pub use commit::{commit_batch, unlock_all, FlagReport};
pub use deliver::{deliver_batch, DeliveryReport};
pub use engine::{AttemptOutcome, RelayEngine};
pub use error::{FailedDelivery, RelayError};
pub use fetch::{fetch_batch, Fetched};
pub use lock::{lock_batch, LockReport};
pub use order::order_batch;

/// Current wall clock in epoch milliseconds (lock timestamps).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
