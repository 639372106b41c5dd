//! Sink capability: deliver one relay record to the other system.
//!
//! The engine calls [`Sink::begin`] once per attempt, then [`Sink::deliver`] for each
//! record in timestamp order, threading a per-attempt cursor through the calls.
//! Sinks must tolerate redelivery of a record that already went through once.

mod chat;
mod ticketing;

pub use chat::ChatSink;
pub use ticketing::{NewThread, ThreadCursor, TicketingSink};

use crate::record::{Attachment, RelayRecord};
use crate::relay::RelayError;
use crate::store::{OpenThread, StoreError};
use async_trait::async_trait;

/// Failure delivering a single record.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("api error: {status} {body}")]
    Api { status: u16, body: String },

    #[error("payload cannot be relayed: {0}")]
    InvalidPayload(String),

    /// Fatal to the whole attempt; never retried automatically.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Fatal to the whole attempt.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Direction-specific delivery of relay records with payload `P`.
#[async_trait]
pub trait Sink<P: Send + Sync>: Send + Sync {
    /// Per-attempt state carried between deliveries (e.g. the resolved ticket).
    type Cursor: Send;

    /// Prepare an attempt for `contact_key`. Errors abort the attempt before any delivery.
    async fn begin(&self, contact_key: &str) -> Result<Self::Cursor, RelayError>;

    async fn deliver(
        &self,
        cursor: &mut Self::Cursor,
        record: &RelayRecord<P>,
    ) -> Result<(), SinkError>;
}

/// Outbound calls to the chat channel.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), SinkError>;

    async fn send_attachment(
        &self,
        recipient: &str,
        attachment: &Attachment,
    ) -> Result<(), SinkError>;
}

/// Outbound calls to the ticketing system.
#[async_trait]
pub trait TicketingApi: Send + Sync {
    /// Create a ticket whose first comment is `new.body`; returns the ticket and its requester.
    async fn create_thread(&self, new: &NewThread) -> Result<OpenThread, SinkError>;

    /// Append a public comment authored by `requester_id` and reopen the ticket.
    async fn append_comment(
        &self,
        thread_id: i64,
        requester_id: i64,
        body: &str,
    ) -> Result<(), SinkError>;
}
