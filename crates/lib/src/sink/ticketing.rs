//! Ticketing sink: chat messages become comments on the contact's single open ticket.

use super::{Sink, SinkError, TicketingApi};
use crate::record::{ChatMessage, RelayRecord};
use crate::relay::RelayError;
use crate::render;
use crate::store::{OpenThread, RegisterOutcome, ThreadDirectory};
use async_trait::async_trait;
use std::sync::Arc;

/// Ticket to create for a contact that has no open thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewThread {
    pub subject: String,
    pub requester_name: String,
    pub requester_email: String,
    /// First comment of the ticket.
    pub body: String,
}

/// Thread resolved for the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCursor {
    /// No open thread yet; the next delivery creates one.
    Pending,
    Open(OpenThread),
}

pub struct TicketingSink<A> {
    api: A,
    directory: Arc<dyn ThreadDirectory>,
    requester_domain: String,
}

impl<A: TicketingApi> TicketingSink<A> {
    pub fn new(api: A, directory: Arc<dyn ThreadDirectory>, requester_domain: impl Into<String>) -> Self {
        Self {
            api,
            directory,
            requester_domain: requester_domain.into(),
        }
    }

    fn new_thread(&self, record: &RelayRecord<ChatMessage>, body: String) -> NewThread {
        let name = &record.payload.contact_name;
        NewThread {
            subject: format!("WhatsApp {} - {}", record.contact_key, name),
            requester_name: name.clone(),
            requester_email: format!("{}@{}", record.contact_key, self.requester_domain),
            body,
        }
    }
}

#[async_trait]
impl<A: TicketingApi> Sink<ChatMessage> for TicketingSink<A> {
    type Cursor = ThreadCursor;

    async fn begin(&self, contact_key: &str) -> Result<ThreadCursor, RelayError> {
        let open = self.directory.find_open(contact_key).await?;
        match open.as_slice() {
            [] => Ok(ThreadCursor::Pending),
            [thread] => Ok(ThreadCursor::Open(*thread)),
            many => Err(RelayError::InvariantViolation(format!(
                "contact {} has {} open threads",
                contact_key,
                many.len()
            ))),
        }
    }

    async fn deliver(
        &self,
        cursor: &mut ThreadCursor,
        record: &RelayRecord<ChatMessage>,
    ) -> Result<(), SinkError> {
        let body = render::comment_body(&record.payload)?;
        match *cursor {
            ThreadCursor::Open(thread) => {
                self.api
                    .append_comment(thread.thread_id, thread.requester_id, &body)
                    .await
            }
            ThreadCursor::Pending => {
                let created = self.api.create_thread(&self.new_thread(record, body)).await?;
                log::info!(
                    "ticketing: created thread {} for contact {}",
                    created.thread_id,
                    record.contact_key
                );
                match self.directory.register(&record.contact_key, created).await? {
                    RegisterOutcome::Registered => {}
                    RegisterOutcome::Existing(other) if other.thread_id == created.thread_id => {}
                    RegisterOutcome::Existing(other) => {
                        return Err(SinkError::Invariant(format!(
                            "contact {} already had open thread {} when thread {} was created",
                            record.contact_key, other.thread_id, created.thread_id
                        )));
                    }
                }
                *cursor = ThreadCursor::Open(created);
                Ok(())
            }
        }
    }
}
