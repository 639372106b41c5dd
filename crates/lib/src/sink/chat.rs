//! Chat sink: ticket comments are sent to the contact as text, then one message per attachment.

use super::{ChatApi, Sink, SinkError};
use crate::record::{RelayRecord, TicketComment};
use crate::relay::RelayError;
use crate::render;
use async_trait::async_trait;

pub struct ChatSink<A> {
    api: A,
}

impl<A: ChatApi> ChatSink<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }
}

#[async_trait]
impl<A: ChatApi> Sink<TicketComment> for ChatSink<A> {
    type Cursor = ();

    async fn begin(&self, _contact_key: &str) -> Result<(), RelayError> {
        Ok(())
    }

    async fn deliver(
        &self,
        _cursor: &mut (),
        record: &RelayRecord<TicketComment>,
    ) -> Result<(), SinkError> {
        let recipient = &record.contact_key;
        let text = render::chat_text(&record.payload);
        if !text.is_empty() {
            self.api.send_text(recipient, &text).await?;
        }
        for attachment in &record.payload.attachments {
            self.api.send_attachment(recipient, attachment).await?;
        }
        Ok(())
    }
}
