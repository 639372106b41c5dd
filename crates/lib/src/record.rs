//! Relay records: one message waiting to be moved from one system to the other.
//!
//! Records are partitioned by contact key (the WhatsApp `wa_id`) and carry
//! two flags, `handled` and `lock`, that the relay engine drives through
//! `initial -> locked -> handled` (or back to initial on failure).

use serde::{Deserialize, Serialize};

/// Stable identifier of one conversation partition (the contact's `wa_id`).
pub type ContactKey = String;

/// Record identifier, unique within a contact (message id or comment id).
pub type RecordKey = String;

/// One message pending transfer between the chat channel and the ticketing system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRecord<P> {
    pub contact_key: ContactKey,
    pub record_key: RecordKey,
    /// Ordering value; ties keep arrival order.
    pub timestamp: i64,
    pub payload: P,
    #[serde(default)]
    pub handled: bool,
    #[serde(default)]
    pub lock: bool,
    /// Epoch ms when the current lock was taken. Cleared on unlock and commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<i64>,
    /// Epoch ms of the last flag change (insert, lock, commit, unlock or lease release).
    /// The lock sweep resumes contacts whose pending records sat idle past the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touched_at: Option<i64>,
}

impl<P> RelayRecord<P> {
    /// New record in the initial state (`handled = false`, `lock = false`).
    pub fn new(
        contact_key: impl Into<ContactKey>,
        record_key: impl Into<RecordKey>,
        timestamp: i64,
        payload: P,
    ) -> Self {
        Self {
            contact_key: contact_key.into(),
            record_key: record_key.into(),
            timestamp,
            payload,
            handled: false,
            lock: false,
            locked_at: None,
            touched_at: None,
        }
    }

    /// True when the record is neither handled nor owned by an attempt.
    pub fn is_pending(&self) -> bool {
        !self.handled && !self.lock
    }
}

/// Inbound WhatsApp message, relayed into a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Profile name of the contact at the time the message arrived.
    pub contact_name: String,
    /// WhatsApp message type (`text`, `image`, `location`, ...).
    pub kind: String,
    /// The type-specific object from the webhook (e.g. `{"body": "hi"}` for text).
    pub content: serde_json::Value,
}

impl ChatMessage {
    pub fn text(contact_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            contact_name: contact_name.into(),
            kind: "text".to_string(),
            content: serde_json::json!({ "body": body.into() }),
        }
    }
}

/// Agent comment from a ticket, relayed back to the contact on WhatsApp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketComment {
    pub author_id: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub plain_body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TicketComment {
    pub fn plain(author_id: i64, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            author_id,
            body: text.clone(),
            plain_body: text,
            attachments: Vec::new(),
        }
    }
}

/// File attached to a ticket comment; `content_url` is what the chat side links to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_url: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}
