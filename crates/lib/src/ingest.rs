//! Ingestion: webhook payloads become relay records in the initial state.
//!
//! Inserts are insert-if-absent, so webhook retries and repeated comment listings
//! never create a second record for the same message.

use crate::channels::{WhatsAppWebhook, ZendeskComment};
use crate::record::{ChatMessage, RecordKey, RelayRecord, TicketComment};
use crate::store::{RelayStore, StoreError};

const SUPPORTED_KINDS: &[&str] = &[
    "text", "audio", "document", "image", "location", "video", "voice", "contacts",
];

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid webhook: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to each message of a webhook delivery.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub stored: Vec<RecordKey>,
    pub duplicates: Vec<RecordKey>,
    /// Message id (or position) and reason.
    pub rejected: Vec<(String, String)>,
}

impl IngestReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Validate a WhatsApp webhook and build one record per supported message.
/// Unsupported message types are reported, not fatal.
pub fn chat_records(
    webhook: &WhatsAppWebhook,
) -> Result<(Vec<RelayRecord<ChatMessage>>, Vec<(String, String)>), IngestError> {
    let [contact] = webhook.contacts.as_slice() else {
        return Err(IngestError::Invalid(format!(
            "expected exactly one contact, got {}",
            webhook.contacts.len()
        )));
    };
    let wa_id = contact
        .wa_id
        .as_deref()
        .ok_or_else(|| IngestError::Invalid("contact without wa_id".to_string()))?;
    let name = contact
        .profile
        .as_ref()
        .and_then(|p| p.name.as_deref())
        .ok_or_else(|| IngestError::Invalid("contact without profile name".to_string()))?;
    let messages = webhook
        .messages
        .as_ref()
        .ok_or_else(|| IngestError::Invalid("missing messages".to_string()))?;
    if !messages.iter().all(|m| m.has_common_fields()) {
        return Err(IngestError::Invalid(
            "a message is missing from/id/timestamp/type".to_string(),
        ));
    }

    let mut records = Vec::with_capacity(messages.len());
    let mut rejected = Vec::new();
    for m in messages {
        // Common fields were checked above.
        let (Some(id), Some(kind), Some(ts)) = (&m.id, &m.kind, &m.timestamp) else {
            continue;
        };
        if !SUPPORTED_KINDS.contains(&kind.as_str()) {
            rejected.push((id.clone(), format!("unsupported message type: {}", kind)));
            continue;
        }
        let Ok(timestamp) = ts.trim().parse::<i64>() else {
            rejected.push((id.clone(), format!("invalid timestamp: {}", ts)));
            continue;
        };
        let content = m.rest.get(kind).cloned().unwrap_or(serde_json::Value::Null);
        let payload = ChatMessage {
            contact_name: name.to_string(),
            kind: kind.clone(),
            content,
        };
        records.push(RelayRecord::new(wa_id, id.clone(), timestamp, payload));
    }
    Ok((records, rejected))
}

/// Store every supported message of a WhatsApp webhook.
pub async fn ingest_whatsapp<S>(store: &S, webhook: &WhatsAppWebhook) -> Result<IngestReport, IngestError>
where
    S: RelayStore<ChatMessage> + ?Sized,
{
    let (records, rejected) = chat_records(webhook)?;
    let mut report = IngestReport {
        rejected,
        ..IngestReport::default()
    };
    insert_all(store, records, &mut report).await?;
    Ok(report)
}

/// Build records for the agent comments of a ticket. Non-agent comments are skipped.
pub fn comment_records(
    contact_key: &str,
    comments: &[ZendeskComment],
) -> (Vec<RelayRecord<TicketComment>>, Vec<(String, String)>) {
    let mut records = Vec::new();
    let mut rejected = Vec::new();
    for c in comments.iter().filter(|c| c.is_agent_comment()) {
        let timestamp = match chrono::DateTime::parse_from_rfc3339(&c.created_at) {
            Ok(t) => t.timestamp_millis(),
            Err(e) => {
                rejected.push((c.id.to_string(), format!("invalid created_at: {}", e)));
                continue;
            }
        };
        let payload = TicketComment {
            author_id: c.author_id,
            body: c.body.clone(),
            plain_body: c.plain_body.clone(),
            attachments: c.attachments.clone(),
        };
        records.push(RelayRecord::new(contact_key, c.id.to_string(), timestamp, payload));
    }
    (records, rejected)
}

/// Store the new agent comments of a ticket for the contact.
pub async fn ingest_comments<S>(
    store: &S,
    contact_key: &str,
    comments: &[ZendeskComment],
) -> Result<IngestReport, IngestError>
where
    S: RelayStore<TicketComment> + ?Sized,
{
    let (records, rejected) = comment_records(contact_key, comments);
    let mut report = IngestReport {
        rejected,
        ..IngestReport::default()
    };
    insert_all(store, records, &mut report).await?;
    Ok(report)
}

async fn insert_all<P, S>(
    store: &S,
    records: Vec<RelayRecord<P>>,
    report: &mut IngestReport,
) -> Result<(), IngestError>
where
    S: RelayStore<P> + ?Sized,
{
    for r in records {
        let key = r.record_key.clone();
        if store.insert(r).await? {
            report.stored.push(key);
        } else {
            report.duplicates.push(key);
        }
    }
    Ok(())
}
