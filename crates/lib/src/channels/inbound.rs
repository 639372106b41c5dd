//! Inbound webhook payloads: WhatsApp message notifications and Zendesk comment triggers.

use serde::Deserialize;

/// WhatsApp webhook body: one contact and the messages it sent.
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppWebhook {
    #[serde(default)]
    pub contacts: Vec<WebhookContact>,
    #[serde(default)]
    pub messages: Option<Vec<WebhookMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookContact {
    pub wa_id: Option<String>,
    pub profile: Option<WebhookProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookProfile {
    pub name: Option<String>,
}

/// One message. The type-specific object sits under a key named after `type`
/// and is kept as raw JSON in `rest`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMessage {
    pub from: Option<String>,
    pub id: Option<String>,
    /// Epoch seconds, sent as a string.
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl WebhookMessage {
    /// True when every field common to all message types is present.
    pub fn has_common_fields(&self) -> bool {
        self.from.is_some() && self.id.is_some() && self.timestamp.is_some() && self.kind.is_some()
    }
}

/// Zendesk trigger body: the ticket that got a new comment and its requester.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZendeskWebhook {
    pub ticket_id: Option<serde_json::Value>,
    pub requester_email: Option<String>,
}

impl ZendeskWebhook {
    /// Ticket id, accepted as a JSON number or a numeric string.
    pub fn ticket_id(&self) -> Option<i64> {
        match self.ticket_id.as_ref()? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Contact key encoded in the requester email (`<wa_id>@domain`).
    pub fn contact_key(&self) -> Option<String> {
        let email = self.requester_email.as_deref()?;
        let (local, _) = email.split_once('@')?;
        let local = local.trim();
        (!local.is_empty()).then(|| local.to_string())
    }
}
