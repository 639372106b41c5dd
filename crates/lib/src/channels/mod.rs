//! External systems: the WhatsApp channel and the Zendesk ticketing API.
//!
//! Clients implement the sink-side API traits; inbound payloads are parsed here and
//! turned into relay records by the ingest module.

mod inbound;
mod whatsapp;
mod zendesk;

pub use inbound::{WebhookContact, WebhookMessage, WebhookProfile, WhatsAppWebhook, ZendeskWebhook};
pub use whatsapp::{attachment_message, WhatsAppClient, WhatsAppError};
pub use zendesk::{CommentVia, ZendeskClient, ZendeskComment, ZendeskError};
