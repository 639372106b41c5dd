//! Text rendering of relay payloads for the destination system.
//!
//! Media is referenced, not transferred: a media message becomes its caption
//! (or a placeholder) plus the WhatsApp media id.

use crate::record::{ChatMessage, TicketComment};
use crate::sink::SinkError;
use serde_json::Value;

const NO_TEXT_PLACEHOLDER: &str = "Message with no text (see attachment)";

const MEDIA_KINDS: &[&str] = &["image", "video", "document", "audio", "voice"];

/// Body of the ticket comment for a chat message.
pub fn comment_body(msg: &ChatMessage) -> Result<String, SinkError> {
    let c = &msg.content;
    match msg.kind.as_str() {
        "text" => str_field(c, "body")
            .map(str::to_string)
            .ok_or_else(|| SinkError::InvalidPayload("text message without body".to_string())),
        "location" => Ok(location_body(c)),
        "contacts" => Ok(contacts_body(c)),
        kind if MEDIA_KINDS.contains(&kind) => {
            let mut out = str_field(c, "caption")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(NO_TEXT_PLACEHOLDER)
                .to_string();
            if let Some(id) = str_field(c, "id") {
                out.push_str(&format!("\n\n[{} media id: {}]", kind, id));
            }
            Ok(out)
        }
        other => Err(SinkError::InvalidPayload(format!(
            "unsupported message type: {}",
            other
        ))),
    }
}

/// Text sent to the contact for a ticket comment. Empty when there is nothing to say.
pub fn chat_text(comment: &TicketComment) -> String {
    let text = if comment.plain_body.trim().is_empty() {
        &comment.body
    } else {
        &comment.plain_body
    };
    text.replace("&nbsp;", " ").trim().to_string()
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

fn location_body(c: &Value) -> String {
    let mut out = String::from("This message is a location:\n\n");
    if let Some(name) = str_field(c, "name") {
        out.push_str(&format!("Name of the place: {}\n", name));
    }
    if let Some(address) = str_field(c, "address") {
        out.push_str(&format!("Address: {}\n", address));
    }
    let coord = |k: &str| c.get(k).map(|v| v.to_string()).unwrap_or_default();
    out.push_str(&format!(
        "See on Google Maps: https://www.google.com/maps/?q={},{}",
        coord("latitude"),
        coord("longitude")
    ));
    out
}

fn contacts_body(c: &Value) -> String {
    let mut out = String::from("This message is a Contact Card:");
    for contact in c.as_array().into_iter().flatten() {
        let name = contact
            .get("name")
            .and_then(|n| str_field(n, "formatted_name"))
            .unwrap_or("");
        out.push_str(&format!("\n\nName: {}", name));
        let phones = contact.get("phones").and_then(Value::as_array);
        for phone in phones.into_iter().flatten() {
            out.push_str(&format!(
                "\n{}: {}",
                str_field(phone, "type").unwrap_or("Phone"),
                str_field(phone, "phone").unwrap_or("")
            ));
        }
    }
    out
}
