//! WhatsApp Business (on-premises) API client: login, send text, send media by link.

use crate::config::WhatsAppConfig;
use crate::record::Attachment;
use crate::sink::{ChatApi, SinkError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum WhatsAppError {
    #[error("whatsapp request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("whatsapp api error: {status} {body}")]
    Api { status: u16, body: String },
    #[error("whatsapp login returned no token")]
    NoToken,
}

impl From<WhatsAppError> for SinkError {
    fn from(e: WhatsAppError) -> Self {
        match e {
            WhatsAppError::Api { status, body } => SinkError::Api { status, body },
            other => SinkError::Request(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    users: Vec<LoginUser>,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    token: String,
}

/// Client for the WhatsApp API. The bearer token from `/v1/users/login` is cached and
/// refreshed once when a send comes back 401.
pub struct WhatsAppClient {
    base_url: String,
    user: String,
    password: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl WhatsAppClient {
    /// Every request (login included) gives up after `timeout`.
    pub fn new(
        config: &WhatsAppConfig,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, WhatsAppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.clone().unwrap_or_default(),
            password: password.unwrap_or_default(),
            client,
            token: RwLock::new(None),
        })
    }

    /// POST /v1/users/login with basic auth; returns a fresh bearer token.
    async fn login(&self) -> Result<String, WhatsAppError> {
        let url = format!("{}/v1/users/login", self.base_url);
        let res = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({ "new_password": self.password }))
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(WhatsAppError::Api { status, body });
        }
        let data: LoginResponse = res.json().await?;
        let token = data
            .users
            .into_iter()
            .next()
            .map(|u| u.token)
            .ok_or(WhatsAppError::NoToken)?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn bearer(&self) -> Result<String, WhatsAppError> {
        if let Some(t) = self.token.read().await.clone() {
            return Ok(t);
        }
        self.login().await
    }

    /// POST /v1/messages.
    async fn post_message(&self, body: serde_json::Value) -> Result<(), WhatsAppError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut token = self.bearer().await?;
        for retried in [false, true] {
            let res = self
                .client
                .post(&url)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await?;
            if res.status() == reqwest::StatusCode::UNAUTHORIZED && !retried {
                log::debug!("whatsapp token rejected, logging in again");
                token = self.login().await?;
                continue;
            }
            if !res.status().is_success() {
                let status = res.status().as_u16();
                let body = res.text().await.unwrap_or_default();
                return Err(WhatsAppError::Api { status, body });
            }
            return Ok(());
        }
        Err(WhatsAppError::Api {
            status: 401,
            body: "unauthorized after re-login".to_string(),
        })
    }
}

/// Message body for sending an attachment by link. Images and videos are sent as such,
/// anything else as a document.
pub fn attachment_message(recipient: &str, attachment: &Attachment) -> serde_json::Value {
    let content_type = attachment.content_type.as_deref().unwrap_or("image/");
    let (kind, media) = if content_type.starts_with("image/") {
        ("image", json!({ "link": attachment.content_url }))
    } else if content_type.starts_with("video/") {
        ("video", json!({ "link": attachment.content_url }))
    } else {
        (
            "document",
            json!({ "link": attachment.content_url, "filename": attachment.file_name }),
        )
    };
    let mut body = json!({
        "to": recipient,
        "type": kind,
        "recipient_type": "individual",
    });
    body[kind] = media;
    body
}

#[async_trait]
impl ChatApi for WhatsAppClient {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), SinkError> {
        let body = json!({
            "to": recipient,
            "type": "text",
            "recipient_type": "individual",
            "text": { "body": text },
        });
        self.post_message(body).await.map_err(SinkError::from)
    }

    async fn send_attachment(
        &self,
        recipient: &str,
        attachment: &Attachment,
    ) -> Result<(), SinkError> {
        self.post_message(attachment_message(recipient, attachment))
            .await
            .map_err(SinkError::from)
    }
}
