//! Zendesk Support API client (tickets and ticket comments).

use crate::config::ZendeskConfig;
use crate::record::Attachment;
use crate::sink::{NewThread, SinkError, TicketingApi};
use crate::store::OpenThread;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ZendeskError {
    #[error("zendesk request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("zendesk api error: {status} {body}")]
    Api { status: u16, body: String },
}

impl From<ZendeskError> for SinkError {
    fn from(e: ZendeskError) -> Self {
        match e {
            ZendeskError::Api { status, body } => SinkError::Api { status, body },
            ZendeskError::Request(e) => SinkError::Request(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TicketEnvelope {
    ticket: TicketResponse,
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    id: i64,
    requester_id: i64,
}

#[derive(Debug, Deserialize)]
struct CommentsResponse {
    #[serde(default)]
    comments: Vec<ZendeskComment>,
}

/// A ticket comment as returned by `GET /tickets/{id}/comments.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ZendeskComment {
    pub id: i64,
    pub author_id: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub plain_body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// RFC 3339.
    pub created_at: String,
    #[serde(default)]
    pub via: Option<CommentVia>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentVia {
    pub channel: String,
}

impl ZendeskComment {
    /// Comments typed by an agent in the agent workspace. Comments relayed from the chat
    /// side arrive through the API and are skipped.
    pub fn is_agent_comment(&self) -> bool {
        self.via.as_ref().is_some_and(|v| v.channel == "web")
    }
}

#[derive(Clone)]
pub struct ZendeskClient {
    base_url: String,
    user: String,
    token: String,
    client: reqwest::Client,
}

impl ZendeskClient {
    /// Every request gives up after `timeout`.
    pub fn new(
        config: &ZendeskConfig,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ZendeskError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.clone().unwrap_or_default(),
            token: token.unwrap_or_default(),
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/v2{}", self.base_url, path);
        self.client
            .request(method, url)
            .basic_auth(format!("{}/token", self.user), Some(&self.token))
    }

    async fn check(res: reqwest::Response) -> Result<reqwest::Response, ZendeskError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        Err(ZendeskError::Api { status, body })
    }

    /// POST /tickets.json: new ticket with the first comment.
    pub async fn create_ticket(&self, new: &NewThread) -> Result<OpenThread, ZendeskError> {
        let body = json!({
            "ticket": {
                "subject": new.subject,
                "requester": { "name": new.requester_name, "email": new.requester_email },
                "tags": ["whatsapp"],
                "comment": { "body": new.body },
            }
        });
        let res = self
            .request(reqwest::Method::POST, "/tickets.json")
            .json(&body)
            .send()
            .await?;
        let data: TicketEnvelope = Self::check(res).await?.json().await?;
        Ok(OpenThread {
            thread_id: data.ticket.id,
            requester_id: data.ticket.requester_id,
        })
    }

    /// PUT /tickets/{id}.json: add a comment as `author_id` and set the ticket open.
    pub async fn update_ticket(
        &self,
        ticket_id: i64,
        author_id: i64,
        body: &str,
    ) -> Result<(), ZendeskError> {
        let payload = json!({
            "ticket": {
                "status": "open",
                "comment": { "body": body, "author_id": author_id },
            }
        });
        let res = self
            .request(reqwest::Method::PUT, &format!("/tickets/{}.json", ticket_id))
            .json(&payload)
            .send()
            .await?;
        Self::check(res).await?;
        Ok(())
    }

    /// GET /tickets/{id}/comments.json, newest first.
    pub async fn ticket_comments(&self, ticket_id: i64) -> Result<Vec<ZendeskComment>, ZendeskError> {
        let res = self
            .request(
                reqwest::Method::GET,
                &format!("/tickets/{}/comments.json?sort_order=desc", ticket_id),
            )
            .send()
            .await?;
        let data: CommentsResponse = Self::check(res).await?.json().await?;
        Ok(data.comments)
    }
}

#[async_trait]
impl TicketingApi for ZendeskClient {
    async fn create_thread(&self, new: &NewThread) -> Result<OpenThread, SinkError> {
        Ok(self.create_ticket(new).await?)
    }

    async fn append_comment(
        &self,
        thread_id: i64,
        requester_id: i64,
        body: &str,
    ) -> Result<(), SinkError> {
        Ok(self.update_ticket(thread_id, requester_id, body).await?)
    }
}
