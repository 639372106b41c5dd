//! Gateway HTTP server: health and the two inbound webhooks, plus the relay runners.

use crate::channels::{WhatsAppClient, WhatsAppWebhook, ZendeskClient, ZendeskWebhook};
use crate::config::{self, Config};
use crate::ingest::{ingest_comments, ingest_whatsapp, IngestError, IngestReport};
use crate::init;
use crate::record::{ChatMessage, TicketComment};
use crate::relay::RelayEngine;
use crate::sink::{ChatSink, Sink, TicketingSink};
use crate::store::{MemoryRelayStore, MemoryThreadDirectory, RelayStore, ThreadDirectory};
use crate::sweep::LockSweeper;
use crate::trigger::TriggerAdapter;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHAT_TABLE: &str = "whatsapp_messages.json";
const COMMENT_TABLE: &str = "zendesk_comments.json";
const THREAD_TABLE: &str = "zendesk_tickets.json";

/// Webhook reply. Always sent with 200 so the upstream webhook is never disabled
/// after repeated failures; the body says what happened.
type WebhookReply = (StatusCode, &'static str);

const OK: WebhookReply = (StatusCode::OK, "OK");
const BAD_REQUEST: WebhookReply = (StatusCode::OK, "Bad Request");
const INTERNAL_ERROR: WebhookReply = (StatusCode::OK, "Internal Server Error");

#[derive(Clone)]
struct GatewayState {
    port: u16,
    chat_store: Arc<MemoryRelayStore<ChatMessage>>,
    comment_store: Arc<MemoryRelayStore<TicketComment>>,
    zendesk: ZendeskClient,
}

/// Run the gateway until SIGINT/SIGTERM: serve webhooks, relay both directions,
/// sweep expired locks. On shutdown in-flight attempts are cancelled and awaited.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let data_dir = config::resolve_store_dir(&config, &config_path);
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let chat_store = Arc::new(open_table::<ChatMessage>(&data_dir, CHAT_TABLE).await?);
    let comment_store = Arc::new(open_table::<TicketComment>(&data_dir, COMMENT_TABLE).await?);
    let thread_path = data_dir.join(THREAD_TABLE);
    let threads: Arc<dyn ThreadDirectory> = Arc::new(
        MemoryThreadDirectory::open(&thread_path)
            .await
            .with_context(|| format!("opening thread directory {}", thread_path.display()))?,
    );

    let timeout = config.relay.request_timeout();
    let zendesk = ZendeskClient::new(
        &config.zendesk,
        config::resolve_zendesk_token(&config),
        timeout,
    )
    .context("building zendesk client")?;
    let whatsapp = WhatsAppClient::new(
        &config.whatsapp,
        config::resolve_whatsapp_password(&config),
        timeout,
    )
    .context("building whatsapp client")?;
    if config.zendesk.base_url.is_empty() || config.whatsapp.base_url.is_empty() {
        log::warn!("zendesk.baseUrl or whatsapp.baseUrl is not set; deliveries will fail");
    }

    let cancel = CancellationToken::new();
    let chat_table: Arc<dyn RelayStore<ChatMessage>> = chat_store.clone();
    let comment_table: Arc<dyn RelayStore<TicketComment>> = comment_store.clone();
    let to_zendesk = Arc::new(TriggerAdapter::new(
        RelayEngine::new(
            "whatsapp->zendesk",
            chat_table,
            TicketingSink::new(
                zendesk.clone(),
                threads,
                config.zendesk.requester_domain.clone(),
            ),
        ),
        config.relay.retry,
        cancel.clone(),
    ));
    let to_whatsapp = Arc::new(TriggerAdapter::new(
        RelayEngine::new("zendesk->whatsapp", comment_table, ChatSink::new(whatsapp)),
        config.relay.retry,
        cancel.clone(),
    ));

    let mut tasks = Vec::new();
    tasks.extend(start_direction(&to_zendesk, &*chat_store, &config, &cancel).await);
    tasks.extend(start_direction(&to_whatsapp, &*comment_store, &config, &cancel).await);

    let state = GatewayState {
        port: config.gateway.port,
        chat_store,
        comment_store,
        zendesk,
    };
    let app = Router::new()
        .route("/", get(health_http))
        .route("/whatsapp/webhook", post(whatsapp_webhook))
        .route("/zendesk/webhook", post(zendesk_webhook))
        .with_state(state);

    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("gateway server exited");

    // Server may also stop on its own; make sure the runners see it.
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            log::warn!("relay task ended abnormally: {}", e);
        }
    }
    served?;
    log::info!("gateway stopped");
    Ok(())
}

async fn open_table<P>(data_dir: &Path, file: &str) -> Result<MemoryRelayStore<P>>
where
    P: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
{
    let path = data_dir.join(file);
    MemoryRelayStore::open(&path)
        .await
        .with_context(|| format!("opening relay table {}", path.display()))
}

/// Start the change-feed runner and lock sweeper for one direction, and kick every
/// contact that still has pending records from a previous run.
async fn start_direction<P, K>(
    trigger: &Arc<TriggerAdapter<P, K>>,
    store: &MemoryRelayStore<P>,
    config: &Config,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>>
where
    P: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    K: Sink<P> + 'static,
{
    let runner = Arc::clone(trigger).spawn(store.subscribe());
    let sweeper = LockSweeper::new(
        Arc::clone(trigger),
        config.relay.lock_lease(),
        config.relay.sweep_interval(),
    )
    .spawn(cancel.clone());

    let pending = match store.idle_pending_contacts(i64::MAX).await {
        Ok(p) => p,
        Err(e) => {
            log::warn!("{}: listing pending records failed: {}", trigger.engine().name(), e);
            Vec::new()
        }
    };
    if !pending.is_empty() {
        log::info!(
            "{}: resuming {} contact(s) with pending records",
            trigger.engine().name(),
            pending.len()
        );
    }
    for contact in pending {
        trigger.kick(contact);
    }
    vec![runner, sweeper]
}

/// Completes on SIGINT or SIGTERM, then cancels the relay runners.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = cancel.cancelled() => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, cancelling relay attempts");
    cancel.cancel();
}

/// GET / returns health JSON.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.port,
    }))
}

/// POST /whatsapp/webhook: store incoming messages; the change feed starts the relay.
async fn whatsapp_webhook(State(state): State<GatewayState>, body: Bytes) -> WebhookReply {
    let webhook: WhatsAppWebhook = match serde_json::from_slice(&body) {
        Ok(w) => w,
        Err(e) => {
            log::warn!("whatsapp webhook: invalid body: {}", e);
            return BAD_REQUEST;
        }
    };
    ingest_reply("whatsapp", ingest_whatsapp(&*state.chat_store, &webhook).await)
}

/// POST /zendesk/webhook: fetch the ticket's comments and store new agent comments.
async fn zendesk_webhook(State(state): State<GatewayState>, body: Bytes) -> WebhookReply {
    let webhook: ZendeskWebhook = match serde_json::from_slice(&body) {
        Ok(w) => w,
        Err(e) => {
            log::warn!("zendesk webhook: invalid body: {}", e);
            return BAD_REQUEST;
        }
    };
    let (Some(ticket_id), Some(contact_key)) = (webhook.ticket_id(), webhook.contact_key()) else {
        log::warn!("zendesk webhook: missing ticketId or requesterEmail");
        return BAD_REQUEST;
    };
    let comments = match state.zendesk.ticket_comments(ticket_id).await {
        Ok(c) => c,
        Err(e) => {
            log::error!("zendesk webhook: listing comments of ticket {}: {}", ticket_id, e);
            return INTERNAL_ERROR;
        }
    };
    ingest_reply(
        "zendesk",
        ingest_comments(&*state.comment_store, &contact_key, &comments).await,
    )
}

fn ingest_reply(source: &str, result: Result<IngestReport, IngestError>) -> WebhookReply {
    match result {
        Ok(report) if report.is_clean() => {
            log::debug!(
                "{} webhook: {} stored, {} duplicate(s)",
                source,
                report.stored.len(),
                report.duplicates.len()
            );
            OK
        }
        // Skipped messages do not fail the delivery; the rest is stored.
        Ok(report) => {
            for (id, reason) in &report.rejected {
                log::warn!("{} webhook: skipped {}: {}", source, id, reason);
            }
            log::info!(
                "{} webhook: {} stored, {} duplicate(s), {} skipped",
                source,
                report.stored.len(),
                report.duplicates.len(),
                report.rejected.len()
            );
            OK
        }
        Err(IngestError::Invalid(msg)) => {
            log::warn!("{} webhook: {}", source, msg);
            BAD_REQUEST
        }
        Err(IngestError::Store(e)) => {
            log::error!("{} webhook: storing records: {}", source, e);
            INTERNAL_ERROR
        }
    }
}
