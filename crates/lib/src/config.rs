//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.relay/config.json`) and environment.
//! Secrets (WhatsApp password, Zendesk token) can be left out of the file and set via env.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Where relay tables are persisted.
    #[serde(default)]
    pub store: StoreConfig,

    /// Lock lease, sweep interval and retry policy.
    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub whatsapp: WhatsAppConfig,

    #[serde(default)]
    pub zendesk: ZendeskConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the webhook and health routes (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Data directory. Relative paths are resolved against the config file's parent.
    /// Default: `data` next to the config file.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// A lock older than this is considered abandoned and released by the sweep.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,

    /// How often the sweep looks for expired locks.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Per-request timeout for WhatsApp and Zendesk calls. Capped at half the lock
    /// lease so a hung call cannot outlive the lock it runs under.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_lock_lease_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            lock_lease_secs: default_lock_lease_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs.max(1))
    }

    /// Never zero; `tokio::time::interval` panics on a zero period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        let cap = (self.lock_lease() / 2).max(Duration::from_secs(1));
        Duration::from_secs(self.request_timeout_secs.max(1)).min(cap)
    }
}

/// WhatsApp Business API settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppConfig {
    /// e.g. "https://whatsapp.internal:9090".
    #[serde(default)]
    pub base_url: String,
    pub user: Option<String>,
    /// Overridden by WHATSAPP_PASSWORD env when set.
    pub password: Option<String>,
    /// On-premises deployments commonly run with a self-signed certificate.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Zendesk Support API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZendeskConfig {
    /// e.g. "https://acme.zendesk.com".
    #[serde(default)]
    pub base_url: String,
    /// Agent email used with API token auth.
    pub user: Option<String>,
    /// Overridden by ZENDESK_TOKEN env when set.
    pub token: Option<String>,
    /// Requesters are created as `<contactKey>@<requesterDomain>`.
    #[serde(default = "default_requester_domain")]
    pub requester_domain: String,
}

fn default_requester_domain() -> String {
    "whatsapp.invalid".to_string()
}

impl Default for ZendeskConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user: None,
            token: None,
            requester_domain: default_requester_domain(),
        }
    }
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the WhatsApp password: env WHATSAPP_PASSWORD overrides config.
pub fn resolve_whatsapp_password(config: &Config) -> Option<String> {
    env_secret("WHATSAPP_PASSWORD").or_else(|| non_empty(config.whatsapp.password.as_ref()))
}

/// Resolve the Zendesk API token: env ZENDESK_TOKEN overrides config.
pub fn resolve_zendesk_token(config: &Config) -> Option<String> {
    env_secret("ZENDESK_TOKEN").or_else(|| non_empty(config.zendesk.token.as_ref()))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".relay").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or RELAY_CONFIG_PATH).
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve the data directory: `config.store.directory` if set (relative paths resolved
/// against the config file's parent), otherwise `data` next to the config file.
pub fn resolve_store_dir(config: &Config, config_path: &Path) -> PathBuf {
    let parent = config_parent(config_path);
    match &config.store.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                parent.join(d)
            }
        }
        _ => parent.join("data"),
    }
}
