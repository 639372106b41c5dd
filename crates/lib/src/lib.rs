//! Relay core library: an ordered, lock-coordinated message relay between a
//! WhatsApp channel and Zendesk tickets, used by the `relay` CLI.

pub mod channels;
pub mod config;
pub mod gateway;
pub mod ingest;
pub mod init;
pub mod record;
pub mod relay;
pub mod render;
pub mod retry;
pub mod sink;
pub mod store;
pub mod sweep;
pub mod trigger;
