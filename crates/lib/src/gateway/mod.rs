//! Gateway: HTTP server for health and inbound webhooks, hosting both relay directions.
//!
//! Single port. Webhooks only store records; relaying is driven by the stores'
//! change feeds so a slow destination never holds up a webhook reply.

mod server;

pub use server::run_gateway;
