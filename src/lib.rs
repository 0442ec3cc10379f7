//! dnsctx - a plugin-pipeline DNS server built around a per-query context

pub mod cancel;
pub mod config;
pub mod context;
pub mod dns_server;
pub mod plugin;
pub mod types;
