//! drawbridge-server: the gateway core behind the `drawbridge` binary.
//!
//! Hosts the embedded Certificate Authority and device allowlist, the
//! Protected Service registry, the TLS 1.3 gateway listener with its
//! per-connection dispatchers, the event log sink, and the repository
//! interface the admin plane shares with the gateway.

pub mod ca;
pub mod config;
pub mod events;
pub mod gateway;
pub mod registry;
pub mod repository;
