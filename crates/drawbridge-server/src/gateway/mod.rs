//! The multiplexing TCP gateway.
//!
//! One TLS 1.3 listener fronts every Protected Service. Each accepted and
//! authenticated connection is handled by its own dispatcher task, which
//! reads a single framed request and either writes the service list,
//! proxies to a configured target, or registers the connection as an
//! outbound service.
//!
//! # Data flow
//!
//! ```text
//! accept → TLS handshake (allowlist verifier)
//!   → dispatcher: read ≤256 bytes, parse frame, record event
//!     → PS_LIST            write list, close
//!     → PS_CONN Configured dial (5 attempts, jittered backoff) → pump
//!     → PS_CONN Outbound   claim the control connection → owner pumps
//!     → OB_CR8T            register, ACK, own connection until claim/close
//! ```

pub mod dial;
pub mod dispatcher;
pub mod listener;
pub mod pump;

use std::sync::Arc;
use std::time::Duration;

use crate::ca::CertificateAllowlist;
use crate::events::EventSink;
use crate::registry::ServiceRegistry;

/// Shared state for the accept loop and its dispatcher tasks.
pub struct Gateway {
    registry: Arc<ServiceRegistry>,
    allowlist: Arc<CertificateAllowlist>,
    sink: EventSink,
    tls_config: Arc<rustls::ServerConfig>,
    grace: Duration,
}

impl Gateway {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        allowlist: Arc<CertificateAllowlist>,
        sink: EventSink,
        tls_config: Arc<rustls::ServerConfig>,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            allowlist,
            sink,
            tls_config,
            grace,
        }
    }
}
