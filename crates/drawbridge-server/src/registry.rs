//! Protected Service registry.
//!
//! Two indexed collections behind reader-preferring locks: services
//! configured through the admin plane, and services registered live over an
//! `OB_CR8T` control connection. Dispatcher lookups are the hot path and
//! copy the minimum out of the lock; nothing holds a lock across dial or
//! accept.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::repository::ServiceRecord;

/// Highest outbound service id; the wire id field is 3 decimal digits.
const OUTBOUND_ID_MAX: u16 = 999;

/// Lowest outbound service id. Ids below this belong to configured services.
const OUTBOUND_ID_MIN: u16 = 900;

/// A server-side authenticated Emissary connection.
pub type ClientTlsStream = tokio_rustls::server::TlsStream<TcpStream>;

/// Request handed to an outbound owner task: pump this client against the
/// control connection.
pub struct OutboundClaim {
    pub client: ClientTlsStream,
    pub client_peer: SocketAddr,
}

/// Issued to the owner task on registration; the epoch guards eviction so a
/// replaced registration can never remove its replacement.
#[derive(Debug, Clone, Copy)]
pub struct OutboundRegistration {
    pub id: u16,
    pub epoch: u64,
}

struct OutboundEntry {
    name: String,
    claim_tx: mpsc::Sender<OutboundClaim>,
    epoch: u64,
}

/// What a `PS_CONN` lookup resolves to.
pub enum ServiceTarget {
    Configured { host: String, port: u16 },
    Outbound { claim_tx: mpsc::Sender<OutboundClaim> },
}

/// Concurrent map of configured and outbound Protected Services.
#[derive(Default)]
pub struct ServiceRegistry {
    configured: RwLock<HashMap<u16, ServiceRecord>>,
    outbound: RwLock<HashMap<u16, OutboundEntry>>,
    next_epoch: AtomicU64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a configured service. `localhost` targets are
    /// normalized to the IPv4 loopback at admission time. An edit applies to
    /// subsequent `PS_CONN` frames only; running pumps are untouched.
    pub async fn add_configured(&self, mut service: ServiceRecord) {
        if service.host.eq_ignore_ascii_case("localhost") {
            service.host = "127.0.0.1".to_string();
        }
        info!(id = service.id, name = %service.name, host = %service.host, port = service.port, "configured service registered");
        self.configured.write().await.insert(service.id, service);
    }

    /// Remove a configured service. Effective for new `PS_CONN` frames
    /// immediately; existing pumps run to their natural end.
    pub async fn remove(&self, id: u16) {
        if self.configured.write().await.remove(&id).is_some() {
            info!(id, "configured service removed");
        }
    }

    /// Register an outbound service, allocating an id from the reserved
    /// descending range. Re-registering an existing name reuses its id and
    /// replaces the entry, which hangs up the previous control connection.
    /// Returns `None` when the reserved range is exhausted.
    pub async fn register_outbound(
        &self,
        name: &str,
        claim_tx: mpsc::Sender<OutboundClaim>,
    ) -> Option<OutboundRegistration> {
        let configured = self.configured.read().await;
        let mut outbound = self.outbound.write().await;

        let id = match outbound.iter().find(|(_, e)| e.name == name) {
            Some((&id, _)) => {
                debug!(id, name = %name, "outbound registration replaced");
                id
            }
            None => (OUTBOUND_ID_MIN..=OUTBOUND_ID_MAX)
                .rev()
                .find(|id| !outbound.contains_key(id) && !configured.contains_key(id))?,
        };

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        outbound.insert(
            id,
            OutboundEntry {
                name: name.to_string(),
                claim_tx,
                epoch,
            },
        );
        info!(id, name = %name, "outbound service registered");
        Some(OutboundRegistration { id, epoch })
    }

    /// Evict an outbound registration, but only if it is still the one the
    /// caller owns.
    pub async fn remove_outbound_if_epoch(&self, id: u16, epoch: u64) {
        let mut outbound = self.outbound.write().await;
        if outbound.get(&id).is_some_and(|e| e.epoch == epoch) {
            outbound.remove(&id);
            info!(id, "outbound service evicted");
        }
    }

    /// Resolve a service id for dispatch.
    pub async fn lookup(&self, id: u16) -> Option<ServiceTarget> {
        if let Some(service) = self.configured.read().await.get(&id) {
            return Some(ServiceTarget::Configured {
                host: service.host.clone(),
                port: service.port,
            });
        }
        self.outbound
            .read()
            .await
            .get(&id)
            .map(|entry| ServiceTarget::Outbound {
                claim_tx: entry.claim_tx.clone(),
            })
    }

    /// Ordered `(id, name)` snapshot for the `PS_LIST` reply: configured
    /// entries first (ascending id), then outbound entries (ascending id).
    pub async fn snapshot_for_listing(&self) -> Vec<(u16, String)> {
        let mut entries: Vec<(u16, String)> = {
            let configured = self.configured.read().await;
            let mut list: Vec<_> = configured
                .values()
                .map(|s| (s.id, s.name.clone()))
                .collect();
            list.sort_by_key(|(id, _)| *id);
            list
        };

        let outbound = self.outbound.read().await;
        let mut live: Vec<_> = outbound
            .iter()
            .map(|(&id, e)| (id, e.name.clone()))
            .collect();
        live.sort_by_key(|(id, _)| *id);
        entries.extend(live);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: u16, name: &str, host: &str, port: u16) -> ServiceRecord {
        ServiceRecord {
            id,
            name: name.into(),
            description: String::new(),
            host: host.into(),
            port,
        }
    }

    /// Keeps claim receivers alive so registered senders stay open.
    struct ClaimEnds {
        _receivers: Vec<mpsc::Receiver<OutboundClaim>>,
    }

    impl ClaimEnds {
        fn new() -> Self {
            Self {
                _receivers: Vec::new(),
            }
        }

        fn tx(&mut self) -> mpsc::Sender<OutboundClaim> {
            let (tx, rx) = mpsc::channel(1);
            self._receivers.push(rx);
            tx
        }
    }

    #[tokio::test]
    async fn localhost_is_normalized_on_admission() {
        let registry = ServiceRegistry::new();
        registry.add_configured(service(1, "web", "localhost", 8001)).await;
        match registry.lookup(1).await.unwrap() {
            ServiceTarget::Configured { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 8001);
            }
            _ => panic!("expected configured target"),
        }
    }

    #[tokio::test]
    async fn listing_orders_configured_before_outbound() {
        let registry = ServiceRegistry::new();
        let mut ends = ClaimEnds::new();
        registry.add_configured(service(2, "db", "127.0.0.1", 8002)).await;
        registry.add_configured(service(1, "web", "127.0.0.1", 8001)).await;
        registry.register_outbound("mc", ends.tx()).await.unwrap();
        registry.register_outbound("ssh", ends.tx()).await.unwrap();

        let listing = registry.snapshot_for_listing().await;
        let ids: Vec<u16> = listing.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 998, 999]);
        assert_eq!(listing[0].1, "web");
        assert_eq!(listing[2].1, "ssh");
        assert_eq!(listing[3].1, "mc");
    }

    #[tokio::test]
    async fn outbound_ids_descend_from_the_top_of_the_range() {
        let registry = ServiceRegistry::new();
        let mut ends = ClaimEnds::new();
        let first = registry.register_outbound("a", ends.tx()).await.unwrap();
        let second = registry.register_outbound("b", ends.tx()).await.unwrap();
        assert_eq!(first.id, 999);
        assert_eq!(second.id, 998);
    }

    #[tokio::test]
    async fn reregistration_reuses_the_id_and_bumps_the_epoch() {
        let registry = ServiceRegistry::new();
        let mut ends = ClaimEnds::new();
        let first = registry.register_outbound("mc", ends.tx()).await.unwrap();
        let second = registry.register_outbound("mc", ends.tx()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_ne!(first.epoch, second.epoch);

        // The stale epoch must not evict the replacement.
        registry.remove_outbound_if_epoch(first.id, first.epoch).await;
        assert!(registry.lookup(first.id).await.is_some());

        registry.remove_outbound_if_epoch(second.id, second.epoch).await;
        assert!(registry.lookup(second.id).await.is_none());
    }

    #[tokio::test]
    async fn outbound_range_exhaustion_returns_none() {
        let registry = ServiceRegistry::new();
        let mut ends = ClaimEnds::new();
        for i in 0..(OUTBOUND_ID_MAX - OUTBOUND_ID_MIN + 1) {
            assert!(registry
                .register_outbound(&format!("svc-{i}"), ends.tx())
                .await
                .is_some());
        }
        assert!(registry
            .register_outbound("one-too-many", ends.tx())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn outbound_allocation_skips_configured_ids() {
        let registry = ServiceRegistry::new();
        let mut ends = ClaimEnds::new();
        registry.add_configured(service(999, "pinned", "127.0.0.1", 1)).await;
        let reg = registry.register_outbound("mc", ends.tx()).await.unwrap();
        assert_eq!(reg.id, 998);
    }

    #[tokio::test]
    async fn remove_applies_to_new_lookups() {
        let registry = ServiceRegistry::new();
        registry.add_configured(service(1, "web", "127.0.0.1", 8001)).await;
        registry.remove(1).await;
        assert!(registry.lookup(1).await.is_none());
    }
}
