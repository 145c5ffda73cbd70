//! Per-connection dispatch.
//!
//! Each authenticated connection gets exactly one framed request: list the
//! services, open a session to one of them, or become one. Every error here
//! is absorbed into a connection close; the dispatcher never panics and the
//! listener never notices.

use std::net::SocketAddr;

use drawbridge_core::frame::{Frame, ACK};
use drawbridge_core::{device_id_from_cert_der, DrawbridgeError, MAX_FRAME_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::events::Event;
use crate::registry::{ClientTlsStream, OutboundClaim, ServiceTarget};

use super::{dial, pump, Gateway};

impl Gateway {
    /// Drive one authenticated connection through the request state machine.
    pub(crate) async fn handle_connection(&self, mut conn: ClientTlsStream, peer: SocketAddr) {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = match conn.read(&mut buf).await {
            Ok(0) => {
                debug!(peer = %peer, "connection closed before first frame");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %peer, error = %e, "read failed before first frame");
                return;
            }
        };

        let frame = match Frame::parse(&buf[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %peer, error = %e, "malformed frame");
                return;
            }
        };

        let device_id = self.peer_device_id(&conn);
        let target = match &frame {
            Frame::Connect { service_id } => Some(*service_id),
            _ => None,
        };
        self.sink.record(Event::new(
            &device_id,
            peer.ip().to_string(),
            frame.kind(),
            target,
        ));

        match frame {
            Frame::ListServices => self.handle_list(conn, peer).await,
            Frame::Connect { service_id } => self.handle_connect(conn, peer, service_id).await,
            Frame::RegisterOutbound { name } => self.handle_outbound(conn, peer, &name).await,
        }
    }

    /// The device id travels in the peer leaf's Subject Serial Number; fall
    /// back to the allowlist record when a certificate omits it.
    fn peer_device_id(&self, conn: &ClientTlsStream) -> String {
        let (_, session) = conn.get_ref();
        let leaf = session
            .peer_certificates()
            .and_then(|certs| certs.first());
        let Some(leaf) = leaf else {
            return "unknown".to_string();
        };
        device_id_from_cert_der(leaf.as_ref())
            .or_else(|| {
                self.allowlist
                    .lookup_hash(&drawbridge_core::cert_hash_from_der(leaf.as_ref()))
                    .map(|record| record.device_id)
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn handle_list(&self, mut conn: ClientTlsStream, peer: SocketAddr) {
        let entries = self.registry.snapshot_for_listing().await;
        let reply = Frame::encode_list(entries.iter().map(|(id, name)| (*id, name.as_str())));
        if let Err(e) = conn.write_all(reply.as_bytes()).await {
            debug!(peer = %peer, error = %e, "failed to write service list");
        }
        let _ = conn.shutdown().await;
    }

    async fn handle_connect(&self, conn: ClientTlsStream, peer: SocketAddr, service_id: u16) {
        match self.registry.lookup(service_id).await {
            None => {
                info!(service_id, peer = %peer, "PS_CONN for unknown service");
            }
            Some(ServiceTarget::Configured { host, port }) => {
                match dial::dial_with_retries(&host, port).await {
                    Ok(target) => {
                        info!(service_id, peer = %peer, "proxy session started");
                        let (sent, received) = pump::run(conn, target).await;
                        debug!(service_id, peer = %peer, sent, received, "proxy session ended");
                    }
                    Err(DrawbridgeError::TargetUnreachable(addr)) => {
                        debug!(service_id, target = %addr, "closing client, target unreachable");
                    }
                    Err(e) => {
                        debug!(service_id, error = %e, "dial failed");
                    }
                }
            }
            Some(ServiceTarget::Outbound { claim_tx }) => {
                let claim = OutboundClaim {
                    client: conn,
                    client_peer: peer,
                };
                // Full means a session is already borrowing the control
                // connection; closed means it was just evicted. Either way
                // the client is hung up (the claim owns its stream).
                if let Err(e) = claim_tx.try_send(claim) {
                    info!(service_id, peer = %peer, reason = %e, "outbound service unavailable");
                }
            }
        }
    }

    async fn handle_outbound(&self, mut conn: ClientTlsStream, peer: SocketAddr, name: &str) {
        let (claim_tx, mut claim_rx) = tokio::sync::mpsc::channel::<OutboundClaim>(1);
        let Some(registration) = self.registry.register_outbound(name, claim_tx).await else {
            info!(name = %name, peer = %peer, "outbound id range exhausted");
            return;
        };

        if let Err(e) = conn.write_all(ACK).await {
            debug!(id = registration.id, error = %e, "failed to ack outbound registration");
            self.registry
                .remove_outbound_if_epoch(registration.id, registration.epoch)
                .await;
            return;
        }
        info!(id = registration.id, name = %name, peer = %peer, "outbound control connection held");

        // Own the control connection until a claim arrives or the Emissary
        // hangs up. Data before a claim is a protocol violation.
        let mut probe = [0u8; 1];
        let claimed = tokio::select! {
            claim = claim_rx.recv() => {
                // A dropped sender means the registry replaced this
                // registration with a fresh control connection.
                if claim.is_none() {
                    debug!(id = registration.id, "outbound registration superseded");
                }
                claim
            }
            read = conn.read(&mut probe) => {
                match read {
                    Ok(0) => debug!(id = registration.id, "outbound control connection closed"),
                    Ok(_) => debug!(id = registration.id, "unexpected data on idle control connection"),
                    Err(e) => debug!(id = registration.id, error = %e, "outbound control connection error"),
                }
                None
            }
        };

        if let Some(OutboundClaim { client, client_peer }) = claimed {
            info!(id = registration.id, client = %client_peer, "outbound session started");
            let (sent, received) = pump::run(conn, client).await;
            debug!(id = registration.id, sent, received, "outbound session ended");
        }

        self.registry
            .remove_outbound_if_epoch(registration.id, registration.epoch)
            .await;
    }
}
