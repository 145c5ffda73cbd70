//! Gateway accept loop.
//!
//! Spawns one dispatcher task per accepted connection. Individual accept
//! and handshake errors are survived; only the shutdown signal ends the
//! loop, after which outstanding dispatchers get a bounded grace window.

use drawbridge_core::DrawbridgeResult;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::Gateway;

impl Gateway {
    /// Accept connections until the shutdown signal fires, then drain.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> DrawbridgeResult<()> {
        let acceptor = TlsAcceptor::from(self.tls_config.clone());
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!(addr = %listener.local_addr()?, "gateway listening");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, draining connections");
                    break;
                }
                // Reap finished dispatchers so the set stays small.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let acceptor = acceptor.clone();
                            let gateway = self.clone();
                            tasks.spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(conn) => gateway.handle_connection(conn, peer).await,
                                    // Scanner noise: no event, no error-level log.
                                    Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        drop(listener);

        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            if tasks.is_empty() {
                break;
            }
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = tasks.len(), "grace window elapsed, aborting connections");
                    tasks.shutdown().await;
                    break;
                }
            }
        }

        info!("gateway stopped");
        Ok(())
    }
}
