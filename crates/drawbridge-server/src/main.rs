//! drawbridge-server: self-hosted mTLS gateway for private TCP services.
//!
//! Materializes the embedded Certificate Authority, hydrates the device
//! allowlist from the store, and serves the Emissary wire protocol over a
//! single TLS 1.3 listener.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use drawbridge_server::ca::{self, CertificateAllowlist, CertificateAuthority, Platform};
use drawbridge_server::config;
use drawbridge_server::events::{self, EventSink};
use drawbridge_server::gateway::Gateway;
use drawbridge_server::registry::ServiceRegistry;
use drawbridge_server::repository::{Repository, SqliteRepository};

/// drawbridge — mTLS gateway fronting private TCP services
#[derive(Parser, Debug)]
#[command(name = "drawbridge", version, about = "Self-hosted mTLS gateway")]
struct Cli {
    /// Directory holding CA materials (under <data-dir>/ca/)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// SQLite database path (defaults to <data-dir>/drawbridge.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Gateway port; the listener binds 0.0.0.0
    #[arg(short, long, default_value_t = 3100)]
    gateway_port: u16,

    /// Store this listening address before starting. Plays the role of the
    /// admin channel; the value feeds certificate SAN selection only.
    #[arg(long)]
    listening_address: Option<String>,

    /// Seconds to wait for connections and queued events on shutdown
    #[arg(long, default_value_t = 10)]
    grace_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mint a new Emissary device and write its credential PEMs
    IssueDevice {
        /// Client platform (linux, macos, windows, android)
        #[arg(long, default_value = "linux")]
        platform: String,

        /// Directory to write the credential files into
        #[arg(long, default_value = "emissary-credentials")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("drawbridge.db"));
    let repo: Arc<dyn Repository> = match SqliteRepository::open(&db_path) {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            error!(path = %db_path.display(), error = %e, "failed to open store");
            std::process::exit(1);
        }
    };

    if let Some(address) = &cli.listening_address {
        if let Err(e) = config::set_listening_address(repo.as_ref(), address) {
            error!(error = %e, "failed to store listening address");
            std::process::exit(1);
        }
    }

    let listening_address = match config::listening_address(repo.as_ref()) {
        Ok(Some(address)) => address,
        Ok(None) => {
            error!("no listening address configured; run once with --listening-address <host-or-ip>");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "failed to read listening address");
            std::process::exit(1);
        }
    };

    let allowlist = Arc::new(CertificateAllowlist::new());
    let certificate_authority = match CertificateAuthority::materialize(
        &cli.data_dir,
        &listening_address,
        allowlist.clone(),
    ) {
        Ok(ca) => ca,
        Err(e) => {
            error!(error = %e, "failed to materialize certificate authority");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Command::IssueDevice { platform, out_dir }) => {
            issue_device(&certificate_authority, repo.as_ref(), &platform, &out_dir);
        }
        None => serve(cli, repo, allowlist, certificate_authority).await,
    }
}

/// Mint a device credential and stage it for bundling, the way the admin
/// dashboard's download flow would.
fn issue_device(
    certificate_authority: &CertificateAuthority,
    repo: &dyn Repository,
    platform: &str,
    out_dir: &Path,
) {
    let platform: Platform = match platform.parse() {
        Ok(platform) => platform,
        Err(e) => {
            error!(error = %e, "invalid platform");
            std::process::exit(1);
        }
    };

    let (device, credential) = match certificate_authority.issue_device(repo, platform) {
        Ok(issued) => issued,
        Err(e) => {
            error!(error = %e, "failed to issue device credential");
            std::process::exit(1);
        }
    };

    let write = || -> std::io::Result<()> {
        std::fs::create_dir_all(out_dir)?;
        std::fs::write(out_dir.join("emissary-mtls-tcp.crt"), &credential.cert_pem)?;
        std::fs::write(out_dir.join("emissary-mtls-tcp.key"), &credential.key_pem)?;
        std::fs::write(
            out_dir.join("ca.crt"),
            certificate_authority.root_cert_pem(),
        )?;
        Ok(())
    };
    if let Err(e) = write() {
        error!(error = %e, "failed to write credential files");
        std::process::exit(1);
    }

    info!(
        device_id = %device.id,
        name = %device.name,
        dir = %out_dir.display(),
        "issued device credential"
    );
}

async fn serve(
    cli: Cli,
    repo: Arc<dyn Repository>,
    allowlist: Arc<CertificateAllowlist>,
    certificate_authority: CertificateAuthority,
) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cli.gateway_port,
        "starting drawbridge"
    );

    if let Err(e) = ca::hydrate_allowlist(repo.as_ref(), &allowlist) {
        error!(error = %e, "failed to hydrate certificate allowlist");
        std::process::exit(1);
    }

    let registry = Arc::new(ServiceRegistry::new());
    match repo.list_services() {
        Ok(services) => {
            for service in services {
                registry.add_configured(service).await;
            }
        }
        Err(e) => {
            error!(error = %e, "failed to load configured services");
            std::process::exit(1);
        }
    }

    let tls_config = match certificate_authority.server_tls_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to build server TLS config");
            std::process::exit(1);
        }
    };

    let grace = Duration::from_secs(cli.grace_secs);
    let (sink, sink_handle) = EventSink::spawn(repo.clone());
    let gateway = Arc::new(Gateway::new(
        registry,
        allowlist,
        sink.clone(),
        tls_config,
        grace,
    ));

    let listener = match TcpListener::bind(("0.0.0.0", cli.gateway_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = cli.gateway_port, error = %e, "failed to bind gateway");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut server = tokio::spawn(gateway.run(listener, shutdown_rx));

    let server_result = tokio::select! {
        result = &mut server => Some(result),
        _ = shutdown_signal() => None,
    };
    match server_result {
        Some(Ok(Ok(()))) => info!("gateway exited"),
        Some(Ok(Err(e))) => {
            error!(error = %e, "gateway error");
            std::process::exit(1);
        }
        Some(Err(e)) => {
            error!(error = %e, "gateway task failed");
            std::process::exit(1);
        }
        None => {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(());
            if let Err(e) = server.await {
                error!(error = %e, "gateway task failed during drain");
            }
        }
    }

    // Flush queued events within the same grace window, then drop the rest.
    drop(sink);
    events::flush(sink_handle, grace).await;

    info!("drawbridge stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
