//! Certificate Authority, allowlist, and handshake verifier.
//!
//! The CA roots the gateway's entire mTLS trust: it materializes the root
//! and server keypairs (generating on first run, loading thereafter), mints
//! per-device client certificates, and builds the rustls configurations.
//! The allowlist is the sole source of truth at handshake time; the
//! verifier consults it on every accept in addition to webpki chain
//! verification against the root.

mod allowlist;
mod authority;
mod verifier;

pub use allowlist::{CertificateAllowlist, DeviceCertRecord};
pub use authority::{CertificateAuthority, IssuedCredential, Platform};
pub use verifier::EmissaryClientVerifier;

use drawbridge_core::{cert_hash_from_pem, DrawbridgeResult};
use tracing::info;

use crate::repository::Repository;

/// Replace the allowlist contents from the store. Called once at startup;
/// a store failure here is fatal for the process.
pub fn hydrate_allowlist(
    repo: &dyn Repository,
    allowlist: &CertificateAllowlist,
) -> DrawbridgeResult<usize> {
    let certs = repo.list_device_certs()?;
    let count = certs.len();
    allowlist.rehydrate(certs.into_iter().map(|cert| {
        (
            cert_hash_from_pem(&cert.certificate_pem),
            DeviceCertRecord {
                device_id: cert.device_id,
                revoked: cert.revoked,
            },
        )
    }));
    info!(devices = count, "hydrated certificate allowlist");
    Ok(count)
}
