//! Handshake-time client certificate verification.
//!
//! Runs inside rustls during every accept: webpki verifies the chain
//! against the gateway root, then the leaf is canonically PEM-encoded,
//! hashed, and looked up in the allowlist. Both checks must pass. The hook
//! performs no I/O and never mutates the allowlist.

use std::sync::Arc;

use drawbridge_core::cert_hash_from_der;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use tracing::debug;

use super::allowlist::CertificateAllowlist;

/// Client-cert verifier that layers the allowlist over webpki chain checks.
#[derive(Debug)]
pub struct EmissaryClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    allowlist: Arc<CertificateAllowlist>,
}

impl EmissaryClientVerifier {
    /// Build a verifier trusting `roots` for chain verification.
    pub fn new(
        roots: RootCertStore,
        allowlist: Arc<CertificateAllowlist>,
    ) -> Result<Arc<Self>, TlsError> {
        let inner = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::General(e.to_string()))?;
        Ok(Arc::new(Self { inner, allowlist }))
    }

    fn check_allowlist(&self, end_entity: &CertificateDer<'_>) -> Result<(), TlsError> {
        let hash = cert_hash_from_der(end_entity.as_ref());
        match self.allowlist.lookup_hash(&hash) {
            None => {
                debug!(hash = %hash, "unknown certificate presented");
                Err(TlsError::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
            Some(record) if record.revoked => {
                debug!(hash = %hash, device_id = %record.device_id, "revoked certificate presented");
                Err(TlsError::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
            Some(_) => Ok(()),
        }
    }
}

impl ClientCertVerifier for EmissaryClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        let verified = self
            .inner
            .verify_client_cert(end_entity, intermediates, now)?;
        self.check_allowlist(end_entity)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::allowlist::DeviceCertRecord;

    fn test_verifier() -> (Arc<EmissaryClientVerifier>, Arc<CertificateAllowlist>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = params.self_signed(&key).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(ca.der().clone()).unwrap();

        let allowlist = Arc::new(CertificateAllowlist::new());
        let verifier = EmissaryClientVerifier::new(roots, allowlist.clone()).unwrap();
        (verifier, allowlist)
    }

    #[test]
    fn allowlist_gate_rejects_unknown_and_revoked() {
        let (verifier, allowlist) = test_verifier();
        let der = CertificateDer::from(vec![0x30u8, 0x03, 0x02, 0x01, 0x01]);
        let hash = cert_hash_from_der(der.as_ref());

        // Unknown hash.
        assert!(verifier.check_allowlist(&der).is_err());

        // Known, not revoked.
        allowlist.insert(
            hash.clone(),
            DeviceCertRecord {
                device_id: "dev-1".into(),
                revoked: false,
            },
        );
        assert!(verifier.check_allowlist(&der).is_ok());

        // Revoked, then admitted again after unrevoke.
        allowlist.set_revoked(&hash, true);
        assert!(verifier.check_allowlist(&der).is_err());
        allowlist.set_revoked(&hash, false);
        assert!(verifier.check_allowlist(&der).is_ok());
    }

    #[test]
    fn client_auth_is_mandatory() {
        let (verifier, _) = test_verifier();
        assert!(verifier.client_auth_mandatory());
        assert!(verifier.offer_client_auth());
    }
}
