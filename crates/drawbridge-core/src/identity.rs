//! Canonical certificate identity.
//!
//! The allowlist is keyed by the SHA-256 of a certificate's PEM encoding, so
//! the PEM produced at issuance and the PEM reconstructed from the DER the
//! TLS stack hands the verifier must match bit-for-bit. Every hash in the
//! process goes through [`cert_pem_from_der`]; no other encoder output is
//! ever hashed.

use pem::{EncodeConfig, LineEnding, Pem};
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

/// OID of the Subject Serial Number DN attribute carrying the device id.
const OID_SUBJECT_SERIAL_NUMBER: &str = "2.5.4.5";

/// Canonically PEM-encode a DER certificate (64-column base64, LF endings).
pub fn cert_pem_from_der(der: &[u8]) -> String {
    let block = Pem::new("CERTIFICATE", der.to_vec());
    pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Hex-encoded SHA-256 over a certificate PEM.
pub fn cert_hash_from_pem(pem: &str) -> String {
    hex::encode(Sha256::digest(pem.as_bytes()))
}

/// Hex-encoded SHA-256 over the canonical PEM encoding of a DER certificate.
pub fn cert_hash_from_der(der: &[u8]) -> String {
    cert_hash_from_pem(&cert_pem_from_der(der))
}

/// Extract the device id from a client certificate's Subject Serial Number
/// field. Returns `None` when the certificate does not parse or carries no
/// such attribute.
pub fn device_id_from_cert_der(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let result = cert
        .subject()
        .iter_attributes()
        .find(|attr| attr.attr_type().to_id_string() == OID_SUBJECT_SERIAL_NUMBER)
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_encoding_is_canonical() {
        let der = b"not-really-der-but-bytes-are-bytes".to_vec();
        let pem = cert_pem_from_der(&der);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        assert!(!pem.contains('\r'));
    }

    #[test]
    fn hash_is_stable_across_paths() {
        let der = vec![0x30, 0x82, 0x01, 0x0a, 0xde, 0xad, 0xbe, 0xef];
        let pem = cert_pem_from_der(&der);
        assert_eq!(cert_hash_from_der(&der), cert_hash_from_pem(&pem));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let hash = cert_hash_from_der(b"x");
        assert_eq!(hash.len(), 64);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_certs_hash_differently() {
        assert_ne!(cert_hash_from_der(b"a"), cert_hash_from_der(b"b"));
    }

    #[test]
    fn device_id_absent_from_garbage() {
        assert_eq!(device_id_from_cert_der(b"garbage"), None);
    }
}
