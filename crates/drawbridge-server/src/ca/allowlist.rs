//! In-memory certificate allowlist.
//!
//! Maps the hex SHA-256 of an issued certificate's canonical PEM to the
//! owning device and its revocation flag. Handshakes take reader locks;
//! admin revoke/unrevoke and startup rehydration take writer locks. This is
//! a `std` lock, not a tokio one, because the verifier runs inside rustls's
//! synchronous callback; no critical section crosses I/O.

use std::collections::HashMap;
use std::sync::RwLock;

use drawbridge_core::cert_hash_from_pem;
use tracing::warn;

/// Allowlist entry for one issued device certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCertRecord {
    pub device_id: String,
    pub revoked: bool,
}

/// The handshake-time source of truth for device admission.
#[derive(Debug, Default)]
pub struct CertificateAllowlist {
    entries: RwLock<HashMap<String, DeviceCertRecord>>,
}

impl CertificateAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry under its certificate hash.
    pub fn insert(&self, hash: String, record: DeviceCertRecord) {
        self.entries.write().unwrap().insert(hash, record);
    }

    /// Look up by certificate hash.
    pub fn lookup_hash(&self, hash: &str) -> Option<DeviceCertRecord> {
        self.entries.read().unwrap().get(hash).cloned()
    }

    /// Look up by certificate PEM (hashes, then reads).
    pub fn lookup_pem(&self, pem: &str) -> Option<DeviceCertRecord> {
        self.lookup_hash(&cert_hash_from_pem(pem))
    }

    /// Flip the revocation flag for a known certificate.
    ///
    /// Unknown hashes are a warning and a no-op; entries are only ever
    /// created through issuance or rehydration.
    pub fn set_revoked(&self, hash: &str, revoked: bool) {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(hash) {
            Some(record) => record.revoked = revoked,
            None => warn!(hash = %hash, "cannot change revocation of unknown certificate"),
        }
    }

    /// Replace the entire contents, used once at startup from the store.
    pub fn rehydrate<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, DeviceCertRecord)>,
    {
        let mut map = self.entries.write().unwrap();
        map.clear();
        map.extend(entries);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(device: &str) -> DeviceCertRecord {
        DeviceCertRecord {
            device_id: device.into(),
            revoked: false,
        }
    }

    #[test]
    fn insert_and_lookup() {
        let list = CertificateAllowlist::new();
        list.insert("abc".into(), record("dev-1"));
        assert_eq!(list.lookup_hash("abc").unwrap().device_id, "dev-1");
        assert_eq!(list.lookup_hash("missing"), None);
    }

    #[test]
    fn lookup_by_pem_hashes_first() {
        let list = CertificateAllowlist::new();
        let pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        list.insert(cert_hash_from_pem(pem), record("dev-1"));
        assert!(list.lookup_pem(pem).is_some());
    }

    #[test]
    fn revoke_and_unrevoke() {
        let list = CertificateAllowlist::new();
        list.insert("abc".into(), record("dev-1"));

        list.set_revoked("abc", true);
        assert!(list.lookup_hash("abc").unwrap().revoked);

        list.set_revoked("abc", false);
        assert!(!list.lookup_hash("abc").unwrap().revoked);
    }

    #[test]
    fn revoking_unknown_hash_creates_nothing() {
        let list = CertificateAllowlist::new();
        list.set_revoked("ghost", true);
        assert!(list.is_empty());
    }

    #[test]
    fn rehydrate_replaces_contents() {
        let list = CertificateAllowlist::new();
        list.insert("old".into(), record("dev-old"));
        list.rehydrate([
            ("a".to_string(), record("dev-a")),
            ("b".to_string(), record("dev-b")),
        ]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.lookup_hash("old"), None);
    }
}
