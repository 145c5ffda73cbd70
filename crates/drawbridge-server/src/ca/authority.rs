//! Certificate Authority creation, persistence, and client cert issuance.
//!
//! Materializes an ECDSA P-384 root plus a server leaf under `<base>/ca/`,
//! generating on first run and reloading on subsequent starts, and mints
//! 10-year client certificates whose Subject Serial Number carries the
//! device id. The root key never leaves the process after load.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};
use std::path::Path;
use std::sync::Arc;

use drawbridge_core::{cert_hash_from_pem, cert_pem_from_der, DrawbridgeError, DrawbridgeResult};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P384_SHA384,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::{debug, info};
use uuid::Uuid;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::repository::{DeviceRecord, Repository};

use super::allowlist::{CertificateAllowlist, DeviceCertRecord};
use super::verifier::EmissaryClientVerifier;

const CA_DIR_NAME: &str = "ca";
const CA_CERT_FILENAME: &str = "ca.crt";
const CA_KEY_FILENAME: &str = "ca.key";
const SERVER_CERT_FILENAME: &str = "server-cert.crt";
const SERVER_KEY_FILENAME: &str = "server-key.key";

/// Root and issued certificates are valid for ten years.
const VALIDITY_DAYS: i64 = 3650;

/// OID of the Subject Serial Number DN attribute.
const SUBJECT_SERIAL_NUMBER_OID: &[u64] = &[2, 5, 4, 5];

/// Client platform tag; selects the private key encoding of an issued
/// credential. Android key stores want PKCS#8, everything else takes SEC1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Android,
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    fn uses_pkcs8(self) -> bool {
        matches!(self, Platform::Android)
    }
}

impl std::str::FromStr for Platform {
    type Err = DrawbridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "linux" => Ok(Platform::Linux),
            "macos" | "darwin" => Ok(Platform::MacOs),
            "windows" => Ok(Platform::Windows),
            other => Err(DrawbridgeError::Config(format!(
                "unknown platform {other:?}"
            ))),
        }
    }
}

/// PEM pair returned to the bundle packager for one issued device.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The gateway's embedded Certificate Authority. Immutable after
/// [`CertificateAuthority::materialize`]; share via `Arc`.
pub struct CertificateAuthority {
    listening_address: String,
    issuer_cert: rcgen::Certificate,
    issuer_key: KeyPair,
    root_cert_pem: String,
    root_cert_der: CertificateDer<'static>,
    server_cert_pem: String,
    server_key_pem: String,
    allowlist: Arc<CertificateAllowlist>,
}

impl CertificateAuthority {
    /// Load CA materials from `<base_dir>/ca/`, generating them on first
    /// run. Any failure here is fatal for the process: the gateway must not
    /// accept mTLS traffic without a CA.
    pub fn materialize(
        base_dir: &Path,
        listening_address: &str,
        allowlist: Arc<CertificateAllowlist>,
    ) -> DrawbridgeResult<Self> {
        let dir = base_dir.join(CA_DIR_NAME);
        let ca_cert_path = dir.join(CA_CERT_FILENAME);
        let ca_key_path = dir.join(CA_KEY_FILENAME);
        let server_cert_path = dir.join(SERVER_CERT_FILENAME);
        let server_key_path = dir.join(SERVER_KEY_FILENAME);

        let all_present = [
            &ca_cert_path,
            &ca_key_path,
            &server_cert_path,
            &server_key_path,
        ]
        .iter()
        .all(|p| p.exists());

        if all_present {
            info!(dir = %dir.display(), "loading existing CA materials");
            Self::load(
                listening_address,
                &ca_cert_path,
                &ca_key_path,
                &server_cert_path,
                &server_key_path,
                allowlist,
            )
        } else {
            info!(dir = %dir.display(), "generating CA materials");
            Self::generate(listening_address, &dir, allowlist)
        }
    }

    fn generate(
        listening_address: &str,
        dir: &Path,
        allowlist: Arc<CertificateAllowlist>,
    ) -> DrawbridgeResult<Self> {
        let (dns_sans, ip_sans) = san_sets(listening_address);
        debug!(dns = ?dns_sans, ips = ?ip_sans, "certificate SAN set");

        let issuer_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).map_err(crypto_err)?;
        let mut root_params = CertificateParams::default();
        apply_sans(&mut root_params, &dns_sans, &ip_sans)?;
        root_params
            .distinguished_name
            .push(DnType::CommonName, "Drawbridge Gateway CA");
        root_params
            .distinguished_name
            .push(DnType::OrganizationName, "Drawbridge");
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];
        root_params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        root_params.serial_number = Some(random_serial());
        set_validity(&mut root_params);
        let issuer_cert = root_params.self_signed(&issuer_key).map_err(crypto_err)?;

        let server_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).map_err(crypto_err)?;
        let mut server_params = CertificateParams::default();
        apply_sans(&mut server_params, &dns_sans, &ip_sans)?;
        server_params
            .distinguished_name
            .push(DnType::CommonName, listening_address);
        server_params
            .distinguished_name
            .push(DnType::OrganizationName, "Drawbridge");
        server_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        server_params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        // Serial numbers are drawn independently for root and server leaf.
        server_params.serial_number = Some(random_serial());
        set_validity(&mut server_params);
        let server_cert = server_params
            .signed_by(&server_key, &issuer_cert, &issuer_key)
            .map_err(crypto_err)?;

        let root_cert_pem = cert_pem_from_der(issuer_cert.der());
        let server_cert_pem = cert_pem_from_der(server_cert.der());
        let server_key_pem = server_key.serialize_pem();

        fs::create_dir_all(dir)?;
        fs::write(dir.join(CA_CERT_FILENAME), &root_cert_pem)?;
        write_key_file(&dir.join(CA_KEY_FILENAME), &issuer_key.serialize_pem())?;
        fs::write(dir.join(SERVER_CERT_FILENAME), &server_cert_pem)?;
        write_key_file(&dir.join(SERVER_KEY_FILENAME), &server_key_pem)?;

        let root_cert_der = issuer_cert.der().clone();

        Ok(Self {
            listening_address: listening_address.to_string(),
            issuer_cert,
            issuer_key,
            root_cert_pem,
            root_cert_der,
            server_cert_pem,
            server_key_pem,
            allowlist,
        })
    }

    fn load(
        listening_address: &str,
        ca_cert_path: &Path,
        ca_key_path: &Path,
        server_cert_path: &Path,
        server_key_path: &Path,
        allowlist: Arc<CertificateAllowlist>,
    ) -> DrawbridgeResult<Self> {
        let root_cert_pem = fs::read_to_string(ca_cert_path)?;
        let root_key_pem = fs::read_to_string(ca_key_path)?;
        let server_cert_pem = fs::read_to_string(server_cert_path)?;
        let server_key_pem = fs::read_to_string(server_key_path)?;

        let issuer_key = KeyPair::from_pem(&root_key_pem).map_err(crypto_err)?;
        verify_pair(&root_cert_pem, &issuer_key)?;

        let server_key = KeyPair::from_pem(&server_key_pem).map_err(crypto_err)?;
        verify_pair(&server_cert_pem, &server_key)?;

        // Rebuild the issuing certificate for use as the rcgen signer. The
        // issued chain stays valid against the on-disk root because issuer
        // DN and key are identical.
        let issuer_params =
            CertificateParams::from_ca_cert_pem(&root_cert_pem).map_err(crypto_err)?;
        let issuer_cert = issuer_params.self_signed(&issuer_key).map_err(crypto_err)?;

        let root_block = pem::parse(&root_cert_pem)
            .map_err(|e| DrawbridgeError::Crypto(format!("corrupt CA certificate: {e}")))?;
        let root_cert_der = CertificateDer::from(root_block.contents().to_vec());

        Ok(Self {
            listening_address: listening_address.to_string(),
            issuer_cert,
            issuer_key,
            root_cert_pem,
            root_cert_der,
            server_cert_pem,
            server_key_pem,
            allowlist,
        })
    }

    /// Issue a client certificate for `device_id`.
    ///
    /// On success the allowlist gains `{hash → {device_id, revoked: 0}}`;
    /// on any failure the allowlist is untouched.
    pub fn issue_client_cert(
        &self,
        device_id: &str,
        platform: Platform,
    ) -> DrawbridgeResult<IssuedCredential> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).map_err(crypto_err)?;

        let mut params = CertificateParams::default();
        apply_sans(&mut params, &[self.listening_address.clone()], &[])?;
        params
            .distinguished_name
            .push(DnType::CommonName, &self.listening_address);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Drawbridge");
        params.distinguished_name.push(
            DnType::from_oid(SUBJECT_SERIAL_NUMBER_OID),
            device_id,
        );
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.serial_number = Some(random_serial());
        set_validity(&mut params);

        let cert = params
            .signed_by(&key, &self.issuer_cert, &self.issuer_key)
            .map_err(crypto_err)?;

        let cert_pem = cert_pem_from_der(cert.der());
        let key_pem = if platform.uses_pkcs8() {
            key.serialize_pem()
        } else {
            sec1_key_pem(&key.serialize_pem())?
        };

        let hash = cert_hash_from_pem(&cert_pem);
        self.allowlist.insert(
            hash,
            DeviceCertRecord {
                device_id: device_id.to_string(),
                revoked: false,
            },
        );
        info!(device_id = %device_id, platform = ?platform, "issued client certificate");

        Ok(IssuedCredential { cert_pem, key_pem })
    }

    /// Bundle hook: mint a new device (UUID id, adjective-animal name),
    /// issue its credential, and persist the device record. Name collisions
    /// are arbitrated by the store's UNIQUE constraint and retried.
    pub fn issue_device(
        &self,
        repo: &dyn Repository,
        platform: Platform,
    ) -> DrawbridgeResult<(DeviceRecord, IssuedCredential)> {
        let device_id = Uuid::new_v4().to_string();
        let credential = self.issue_client_cert(&device_id, platform)?;

        let mut last_err = DrawbridgeError::Store("device creation failed".into());
        for _ in 0..8 {
            let device = DeviceRecord {
                id: device_id.clone(),
                name: drawbridge_core::device_name(),
                certificate_pem: credential.cert_pem.clone(),
                revoked: false,
            };
            match repo.create_device(&device) {
                Ok(()) => return Ok((device, credential)),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Server-side TLS configuration: TLS 1.3 only, client certs required
    /// and verified against the allowlist.
    pub fn server_tls_config(&self) -> DrawbridgeResult<Arc<ServerConfig>> {
        let mut roots = RootCertStore::empty();
        roots.add(self.root_cert_der.clone()).map_err(crypto_err)?;
        let verifier =
            EmissaryClientVerifier::new(roots, self.allowlist.clone()).map_err(crypto_err)?;

        let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                parse_cert_chain(&self.server_cert_pem)?,
                parse_private_key(&self.server_key_pem)?,
            )
            .map_err(crypto_err)?;
        Ok(Arc::new(config))
    }

    /// Client-side TLS configuration for outgoing calls needing mTLS,
    /// presenting the server leaf.
    pub fn client_tls_config(&self) -> DrawbridgeResult<Arc<ClientConfig>> {
        self.client_config_with_identity(&self.server_cert_pem, &self.server_key_pem)
    }

    /// Client-side TLS configuration presenting an issued device credential.
    /// Used by tests and by the bundle packager's connectivity check.
    pub fn emissary_client_tls_config(
        &self,
        cert_pem: &str,
        key_pem: &str,
    ) -> DrawbridgeResult<Arc<ClientConfig>> {
        self.client_config_with_identity(cert_pem, key_pem)
    }

    fn client_config_with_identity(
        &self,
        cert_pem: &str,
        key_pem: &str,
    ) -> DrawbridgeResult<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        roots.add(self.root_cert_der.clone()).map_err(crypto_err)?;
        let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_root_certificates(roots)
            .with_client_auth_cert(parse_cert_chain(cert_pem)?, parse_private_key(key_pem)?)
            .map_err(crypto_err)?;
        Ok(Arc::new(config))
    }

    /// The trust anchor PEM, shipped alongside issued credentials.
    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    pub fn listening_address(&self) -> &str {
        &self.listening_address
    }

    pub fn allowlist(&self) -> &Arc<CertificateAllowlist> {
        &self.allowlist
    }
}

fn crypto_err<E: std::fmt::Display>(e: E) -> DrawbridgeError {
    DrawbridgeError::Crypto(e.to_string())
}

/// 128-bit random serial drawn from the OS RNG, top bit cleared so the DER
/// integer stays positive.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

fn set_validity(params: &mut CertificateParams) {
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
}

/// Install the SAN set. DNS names are pushed verbatim even when they parse
/// as IPs: the listening address appears both as a DNS and an IP SAN so
/// clients validate it whichever way they dial.
fn apply_sans(
    params: &mut CertificateParams,
    dns_sans: &[String],
    ip_sans: &[IpAddr],
) -> DrawbridgeResult<()> {
    for dns in dns_sans {
        let name = Ia5String::try_from(dns.clone()).map_err(crypto_err)?;
        params.subject_alt_names.push(SanType::DnsName(name));
    }
    for ip in ip_sans {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }
    Ok(())
}

/// Write a private key with owner-only permissions.
fn write_key_file(path: &Path, pem: &str) -> DrawbridgeResult<()> {
    fs::write(path, pem)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Fail when a PEM certificate's SPKI does not match the given key.
fn verify_pair(cert_pem: &str, key: &KeyPair) -> DrawbridgeResult<()> {
    let block = pem::parse(cert_pem)
        .map_err(|e| DrawbridgeError::Crypto(format!("corrupt certificate file: {e}")))?;
    let (_, parsed) = X509Certificate::from_der(block.contents())
        .map_err(|e| DrawbridgeError::Crypto(format!("corrupt certificate file: {e}")))?;
    if parsed.public_key().raw != key.public_key_der().as_slice() {
        return Err(DrawbridgeError::Crypto(
            "certificate and key files do not match".into(),
        ));
    }
    Ok(())
}

/// Re-encode a PKCS#8 P-384 key as SEC1 EC PEM.
fn sec1_key_pem(pkcs8_pem: &str) -> DrawbridgeResult<String> {
    use p384::pkcs8::DecodePrivateKey;
    let key = p384::SecretKey::from_pkcs8_pem(pkcs8_pem).map_err(crypto_err)?;
    let pem = key
        .to_sec1_pem(p384::pkcs8::LineEnding::LF)
        .map_err(crypto_err)?;
    Ok(pem.to_string())
}

fn parse_cert_chain(pem: &str) -> DrawbridgeResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DrawbridgeError::Crypto(format!("bad certificate PEM: {e}")))
}

fn parse_private_key(pem: &str) -> DrawbridgeResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| DrawbridgeError::Crypto(format!("bad key PEM: {e}")))?
        .ok_or_else(|| DrawbridgeError::Crypto("no private key found in PEM".into()))
}

/// DNS and IP SAN sets for the root and server certificates.
///
/// A private listening address keeps the SAN set to the address plus
/// loopback; a public (or unparseable) one also gets the host's routable
/// interface addresses so the certificate validates regardless of which
/// interface clients reach.
fn san_sets(listening_address: &str) -> (Vec<String>, Vec<IpAddr>) {
    let dns_sans = vec![listening_address.to_string(), "localhost".to_string()];

    let mut ip_sans: Vec<IpAddr> =
        vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)];
    let parsed = listening_address.parse::<IpAddr>().ok();
    if let Some(ip) = parsed {
        if !ip_sans.contains(&ip) {
            ip_sans.push(ip);
        }
    }

    let is_private = parsed.map(is_private_address).unwrap_or(false);
    if !is_private {
        for ip in routable_interface_ips() {
            if !ip_sans.contains(&ip) {
                ip_sans.push(ip);
            }
        }
    }

    (dns_sans, ip_sans)
}

/// IANA-private or loopback addresses keep the gateway off interfaces the
/// admin did not ask for.
fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// The host's routable addresses, discovered by connecting a datagram
/// socket per address family and reading its local address. No packets are
/// sent; the destinations are documentation-range addresses.
fn routable_interface_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for (bind, dest) in [
        ("0.0.0.0:0", "198.51.100.1:443"),
        ("[::]:0", "[2001:db8::1]:443"),
    ] {
        if let Some(ip) = egress_probe(bind, dest) {
            ips.push(ip);
        }
    }
    ips
}

fn egress_probe(bind: &str, dest: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(dest).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        None
    } else {
        Some(ip)
    }
}
