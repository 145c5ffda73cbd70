//! Gateway settings read through the repository.
//!
//! The only runtime setting the core consumes is `listening_address`: it
//! feeds certificate SAN selection and nothing else. The gateway always
//! binds `0.0.0.0:<port>`.

use drawbridge_core::DrawbridgeResult;
use tracing::info;

use crate::repository::Repository;

/// Settings key for the admin-configured listening address.
pub const LISTENING_ADDRESS_KEY: &str = "listening_address";

/// Read the stored listening address. `None` means the admin channel has not
/// pushed one yet and the gateway must not bind.
pub fn listening_address(repo: &dyn Repository) -> DrawbridgeResult<Option<String>> {
    repo.get_setting(LISTENING_ADDRESS_KEY)
}

/// Store the listening address, normalizing `localhost` so downstream IP
/// parsing never sees the literal.
pub fn set_listening_address(repo: &dyn Repository, value: &str) -> DrawbridgeResult<()> {
    let normalized = normalize_listening_address(value);
    if normalized != value {
        info!(from = %value, to = %normalized, "normalized listening address");
    }
    repo.put_setting(LISTENING_ADDRESS_KEY, &normalized)
}

/// `localhost` is normalized to the IPv4 loopback at write time.
pub fn normalize_listening_address(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("localhost") {
        "127.0.0.1".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    #[test]
    fn localhost_is_normalized_at_write_time() {
        let repo = MemoryRepository::new();
        set_listening_address(&repo, "localhost").unwrap();
        assert_eq!(
            listening_address(&repo).unwrap().as_deref(),
            Some("127.0.0.1")
        );
    }

    #[test]
    fn other_addresses_pass_through() {
        let repo = MemoryRepository::new();
        set_listening_address(&repo, " 203.0.113.7 ").unwrap();
        assert_eq!(
            listening_address(&repo).unwrap().as_deref(),
            Some("203.0.113.7")
        );
    }

    #[test]
    fn absent_setting_reads_as_none() {
        let repo = MemoryRepository::new();
        assert_eq!(listening_address(&repo).unwrap(), None);
    }
}
