//! Narrow persistence interface consumed by the gateway core.
//!
//! The store behind this trait is an external collaborator; the gateway only
//! depends on these operations. [`SqliteRepository`] is the shipped
//! implementation, [`MemoryRepository`] backs tests.

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

use drawbridge_core::DrawbridgeResult;

use crate::events::Event;

/// A configured Protected Service as persisted by the admin plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub id: u16,
    pub name: String,
    pub description: String,
    pub host: String,
    pub port: u16,
}

/// A Protected Service about to be persisted (the store assigns the id).
#[derive(Debug, Clone)]
pub struct NewService {
    pub name: String,
    pub description: String,
    pub host: String,
    pub port: u16,
}

/// An Emissary device record.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Opaque device id (UUID string), also embedded in the issued cert.
    pub id: String,
    /// Human-readable `adjective-animal` name.
    pub name: String,
    /// The issued certificate PEM, exactly as hashed into the allowlist.
    pub certificate_pem: String,
    pub revoked: bool,
}

/// One row of the startup allowlist hydration query.
#[derive(Debug, Clone)]
pub struct StoredDeviceCert {
    pub certificate_pem: String,
    pub device_id: String,
    pub revoked: bool,
}

/// Persistence operations the gateway core consumes.
///
/// Implementations must be callable from the event-sink drain task, which
/// runs the fire-and-forget [`Repository::append_event`] off the async
/// runtime via `spawn_blocking`.
pub trait Repository: Send + Sync {
    fn get_setting(&self, key: &str) -> DrawbridgeResult<Option<String>>;
    fn put_setting(&self, key: &str, value: &str) -> DrawbridgeResult<()>;

    /// All configured services, ordered by id ascending.
    fn list_services(&self) -> DrawbridgeResult<Vec<ServiceRecord>>;
    fn insert_service(&self, service: &NewService) -> DrawbridgeResult<ServiceRecord>;
    fn update_service(&self, service: &ServiceRecord) -> DrawbridgeResult<()>;
    fn delete_service(&self, id: u16) -> DrawbridgeResult<()>;

    /// Every issued device certificate, used once at startup to hydrate the
    /// allowlist.
    fn list_device_certs(&self) -> DrawbridgeResult<Vec<StoredDeviceCert>>;
    fn create_device(&self, device: &DeviceRecord) -> DrawbridgeResult<()>;
    fn set_device_revoked(&self, device_id: &str, revoked: bool) -> DrawbridgeResult<()>;

    /// Append a per-request event. Advisory: failures are logged and dropped
    /// by the caller, never surfaced to the dispatcher.
    fn append_event(&self, event: &Event) -> DrawbridgeResult<()>;
}
