//! drawbridge-core: Shared building blocks for the Drawbridge gateway.
//!
//! Provides the Emissary wire framing, canonical certificate encoding and
//! hashing, device name generation, and the crate-wide error type.

pub mod error;
pub mod frame;
pub mod identity;
pub mod naming;

// Re-export commonly used items at crate root.
pub use error::{DrawbridgeError, DrawbridgeResult};
pub use frame::{Frame, RequestKind, MAX_FRAME_LEN};
pub use identity::{cert_hash_from_der, cert_hash_from_pem, cert_pem_from_der, device_id_from_cert_der};
pub use naming::device_name;
