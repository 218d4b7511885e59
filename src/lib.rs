/*!
 * Token Key Service
 *
 * The key service behind a token management system. It keeps symmetric keys
 * wrapped under master keys, releases them to authorized TPS connectors
 * wrapped under each connector's transport key, and derives per-token session
 * keys from key families using the GlobalPlatform schemes:
 *
 * - GP VISA2 and EMV CPS (two-key DES3)
 * - GP SCP03 (AES, SP 800-108 counter mode with CMAC)
 *
 * Key material stays inside the vault. Records carry master-wrapped bytes,
 * handles carry zeroed-on-drop material that cannot be printed, and every
 * response carries transport-wrapped bytes only.
 */

/// Audit events and sinks
pub mod audit;

/// Service configuration
pub mod config;

/// Session key derivation from key families
pub mod diversification;

/// Error types and the external error mapping
pub mod error;

/// Key records and their metadata
pub mod model;

/// TPS connector registry
pub mod registry;

/// Zeroed-on-drop byte buffers
pub mod secure_memory;

/// The shared-secret service
pub mod service;

/// Versioned key record store
pub mod store;

/// Master keys and every operation on plaintext material
pub mod vault;

/// Transport wrapping for connectors
pub mod wrapping;

mod block;

pub use audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink, LogAuditSink, MemoryAuditSink};
pub use config::ServiceConfig;
pub use diversification::{derive_session_keys, DerivationScheme, Diversifier, SessionKeyRole, SessionKeySet};
pub use error::{DenialPolicy, ErrorKind, ExternalError, ExternalKind, TksError, TksResult};
pub use model::{KeyAlgorithm, KeyIdentifier, KeyInfo, KeyRecord, KeyStatus, KeyType, MasterKeyHandle};
pub use registry::{Connector, ConnectorRegistry, ConnectorStatus};
pub use service::{DerivationInfo, SharedSecretRequest, SharedSecretService, WrappedKeyResponse};
pub use store::KeyRecordStore;
pub use vault::{AuditContext, KeyHandle, KeySpec, MasterKeyVault};
pub use wrapping::{unwrap_transport, WrappingScheme};

/// The types most callers need
pub mod prelude {
    pub use crate::audit::{AuditSink, LogAuditSink, MemoryAuditSink};
    pub use crate::config::ServiceConfig;
    pub use crate::diversification::{DerivationScheme, SessionKeyRole};
    pub use crate::error::{DenialPolicy, ExternalError, TksError, TksResult};
    pub use crate::model::{KeyAlgorithm, KeyIdentifier, KeyInfo, KeyStatus, KeyType};
    pub use crate::registry::Connector;
    pub use crate::secure_memory::SecureBytes;
    pub use crate::service::{SharedSecretRequest, SharedSecretService, WrappedKeyResponse};
    pub use crate::vault::KeySpec;
    pub use crate::wrapping::{unwrap_transport, WrappingScheme};
}
