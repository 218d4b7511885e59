/*!
 * Error Handling for the Token Key Service
 *
 * Every failure carries a symbolic kind, a numeric code and a message that
 * never contains key material. Callers outside the service boundary see an
 * [`ExternalError`], which collapses identity and authorization failures into
 * a single denial under the hardened policy.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::KeyStatus;

/// Error type for all key service operations
#[derive(Debug, Error)]
pub enum TksError {
    #[error("Key not found: {key_id}")]
    KeyNotFound { key_id: String },

    #[error("Key not active: {key_id} version {version} is {status}")]
    KeyNotActive {
        key_id: String,
        version: u32,
        status: KeyStatus,
    },

    #[error("Unknown connector: {connector_id}")]
    UnknownConnector { connector_id: String },

    #[error("Connector disabled: {connector_id}")]
    ConnectorDisabled { connector_id: String },

    #[error("Connector {connector_id} is not authorized for key {key_id}")]
    NotAuthorized { connector_id: String, key_id: String },

    #[error("Invalid diversifier: expected {expected}, got {actual}")]
    InvalidDiversifier { expected: String, actual: String },

    #[error("Unsupported scheme: {scheme} - {reason}")]
    UnsupportedScheme { scheme: String, reason: String },

    #[error("Invalid key material: {operation} - {cause}")]
    InvalidKeyMaterial { operation: String, cause: String },

    #[error("Vault unavailable: {cause}")]
    VaultUnavailable { cause: String },

    #[error("Invalid operation: {operation} - {cause}")]
    InvalidOperation { operation: String, cause: String },

    #[error("Storage error: {operation} - {cause}")]
    Storage { operation: String, cause: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {parameter} - {cause}")]
    Configuration { parameter: String, cause: String },
}

/// Symbolic error kinds, recorded in audit events and exposed to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    KeyNotFound,
    KeyNotActive,
    UnknownConnector,
    ConnectorDisabled,
    NotAuthorized,
    InvalidDiversifier,
    UnsupportedScheme,
    InvalidKeyMaterial,
    VaultUnavailable,
    InvalidOperation,
    Storage,
    Serialization,
    Configuration,
}

/// Error code constants grouped by component
pub mod error_codes {
    // Connector registry errors: 1000-1999
    pub const ACCESS_DENIED: u32 = 1000;
    pub const UNKNOWN_CONNECTOR: u32 = 1001;
    pub const CONNECTOR_DISABLED: u32 = 1002;
    pub const NOT_AUTHORIZED: u32 = 1003;

    // Key record store errors: 2000-2999
    pub const KEY_NOT_FOUND: u32 = 2001;
    pub const KEY_NOT_ACTIVE: u32 = 2002;
    pub const STORAGE_FAILED: u32 = 2003;
    pub const INVALID_OPERATION: u32 = 2004;

    // Vault errors: 3000-3999
    pub const VAULT_UNAVAILABLE: u32 = 3001;
    pub const INVALID_KEY_MATERIAL: u32 = 3002;

    // Diversification errors: 4000-4999
    pub const INVALID_DIVERSIFIER: u32 = 4001;
    pub const UNSUPPORTED_SCHEME: u32 = 4002;

    // Ambient errors: 9000-9999
    pub const INTERNAL_ERROR: u32 = 9000;
    pub const SERIALIZATION_FAILED: u32 = 9001;
    pub const CONFIGURATION_INVALID: u32 = 9002;
}

impl ErrorKind {
    /// Get the numeric error code for this kind
    pub fn error_code(&self) -> u32 {
        match self {
            ErrorKind::KeyNotFound => error_codes::KEY_NOT_FOUND,
            ErrorKind::KeyNotActive => error_codes::KEY_NOT_ACTIVE,
            ErrorKind::UnknownConnector => error_codes::UNKNOWN_CONNECTOR,
            ErrorKind::ConnectorDisabled => error_codes::CONNECTOR_DISABLED,
            ErrorKind::NotAuthorized => error_codes::NOT_AUTHORIZED,
            ErrorKind::InvalidDiversifier => error_codes::INVALID_DIVERSIFIER,
            ErrorKind::UnsupportedScheme => error_codes::UNSUPPORTED_SCHEME,
            ErrorKind::InvalidKeyMaterial => error_codes::INVALID_KEY_MATERIAL,
            ErrorKind::VaultUnavailable => error_codes::VAULT_UNAVAILABLE,
            ErrorKind::InvalidOperation => error_codes::INVALID_OPERATION,
            ErrorKind::Storage => error_codes::STORAGE_FAILED,
            ErrorKind::Serialization => error_codes::SERIALIZATION_FAILED,
            ErrorKind::Configuration => error_codes::CONFIGURATION_INVALID,
        }
    }

    /// Whether a failure could reveal key existence or connector rights
    pub fn is_access_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::KeyNotFound
                | ErrorKind::NotAuthorized
                | ErrorKind::UnknownConnector
                | ErrorKind::ConnectorDisabled
        )
    }
}

impl TksError {
    /// Get the symbolic kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TksError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            TksError::KeyNotActive { .. } => ErrorKind::KeyNotActive,
            TksError::UnknownConnector { .. } => ErrorKind::UnknownConnector,
            TksError::ConnectorDisabled { .. } => ErrorKind::ConnectorDisabled,
            TksError::NotAuthorized { .. } => ErrorKind::NotAuthorized,
            TksError::InvalidDiversifier { .. } => ErrorKind::InvalidDiversifier,
            TksError::UnsupportedScheme { .. } => ErrorKind::UnsupportedScheme,
            TksError::InvalidKeyMaterial { .. } => ErrorKind::InvalidKeyMaterial,
            TksError::VaultUnavailable { .. } => ErrorKind::VaultUnavailable,
            TksError::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            TksError::Storage { .. } => ErrorKind::Storage,
            TksError::Serialization(_) => ErrorKind::Serialization,
            TksError::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Get the numeric error code for this error
    pub fn error_code(&self) -> u32 {
        self.kind().error_code()
    }

    /// Only a vault failure is worth retrying, and only by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self, TksError::VaultUnavailable { .. })
    }

    /// Get a user-friendly error message
    pub fn user_friendly_message(&self) -> String {
        match self {
            TksError::KeyNotFound { key_id } => {
                format!("No key named '{}' exists in the key store.", key_id)
            }
            TksError::KeyNotActive { key_id, status, .. } => {
                format!("Key '{}' is {} and cannot be used.", key_id, status)
            }
            TksError::UnknownConnector { connector_id } => {
                format!("Connector '{}' is not registered.", connector_id)
            }
            TksError::ConnectorDisabled { connector_id } => {
                format!("Connector '{}' is disabled.", connector_id)
            }
            TksError::NotAuthorized { connector_id, key_id } => format!(
                "Connector '{}' has no grant for key '{}'.",
                connector_id, key_id
            ),
            TksError::InvalidDiversifier { expected, .. } => {
                format!("The diversifier is malformed. Expected {}.", expected)
            }
            TksError::UnsupportedScheme { scheme, .. } => {
                format!("Derivation or wrapping scheme '{}' is not supported.", scheme)
            }
            TksError::InvalidKeyMaterial { operation, .. } => format!(
                "Key material failed validation during '{}'. The record may be corrupt.",
                operation
            ),
            TksError::VaultUnavailable { .. } => {
                "The master-key vault is unavailable. Retry later.".to_string()
            }
            TksError::InvalidOperation { operation, .. } => {
                format!("Administrative operation '{}' was rejected.", operation)
            }
            TksError::Storage { operation, .. } => format!(
                "Key store operation '{}' failed. Check file permissions and disk space.",
                operation
            ),
            TksError::Serialization(_) => {
                "Data serialization failed. Data format may be corrupted.".to_string()
            }
            TksError::Configuration { parameter, .. } => {
                format!("Configuration parameter '{}' is invalid.", parameter)
            }
        }
    }

    /// Convert into the form returned to callers outside the service
    pub fn to_external(&self, policy: DenialPolicy) -> ExternalError {
        let kind = self.kind();

        if policy == DenialPolicy::Unified && kind.is_access_failure() {
            return ExternalError {
                code: error_codes::ACCESS_DENIED,
                kind: ExternalKind::Denied,
                message: DENIED_MESSAGE.to_string(),
            };
        }

        match kind {
            ErrorKind::InvalidOperation
            | ErrorKind::Storage
            | ErrorKind::Serialization
            | ErrorKind::Configuration => ExternalError {
                code: error_codes::INTERNAL_ERROR,
                kind: ExternalKind::Internal,
                message: "Internal key service error".to_string(),
            },
            _ => ExternalError {
                code: kind.error_code(),
                kind: ExternalKind::Error(kind),
                message: self.to_string(),
            },
        }
    }
}

/// Convenience constructors for common error types
impl TksError {
    pub fn key_not_found(key_id: impl Into<String>) -> Self {
        TksError::KeyNotFound {
            key_id: key_id.into(),
        }
    }

    pub fn invalid_key_material(operation: &str, cause: &str) -> Self {
        TksError::InvalidKeyMaterial {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn unsupported_scheme(scheme: impl std::fmt::Display, reason: &str) -> Self {
        TksError::UnsupportedScheme {
            scheme: scheme.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_diversifier(expected: &str, actual: &str) -> Self {
        TksError::InvalidDiversifier {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn vault_unavailable(cause: &str) -> Self {
        TksError::VaultUnavailable {
            cause: cause.to_string(),
        }
    }

    pub fn invalid_operation(operation: &str, cause: &str) -> Self {
        TksError::InvalidOperation {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn storage(operation: &str, cause: impl std::fmt::Display) -> Self {
        TksError::Storage {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn configuration(parameter: &str, cause: &str) -> Self {
        TksError::Configuration {
            parameter: parameter.to_string(),
            cause: cause.to_string(),
        }
    }
}

impl From<std::io::Error> for TksError {
    fn from(err: std::io::Error) -> Self {
        TksError::storage("io", err)
    }
}

impl From<serde_json::Error> for TksError {
    fn from(err: serde_json::Error) -> Self {
        TksError::Serialization(err.to_string())
    }
}

/// Result type alias for key service operations
pub type TksResult<T> = Result<T, TksError>;

const DENIED_MESSAGE: &str = "Request denied";

/// How identity and authorization failures are reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DenialPolicy {
    /// Missing keys, missing grants and connector failures all read as `Denied`
    #[default]
    Unified,
    /// Each failure keeps its own kind; meant for trusted deployments and tests
    Detailed,
}

/// Externally visible error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalKind {
    Denied,
    Error(ErrorKind),
    Internal,
}

/// Error as returned across the service boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalError {
    pub code: u32,
    pub kind: ExternalKind,
    pub message: String,
}

impl std::fmt::Display for ExternalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ExternalError {}
