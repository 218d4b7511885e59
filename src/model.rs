/*!
 * Key Record Data Model
 *
 * Tagged types for key identity, type, algorithm and lifecycle status, plus
 * the stored [`KeyRecord`] and its material-free projection [`KeyInfo`].
 */

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diversification::DerivationScheme;

/// Opaque key name, compared and stored exactly as supplied
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyIdentifier(String);

impl KeyIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyIdentifier {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for KeyIdentifier {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for KeyIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for KeyIdentifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// What a stored key is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// A master key kept for backup or escrow; never released
    Master,
    /// Key shared with a connector to protect keys in transit
    Transport,
    /// Static secret handed to authorized connectors
    SharedSecret,
    /// Family master key from which per-token session keys are derived
    Session,
}

impl KeyType {
    pub(crate) fn code(&self) -> u8 {
        match self {
            KeyType::Master => 0x01,
            KeyType::Transport => 0x02,
            KeyType::SharedSecret => 0x03,
            KeyType::Session => 0x04,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyType::Master => "master",
            KeyType::Transport => "transport",
            KeyType::SharedSecret => "shared-secret",
            KeyType::Session => "session",
        };
        f.write_str(name)
    }
}

/// Symmetric algorithm of a stored key
///
/// `Des3` is two-key triple DES (K1, K2, K1) as used by GlobalPlatform cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyAlgorithm {
    Des3,
    Aes128,
    Aes192,
    Aes256,
}

impl KeyAlgorithm {
    /// Length of raw key material in bytes
    pub fn key_len(&self) -> usize {
        match self {
            KeyAlgorithm::Des3 => 16,
            KeyAlgorithm::Aes128 => 16,
            KeyAlgorithm::Aes192 => 24,
            KeyAlgorithm::Aes256 => 32,
        }
    }

    pub fn is_aes(&self) -> bool {
        !matches!(self, KeyAlgorithm::Des3)
    }

    /// Map an AES key length to its algorithm
    pub fn aes_for_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(KeyAlgorithm::Aes128),
            24 => Some(KeyAlgorithm::Aes192),
            32 => Some(KeyAlgorithm::Aes256),
            _ => None,
        }
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            KeyAlgorithm::Des3 => 0x10,
            KeyAlgorithm::Aes128 => 0x20,
            KeyAlgorithm::Aes192 => 0x21,
            KeyAlgorithm::Aes256 => 0x22,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyAlgorithm::Des3 => "DES3",
            KeyAlgorithm::Aes128 => "AES128",
            KeyAlgorithm::Aes192 => "AES192",
            KeyAlgorithm::Aes256 => "AES256",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of one key version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Inactive,
    Compromised,
    Revoked,
}

impl KeyStatus {
    /// Administrative transitions allowed from this status.
    ///
    /// Revoked is terminal; an Inactive version never becomes Active again.
    pub fn can_transition_to(&self, next: KeyStatus) -> bool {
        use KeyStatus::*;
        matches!(
            (self, next),
            (Active, Inactive)
                | (Active, Compromised)
                | (Active, Revoked)
                | (Inactive, Compromised)
                | (Inactive, Revoked)
                | (Compromised, Revoked)
        )
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyStatus::Active => "active",
            KeyStatus::Inactive => "inactive",
            KeyStatus::Compromised => "compromised",
            KeyStatus::Revoked => "revoked",
        };
        f.write_str(name)
    }
}

/// Reference to one version of a master key held inside the vault
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterKeyHandle {
    pub key_id: KeyIdentifier,
    pub version: u32,
}

impl MasterKeyHandle {
    pub fn new(key_id: impl Into<KeyIdentifier>, version: u32) -> Self {
        Self {
            key_id: key_id.into(),
            version,
        }
    }
}

impl fmt::Display for MasterKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.key_id, self.version)
    }
}

/// Ciphertext of a key under a vault master key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedMaterial(#[serde(with = "base64_bytes")] Vec<u8>);

impl WrappedMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for WrappedMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedMaterial([{} bytes])", self.0.len())
    }
}

/// One stored version of a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: KeyIdentifier,
    pub key_type: KeyType,
    pub algorithm: KeyAlgorithm,
    pub status: KeyStatus,
    pub version: u32,
    pub wrapped_material: WrappedMaterial,
    /// Master key version the material is wrapped under
    pub wrapping_key: MasterKeyHandle,
    /// Pinned derivation scheme for session key families
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_scheme: Option<DerivationScheme>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl KeyRecord {
    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }

    /// Metadata view with no key material
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            key_type: self.key_type,
            algorithm: self.algorithm,
            status: self.status,
            version: self.version,
            derivation_scheme: self.derivation_scheme,
            created_at: self.created_at,
            modified_at: self.modified_at,
            check_value: None,
        }
    }
}

/// Key information as shown to administrators and connectors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: KeyIdentifier,
    pub key_type: KeyType,
    pub algorithm: KeyAlgorithm,
    pub status: KeyStatus,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_scheme: Option<DerivationScheme>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Hex key check value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_value: Option<String>,
}

pub(crate) mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::decode(encoded).map_err(serde::de::Error::custom)
    }
}
