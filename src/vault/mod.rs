/*!
 * Master-Key Vault
 *
 * Holds the master keys that protect every stored key record. Master key
 * material never leaves the vault: callers see [`MasterKeyHandle`]s, opaque
 * [`KeyHandle`]s and wrapped bytes only.
 *
 * Each master key id keeps a table of versions. Records pin the version they
 * were wrapped under, so rotating a master key does not break records (or
 * in-flight requests) that still reference an earlier version.
 *
 * Every unwrap, wrap, derive and transport wrap is reported to the audit sink.
 */

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::audit::{AuditEvent, AuditOperation, AuditSink};
use crate::block;
use crate::diversification::{self, DerivationScheme, Diversifier, SessionKeySet};
use crate::error::{TksError, TksResult};
use crate::model::{
    KeyAlgorithm, KeyIdentifier, KeyRecord, KeyStatus, KeyType, MasterKeyHandle, WrappedMaterial,
};
use crate::secure_memory::SecureBytes;
use crate::wrapping::{self, GcmCipher, WrappingScheme};

/// Length of every master key
pub const MASTER_KEY_LEN: usize = 32;

const RECORD_WRAP_INFO: &[u8] = b"tks-record-wrap/v1";

type MasterTable = BTreeMap<KeyIdentifier, BTreeMap<u32, SecureBytes>>;

/// Who an operation is performed for, as recorded in the audit trail
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditContext {
    pub connector_id: Option<String>,
}

impl AuditContext {
    /// Administrative operation with no connector
    pub fn admin() -> Self {
        Self::default()
    }

    pub fn connector(connector_id: impl Into<String>) -> Self {
        Self {
            connector_id: Some(connector_id.into()),
        }
    }
}

/// Unwrapped key material, usable only through the vault.
///
/// The material is zeroed on drop and never printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    key_id: KeyIdentifier,
    version: u32,
    key_type: KeyType,
    algorithm: KeyAlgorithm,
    material: SecureBytes,
}

impl KeyHandle {
    pub fn key_id(&self) -> &KeyIdentifier {
        &self.key_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub(crate) fn material(&self) -> &[u8] {
        self.material.as_bytes()
    }
}

/// Attributes of a key about to be provisioned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub id: KeyIdentifier,
    pub key_type: KeyType,
    pub algorithm: KeyAlgorithm,
    pub derivation_scheme: Option<DerivationScheme>,
}

impl KeySpec {
    pub fn new(id: impl Into<KeyIdentifier>, key_type: KeyType, algorithm: KeyAlgorithm) -> Self {
        Self {
            id: id.into(),
            key_type,
            algorithm,
            derivation_scheme: None,
        }
    }

    pub fn with_scheme(mut self, scheme: DerivationScheme) -> Self {
        self.derivation_scheme = Some(scheme);
        self
    }
}

/// What a transport wrap carries
#[derive(Debug, Clone, Copy)]
pub enum TransportPayload<'a> {
    /// A single static key
    Key(&'a KeyHandle),
    /// A derived session key set, wrapped as `ENC || MAC || KEK`
    Session {
        family: &'a KeyHandle,
        keys: &'a SessionKeySet,
    },
}

impl<'a> TransportPayload<'a> {
    fn source(&self) -> &'a KeyHandle {
        match self {
            TransportPayload::Key(handle) => handle,
            TransportPayload::Session { family, .. } => family,
        }
    }
}

/// Master-key vault
///
/// Constructed once and shared by reference; there is no global instance.
pub struct MasterKeyVault {
    masters: RwLock<MasterTable>,
    sealed: AtomicBool,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for MasterKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.masters.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("MasterKeyVault")
            .field("master_keys", &count)
            .field("sealed", &self.sealed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MasterKeyVault {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            masters: RwLock::new(BTreeMap::new()),
            sealed: AtomicBool::new(false),
            audit,
        }
    }

    /// Install supplied master key material as the next version of `key_id`
    pub fn install_master(&self, key_id: impl Into<KeyIdentifier>, material: &[u8]) -> TksResult<MasterKeyHandle> {
        if material.len() != MASTER_KEY_LEN {
            return Err(TksError::invalid_key_material(
                "install_master",
                &format!("master keys must be {} bytes", MASTER_KEY_LEN),
            ));
        }

        let key_id = key_id.into();
        let mut masters = self.write_masters()?;
        let versions = masters.entry(key_id.clone()).or_default();
        let version = versions.keys().next_back().map_or(1, |v| v + 1);
        versions.insert(version, SecureBytes::new(material));

        let handle = MasterKeyHandle::new(key_id, version);
        log::info!("Installed master key {}", handle);
        Ok(handle)
    }

    /// Generate a random master key as the next version of `key_id`
    pub fn generate_master(&self, key_id: impl Into<KeyIdentifier>) -> TksResult<MasterKeyHandle> {
        let mut material = SecureBytes::zeroed(MASTER_KEY_LEN);
        OsRng.fill_bytes(material.as_bytes_mut());
        self.install_master(key_id, material.as_bytes())
    }

    /// Add a new random version to an existing master key.
    ///
    /// Earlier versions stay available for records pinned to them.
    pub fn rotate_master(&self, key_id: &KeyIdentifier) -> TksResult<MasterKeyHandle> {
        self.current_master(key_id)?;
        let handle = self.generate_master(key_id.clone())?;
        log::info!("Rotated master key {} to version {}", key_id, handle.version);
        Ok(handle)
    }

    /// Remove and zero one non-current master key version
    pub fn retire_master(&self, handle: &MasterKeyHandle) -> TksResult<()> {
        let mut masters = self.write_masters()?;
        let versions = masters
            .get_mut(&handle.key_id)
            .ok_or_else(|| TksError::key_not_found(handle.key_id.as_str()))?;

        if versions.keys().next_back() == Some(&handle.version) {
            return Err(TksError::invalid_operation(
                "retire_master",
                "the current master key version cannot be retired",
            ));
        }

        // SecureBytes zeroes itself on drop
        versions
            .remove(&handle.version)
            .ok_or_else(|| TksError::key_not_found(handle.to_string()))?;
        log::info!("Retired master key {}", handle);
        Ok(())
    }

    pub fn current_master(&self, key_id: &KeyIdentifier) -> TksResult<MasterKeyHandle> {
        let masters = self.read_masters()?;
        masters
            .get(key_id)
            .and_then(|versions| versions.keys().next_back())
            .map(|&version| MasterKeyHandle::new(key_id.clone(), version))
            .ok_or_else(|| TksError::key_not_found(key_id.as_str()))
    }

    pub fn master_versions(&self, key_id: &KeyIdentifier) -> TksResult<Vec<u32>> {
        let masters = self.read_masters()?;
        masters
            .get(key_id)
            .map(|versions| versions.keys().copied().collect())
            .ok_or_else(|| TksError::key_not_found(key_id.as_str()))
    }

    /// Refuse all key operations until [`MasterKeyVault::unseal`]
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        log::warn!("Master key vault sealed");
    }

    pub fn unseal(&self) {
        self.sealed.store(false, Ordering::SeqCst);
        log::info!("Master key vault unsealed");
    }

    pub fn is_available(&self) -> bool {
        !self.sealed.load(Ordering::SeqCst)
    }

    /// Create a record holding fresh random material wrapped under `master`
    pub fn generate_record(&self, spec: KeySpec, master: &MasterKeyHandle, version: u32) -> TksResult<KeyRecord> {
        let mut material = SecureBytes::zeroed(spec.algorithm.key_len());
        OsRng.fill_bytes(material.as_bytes_mut());
        if spec.algorithm == KeyAlgorithm::Des3 {
            block::adjust_des_parity(material.as_bytes_mut());
        }
        self.import_record(spec, master, version, material.as_bytes())
    }

    /// Create a record wrapping supplied material under `master`
    pub fn import_record(
        &self,
        spec: KeySpec,
        master: &MasterKeyHandle,
        version: u32,
        material: &[u8],
    ) -> TksResult<KeyRecord> {
        if material.len() != spec.algorithm.key_len() {
            return Err(TksError::invalid_key_material(
                "import",
                &format!(
                    "{} keys must be {} bytes",
                    spec.algorithm,
                    spec.algorithm.key_len()
                ),
            ));
        }
        if let Some(scheme) = spec.derivation_scheme {
            if spec.key_type != KeyType::Session {
                return Err(TksError::invalid_operation(
                    "import",
                    "only session key families carry a derivation scheme",
                ));
            }
            scheme.ensure_accepts(spec.algorithm)?;
        }

        let handle = KeyHandle {
            key_id: spec.id.clone(),
            version,
            key_type: spec.key_type,
            algorithm: spec.algorithm,
            material: SecureBytes::new(material),
        };
        let wrapped = self.wrap(master, &handle, &AuditContext::admin())?;

        let now = Utc::now();
        Ok(KeyRecord {
            id: spec.id,
            key_type: spec.key_type,
            algorithm: spec.algorithm,
            status: KeyStatus::Active,
            version,
            wrapped_material: wrapped,
            wrapping_key: master.clone(),
            derivation_scheme: spec.derivation_scheme,
            created_at: now,
            modified_at: now,
        })
    }

    /// Decrypt a record's material into an opaque handle
    pub fn unwrap(&self, record: &KeyRecord, ctx: &AuditContext) -> TksResult<KeyHandle> {
        let result = self.unwrap_record(record);
        self.emit(AuditOperation::Unwrap, &record.id, Some(record.version), ctx, &result);
        result
    }

    /// Encrypt a handle's material under a master key version
    pub fn wrap(&self, master: &MasterKeyHandle, key: &KeyHandle, ctx: &AuditContext) -> TksResult<WrappedMaterial> {
        let result = self.wrap_handle(master, key);
        self.emit(AuditOperation::Wrap, &key.key_id, Some(key.version), ctx, &result);
        result
    }

    /// Move a record onto the current version of its master key
    pub fn rewrap_record(&self, record: &KeyRecord, ctx: &AuditContext) -> TksResult<KeyRecord> {
        let handle = self.unwrap(record, ctx)?;
        let current = self.current_master(&record.wrapping_key.key_id)?;
        let wrapped = self.wrap(&current, &handle, ctx)?;

        let mut rewrapped = record.clone();
        rewrapped.wrapped_material = wrapped;
        rewrapped.wrapping_key = current;
        rewrapped.modified_at = Utc::now();
        Ok(rewrapped)
    }

    /// Derive the session key set of one token from a session family key
    pub fn derive(
        &self,
        family: &KeyHandle,
        diversifier: &Diversifier,
        scheme: DerivationScheme,
        ctx: &AuditContext,
    ) -> TksResult<SessionKeySet> {
        let result = self.ensure_available().and_then(|_| {
            if family.key_type != KeyType::Session {
                return Err(TksError::invalid_operation(
                    "derive",
                    &format!("{} keys are not derivation masters", family.key_type),
                ));
            }
            diversification::derive_session_keys(family.material(), family.algorithm, diversifier, scheme)
        });
        self.emit(AuditOperation::Derive, &family.key_id, Some(family.version), ctx, &result);
        result
    }

    /// Wrap a key or session key set under a connector's transport key
    pub fn transport_wrap(
        &self,
        transport: &KeyHandle,
        payload: TransportPayload<'_>,
        scheme: WrappingScheme,
        aad: &[u8],
        ctx: &AuditContext,
    ) -> TksResult<Vec<u8>> {
        let source = payload.source();
        let result = self.ensure_available().and_then(|_| {
            if transport.key_type != KeyType::Transport {
                return Err(TksError::invalid_operation(
                    "transport_wrap",
                    &format!("{} is not a transport key", transport.key_id),
                ));
            }
            match payload {
                TransportPayload::Key(key) => wrapping::wrap_for_transport(
                    transport.material(),
                    transport.algorithm,
                    scheme,
                    key.material(),
                    aad,
                ),
                TransportPayload::Session { keys, .. } => wrapping::wrap_for_transport(
                    transport.material(),
                    transport.algorithm,
                    scheme,
                    keys.payload().as_bytes(),
                    aad,
                ),
            }
        });
        self.emit(AuditOperation::TransportWrap, &source.key_id, Some(source.version), ctx, &result);
        result
    }

    /// Hex key check value of a handle's material
    pub fn check_value(&self, key: &KeyHandle) -> TksResult<String> {
        self.ensure_available()?;
        let kcv = block::key_check_value(key.algorithm, key.material())?;
        Ok(hex::encode_upper(kcv))
    }

    fn unwrap_record(&self, record: &KeyRecord) -> TksResult<KeyHandle> {
        self.ensure_available()?;
        let cipher = self.record_cipher(&record.wrapping_key, &record.id, record.version)?;
        let aad = record_aad(&record.id, record.version, record.key_type, record.algorithm);

        let material = cipher
            .open(record.wrapped_material.as_bytes(), &aad)
            .map_err(|_| TksError::invalid_key_material("unwrap", "record failed authentication"))?;

        if material.len() != record.algorithm.key_len() {
            return Err(TksError::invalid_key_material(
                "unwrap",
                &format!("material length does not match {}", record.algorithm),
            ));
        }

        Ok(KeyHandle {
            key_id: record.id.clone(),
            version: record.version,
            key_type: record.key_type,
            algorithm: record.algorithm,
            material,
        })
    }

    fn wrap_handle(&self, master: &MasterKeyHandle, key: &KeyHandle) -> TksResult<WrappedMaterial> {
        self.ensure_available()?;
        if key.material.len() != key.algorithm.key_len() {
            return Err(TksError::invalid_key_material(
                "wrap",
                &format!("material length does not match {}", key.algorithm),
            ));
        }

        let cipher = self.record_cipher(master, &key.key_id, key.version)?;
        let aad = record_aad(&key.key_id, key.version, key.key_type, key.algorithm);
        Ok(WrappedMaterial::new(cipher.seal(key.material(), &aad)?))
    }

    /// AES-256-GCM keyed with a per-record subkey of the master key
    fn record_cipher(&self, master: &MasterKeyHandle, key_id: &KeyIdentifier, version: u32) -> TksResult<GcmCipher> {
        let masters = self.read_masters()?;
        let master_key = masters
            .get(&master.key_id)
            .and_then(|versions| versions.get(&master.version))
            .ok_or_else(|| TksError::key_not_found(master.to_string()))?;

        let mut info = Vec::with_capacity(RECORD_WRAP_INFO.len() + key_id.as_str().len() + 6);
        info.extend_from_slice(RECORD_WRAP_INFO);
        info.push(0x00);
        info.extend_from_slice(key_id.as_str().as_bytes());
        info.push(0x00);
        info.extend_from_slice(&version.to_be_bytes());

        let mut subkey = SecureBytes::zeroed(MASTER_KEY_LEN);
        Hkdf::<Sha256>::new(None, master_key.as_bytes())
            .expand(&info, subkey.as_bytes_mut())
            .map_err(|_| TksError::invalid_key_material("record_wrap", "subkey derivation failed"))?;

        GcmCipher::new(subkey.as_bytes())
    }

    fn ensure_available(&self) -> TksResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(TksError::vault_unavailable("vault is sealed"))
        }
    }

    fn read_masters(&self) -> TksResult<RwLockReadGuard<'_, MasterTable>> {
        self.masters
            .read()
            .map_err(|_| TksError::vault_unavailable("master key table lock poisoned"))
    }

    fn write_masters(&self) -> TksResult<RwLockWriteGuard<'_, MasterTable>> {
        self.masters
            .write()
            .map_err(|_| TksError::vault_unavailable("master key table lock poisoned"))
    }

    fn emit<T>(
        &self,
        operation: AuditOperation,
        key_id: &KeyIdentifier,
        version: Option<u32>,
        ctx: &AuditContext,
        result: &TksResult<T>,
    ) {
        if let Err(e) = result {
            log::debug!("Vault {} failed for {}: {}", operation, key_id, e);
        }
        self.audit.record(
            AuditEvent::new(operation)
                .key(key_id, version)
                .connector(ctx.connector_id.as_deref())
                .outcome(result),
        );
    }
}

/// `key_id || 00 || version || type || algorithm`
fn record_aad(key_id: &KeyIdentifier, version: u32, key_type: KeyType, algorithm: KeyAlgorithm) -> Vec<u8> {
    let mut aad = Vec::with_capacity(key_id.as_str().len() + 7);
    aad.extend_from_slice(key_id.as_str().as_bytes());
    aad.push(0x00);
    aad.extend_from_slice(&version.to_be_bytes());
    aad.push(key_type.code());
    aad.push(algorithm.code());
    aad
}
