/*!
 * Shared-Secret Service
 *
 * Answers connector requests for keys. A request is resolved in a fixed order:
 *
 * 1. resolve and authorize the connector (one registry read)
 * 2. resolve the key record, which must be `Active`
 * 3. validate the derivation scheme and diversifier before any key is unwrapped
 * 4. unwrap the connector's transport key and the requested key inside the vault
 * 5. static keys are re-wrapped under the transport key; session families
 *    derive the token's key set, which is wrapped instead
 * 6. authorization is checked again, so a revocation committed while the
 *    request was in flight is honored
 *
 * Every call emits one audit event, whatever its outcome. Master-wrapped
 * bytes never leave the service.
 */


use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditOperation, AuditSink};
use crate::config::ServiceConfig;
use crate::diversification::{DerivationScheme, Diversifier, SessionKeyRole};
use crate::error::{ExternalError, TksError, TksResult};
use crate::model::{base64_bytes, KeyAlgorithm, KeyIdentifier, KeyInfo, KeyRecord, KeyType};
use crate::registry::{Connector, ConnectorRegistry};
use crate::store::KeyRecordStore;
use crate::vault::{AuditContext, KeySpec, MasterKeyVault, TransportPayload};
use crate::wrapping::{self, WrappingScheme};

const FIRST_VERSION: u32 = 1;

/// A connector's request for one key
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecretRequest {
    pub connector_id: String,
    pub key_id: KeyIdentifier,
    /// Token key derivation data, required for session key families
    pub diversifier: Option<Vec<u8>>,
    /// Expected derivation scheme; must match the family's pinned scheme
    pub scheme: Option<DerivationScheme>,
    /// Exact key version; the latest version when absent
    pub key_version: Option<u32>,
}

impl SharedSecretRequest {
    pub fn new(connector_id: impl Into<String>, key_id: impl Into<KeyIdentifier>) -> Self {
        Self {
            connector_id: connector_id.into(),
            key_id: key_id.into(),
            diversifier: None,
            scheme: None,
            key_version: None,
        }
    }

    pub fn with_diversifier(mut self, diversifier: impl Into<Vec<u8>>) -> Self {
        self.diversifier = Some(diversifier.into());
        self
    }

    pub fn with_scheme(mut self, scheme: DerivationScheme) -> Self {
        self.scheme = Some(scheme);
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.key_version = Some(version);
        self
    }
}

impl fmt::Debug for SharedSecretRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecretRequest")
            .field("connector_id", &self.connector_id)
            .field("key_id", &self.key_id)
            .field("diversifier", &self.diversifier.as_ref().map(hex::encode_upper))
            .field("scheme", &self.scheme)
            .field("key_version", &self.key_version)
            .finish()
    }
}

/// How a session key set was derived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationInfo {
    pub scheme: DerivationScheme,
    /// Hex of the key derivation data
    pub diversifier: String,
    /// Roles in the order their keys appear in the wrapped payload
    pub roles: Vec<SessionKeyRole>,
    /// Hex check value of each derived key, in `roles` order
    pub check_values: Vec<String>,
}

/// Key material wrapped for one connector
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeyResponse {
    pub key_id: KeyIdentifier,
    pub algorithm: KeyAlgorithm,
    pub version: u32,
    #[serde(with = "base64_bytes")]
    pub wrapped_bytes: Vec<u8>,
    pub wrapping_scheme: WrappingScheme,
    pub transport_key_id: KeyIdentifier,
    pub transport_key_version: u32,
    /// Hex check value of a static key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation: Option<DerivationInfo>,
}

impl WrappedKeyResponse {
    /// Associated data the connector needs to unwrap an `AesGcm` response
    pub fn transport_aad(&self) -> Vec<u8> {
        wrapping::transport_aad(&self.key_id, self.version)
    }
}

impl fmt::Debug for WrappedKeyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedKeyResponse")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("version", &self.version)
            .field("wrapped_bytes", &format!("[{} bytes]", self.wrapped_bytes.len()))
            .field("wrapping_scheme", &self.wrapping_scheme)
            .field("transport_key_id", &self.transport_key_id)
            .field("transport_key_version", &self.transport_key_version)
            .field("check_value", &self.check_value)
            .field("derivation", &self.derivation)
            .finish()
    }
}

/// Session family request after scheme and diversifier validation
struct DerivationPlan {
    scheme: DerivationScheme,
    diversifier: Diversifier,
}

/// The shared-secret service
///
/// Holds no per-request state; one instance serves concurrent callers.
pub struct SharedSecretService {
    vault: Arc<MasterKeyVault>,
    store: Arc<KeyRecordStore>,
    registry: Arc<ConnectorRegistry>,
    audit: Arc<dyn AuditSink>,
    config: ServiceConfig,
}

impl fmt::Debug for SharedSecretService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecretService")
            .field("vault", &self.vault)
            .field("store", &self.store.path())
            .field("config", &self.config)
            .finish()
    }
}

impl SharedSecretService {
    pub fn new(
        vault: Arc<MasterKeyVault>,
        store: Arc<KeyRecordStore>,
        registry: Arc<ConnectorRegistry>,
        audit: Arc<dyn AuditSink>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            vault,
            store,
            registry,
            audit,
            config,
        }
    }

    /// Build every component from configuration.
    ///
    /// The vault starts without master keys; they are installed through
    /// [`MasterKeyVault::install_master`] before records are used.
    pub fn from_config(config: ServiceConfig, audit: Arc<dyn AuditSink>) -> TksResult<Self> {
        config.validate()?;
        let store = match &config.store_path {
            Some(path) => KeyRecordStore::open(path)?,
            None => KeyRecordStore::in_memory(),
        };
        let registry = ConnectorRegistry::from_connectors(config.connectors.iter().cloned())?;
        let vault = MasterKeyVault::new(Arc::clone(&audit));

        Ok(Self::new(
            Arc::new(vault),
            Arc::new(store),
            Arc::new(registry),
            audit,
            config,
        ))
    }

    pub fn vault(&self) -> &Arc<MasterKeyVault> {
        &self.vault
    }

    pub fn store(&self) -> &Arc<KeyRecordStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Release a key to a connector, wrapped under the connector's transport key
    pub fn get_shared_secret(&self, request: &SharedSecretRequest) -> TksResult<WrappedKeyResponse> {
        let result = self.process(request);

        let version = match &result {
            Ok(response) => Some(response.version),
            Err(_) => request.key_version,
        };
        self.audit.record(
            AuditEvent::new(AuditOperation::GetSharedSecret)
                .key(&request.key_id, version)
                .connector(Some(&request.connector_id))
                .outcome(&result),
        );

        match &result {
            Ok(response) => log::info!(
                "Released {} v{} to {} under {}",
                response.key_id,
                response.version,
                request.connector_id,
                response.wrapping_scheme
            ),
            Err(e) => log::warn!(
                "Refused {} to {}: {:?} ({})",
                request.key_id,
                request.connector_id,
                e.kind(),
                e.error_code()
            ),
        }
        result
    }

    /// [`SharedSecretService::get_shared_secret`] with errors mapped for the connector
    pub fn handle(&self, request: &SharedSecretRequest) -> Result<WrappedKeyResponse, ExternalError> {
        self.get_shared_secret(request)
            .map_err(|e| e.to_external(self.config.denial_policy))
    }

    /// Key information for a connector: metadata and check value, never key data.
    ///
    /// Authorized and gated like retrieval: only `Active` versions, never a
    /// master key, and a transport key only to its own connector. Metadata
    /// for other versions comes from [`KeyRecordStore::list_versions`].
    pub fn show_key(&self, connector_id: &str, key_id: &str, version: Option<u32>) -> TksResult<KeyInfo> {
        let result = self.describe(connector_id, key_id, version);

        let audited_version = match &result {
            Ok(info) => Some(info.version),
            Err(_) => version,
        };
        self.audit.record(
            AuditEvent::new(AuditOperation::ShowKey)
                .key(&KeyIdentifier::from(key_id), audited_version)
                .connector(Some(connector_id))
                .outcome(&result),
        );
        result
    }

    /// [`SharedSecretService::show_key`] with errors mapped for the connector
    pub fn handle_show_key(&self, connector_id: &str, key_id: &str, version: Option<u32>) -> Result<KeyInfo, ExternalError> {
        self.show_key(connector_id, key_id, version)
            .map_err(|e| e.to_external(self.config.denial_policy))
    }

    /// Provision a new key with random material under the configured master key.
    ///
    /// The id must not exist yet; use [`SharedSecretService::rotate_key`] for
    /// a new version of an existing key.
    pub fn provision_key(&self, spec: KeySpec) -> TksResult<Arc<KeyRecord>> {
        let master = self.vault.current_master(&self.config.master_key_id)?;
        let id = spec.id.clone();
        let record = self.vault.generate_record(spec, &master, FIRST_VERSION)?;
        self.store.put(record)?;
        self.store.get_version(id.as_str(), FIRST_VERSION)
    }

    /// Provision a new key with supplied material under the configured master key
    pub fn import_key(&self, spec: KeySpec, material: &[u8]) -> TksResult<Arc<KeyRecord>> {
        let master = self.vault.current_master(&self.config.master_key_id)?;
        let id = spec.id.clone();
        let record = self.vault.import_record(spec, &master, FIRST_VERSION, material)?;
        self.store.put(record)?;
        self.store.get_version(id.as_str(), FIRST_VERSION)
    }

    /// Replace the current version of a key with fresh random material
    pub fn rotate_key(&self, key_id: &str) -> TksResult<Arc<KeyRecord>> {
        let master = self.vault.current_master(&self.config.master_key_id)?;
        self.store.rotate(key_id, |current| {
            let mut spec = KeySpec::new(current.id.clone(), current.key_type, current.algorithm);
            spec.derivation_scheme = current.derivation_scheme;
            self.vault.generate_record(spec, &master, current.version + 1)
        })
    }

    /// Re-wrap every version of a key that is not under the current master version.
    ///
    /// Returns how many versions moved.
    pub fn rewrap_key(&self, key_id: &str) -> TksResult<usize> {
        let versions = self.store.snapshot()?.versions(key_id);
        if versions.is_empty() {
            return Err(TksError::key_not_found(key_id));
        }

        let mut moved = 0;
        for record in versions {
            let current = self.vault.current_master(&record.wrapping_key.key_id)?;
            if record.wrapping_key == current {
                continue;
            }
            let rewrapped = self.vault.rewrap_record(&record, &AuditContext::admin())?;
            self.store.update(rewrapped)?;
            moved += 1;
        }
        if moved > 0 {
            log::info!("Re-wrapped {} versions of {}", moved, key_id);
        }
        Ok(moved)
    }

    fn process(&self, request: &SharedSecretRequest) -> TksResult<WrappedKeyResponse> {
        let key_id = request.key_id.as_str();

        let connector = self.registry.authorize(&request.connector_id, key_id)?;
        let record = self.store.get_active(key_id, request.key_version)?;
        let plan = self.plan_derivation(&connector, &record, request)?;
        let transport_record = self.transport_record(&connector)?;

        let ctx = AuditContext::connector(connector.connector_id.as_str());
        let transport = self.vault.unwrap(&transport_record, &ctx)?;
        let key = self.vault.unwrap(&record, &ctx)?;
        let aad = wrapping::transport_aad(&record.id, record.version);

        let (wrapped_bytes, wrapping_scheme, check_value, derivation) = match plan {
            None => {
                let scheme = self.config.static_wrapping;
                let check_value = self.vault.check_value(&key)?;
                let wrapped = self
                    .vault
                    .transport_wrap(&transport, TransportPayload::Key(&key), scheme, &aad, &ctx)?;
                (wrapped, scheme, Some(check_value), None)
            }
            Some(plan) => {
                let scheme = self.config.session_wrapping;
                let keys = self.vault.derive(&key, &plan.diversifier, plan.scheme, &ctx)?;

                let roles = keys.roles();
                let mut check_values = Vec::with_capacity(roles.len());
                for role in &roles {
                    check_values.push(hex::encode_upper(keys.check_value(*role)?));
                }

                let wrapped = self.vault.transport_wrap(
                    &transport,
                    TransportPayload::Session {
                        family: &key,
                        keys: &keys,
                    },
                    scheme,
                    &aad,
                    &ctx,
                )?;
                let derivation = DerivationInfo {
                    scheme: plan.scheme,
                    diversifier: plan.diversifier.to_hex(),
                    roles,
                    check_values,
                };
                (wrapped, scheme, None, Some(derivation))
            }
        };

        // A grant revoked while this request was in flight wins
        self.registry.authorize(&request.connector_id, key_id)?;

        Ok(WrappedKeyResponse {
            key_id: record.id.clone(),
            algorithm: record.algorithm,
            version: record.version,
            wrapped_bytes,
            wrapping_scheme,
            transport_key_id: transport_record.id.clone(),
            transport_key_version: transport_record.version,
            check_value,
            derivation,
        })
    }

    /// Master keys are never released, and a transport key only to the
    /// connector it belongs to, whatever the connector's grants say.
    fn ensure_releasable(connector: &Connector, record: &KeyRecord) -> TksResult<()> {
        let releasable = match record.key_type {
            KeyType::Master => false,
            KeyType::Transport => record.id == connector.transport_key_id,
            KeyType::SharedSecret | KeyType::Session => true,
        };
        if releasable {
            Ok(())
        } else {
            Err(TksError::NotAuthorized {
                connector_id: connector.connector_id.clone(),
                key_id: record.id.to_string(),
            })
        }
    }

    /// Validate scheme and diversifier against the record's key type
    fn plan_derivation(
        &self,
        connector: &Connector,
        record: &KeyRecord,
        request: &SharedSecretRequest,
    ) -> TksResult<Option<DerivationPlan>> {
        Self::ensure_releasable(connector, record)?;
        match record.key_type {
            KeyType::Master | KeyType::SharedSecret | KeyType::Transport => match &request.diversifier {
                Some(bytes) => Err(TksError::invalid_diversifier(
                    &format!("none for {} keys", record.key_type),
                    &format!("{} bytes", bytes.len()),
                )),
                None => Ok(None),
            },
            KeyType::Session => {
                let scheme = self.resolve_scheme(record, request.scheme)?;
                let bytes = request
                    .diversifier
                    .as_deref()
                    .ok_or_else(|| TksError::invalid_diversifier(
                        &format!("{} bytes for {}", scheme.diversifier_len(), scheme),
                        "none",
                    ))?;
                let diversifier = Diversifier::parse(bytes, scheme)?;
                Ok(Some(DerivationPlan { scheme, diversifier }))
            }
        }
    }

    /// The family's pinned scheme, or the configured default. Never substituted.
    fn resolve_scheme(&self, record: &KeyRecord, requested: Option<DerivationScheme>) -> TksResult<DerivationScheme> {
        let scheme = record
            .derivation_scheme
            .unwrap_or_else(|| self.config.default_scheme_for(record.algorithm));

        if let Some(requested) = requested {
            if requested != scheme {
                return Err(TksError::unsupported_scheme(
                    requested,
                    &format!("{} is pinned to {}", record.id, scheme),
                ));
            }
        }
        scheme.ensure_accepts(record.algorithm)?;
        Ok(scheme)
    }

    fn transport_record(&self, connector: &Connector) -> TksResult<Arc<KeyRecord>> {
        let record = self
            .store
            .get_active(connector.transport_key_id.as_str(), None)?;
        if record.key_type != KeyType::Transport {
            return Err(TksError::invalid_operation(
                "transport_key",
                &format!("{} is not a transport key", record.id),
            ));
        }
        Ok(record)
    }

    fn describe(&self, connector_id: &str, key_id: &str, version: Option<u32>) -> TksResult<KeyInfo> {
        let connector = self.registry.authorize(connector_id, key_id)?;
        let record = self.store.get_active(key_id, version)?;
        Self::ensure_releasable(&connector, &record)?;

        let handle = self
            .vault
            .unwrap(&record, &AuditContext::connector(connector_id))?;
        let mut info = record.info();
        info.check_value = Some(self.vault.check_value(&handle)?);
        Ok(info)
    }
}
