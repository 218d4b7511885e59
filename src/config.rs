/*!
 * Service Configuration
 *
 * Loaded from JSON. Every field has a default, so `{}` is a valid
 * configuration for an in-memory service.
 */

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::diversification::DerivationScheme;
use crate::error::{DenialPolicy, TksError, TksResult};
use crate::model::{KeyAlgorithm, KeyIdentifier};
use crate::registry::Connector;
use crate::wrapping::WrappingScheme;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Key store file; `None` keeps records in memory
    pub store_path: Option<PathBuf>,

    /// How identity and authorization failures are reported to connectors
    pub denial_policy: DenialPolicy,

    /// Transport wrapping for static shared secrets and transport keys
    pub static_wrapping: WrappingScheme,

    /// Transport wrapping for derived session key sets
    pub session_wrapping: WrappingScheme,

    /// Scheme for DES3 session families that do not pin one
    pub default_scheme_des3: DerivationScheme,

    /// Scheme for AES session families that do not pin one
    pub default_scheme_aes: DerivationScheme,

    /// Master key used when provisioning new records
    pub master_key_id: KeyIdentifier,

    /// Connectors registered at start
    pub connectors: Vec<Connector>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            denial_policy: DenialPolicy::Unified,
            static_wrapping: WrappingScheme::AesKeyWrapPad,
            session_wrapping: WrappingScheme::AesGcm,
            default_scheme_des3: DerivationScheme::Visa2,
            default_scheme_aes: DerivationScheme::Scp03,
            master_key_id: KeyIdentifier::from("tks-master"),
            connectors: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> TksResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            TksError::configuration("path", &format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> TksResult<Self> {
        let config: ServiceConfig = serde_json::from_str(json)
            .map_err(|e| TksError::configuration("json", &e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// `~/.tks/keystore.json`, or `./.tks/keystore.json` without a home directory
    pub fn default_store_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".tks");
        path.push("keystore.json");
        path
    }

    /// Default scheme for a session family of `algorithm`
    pub fn default_scheme_for(&self, algorithm: KeyAlgorithm) -> DerivationScheme {
        if algorithm.is_aes() {
            self.default_scheme_aes
        } else {
            self.default_scheme_des3
        }
    }

    pub fn validate(&self) -> TksResult<()> {
        if !self.default_scheme_des3.accepts(KeyAlgorithm::Des3) {
            return Err(TksError::configuration(
                "default_scheme_des3",
                &format!("{} does not derive DES3 keys", self.default_scheme_des3),
            ));
        }
        if !self.default_scheme_aes.accepts(KeyAlgorithm::Aes128) {
            return Err(TksError::configuration(
                "default_scheme_aes",
                &format!("{} does not derive AES keys", self.default_scheme_aes),
            ));
        }
        if self.master_key_id.as_str().is_empty() {
            return Err(TksError::configuration("master_key_id", "must not be empty"));
        }

        let mut seen = HashSet::new();
        for connector in &self.connectors {
            if connector.connector_id.is_empty() {
                return Err(TksError::configuration("connectors", "connector id must not be empty"));
            }
            if !seen.insert(connector.connector_id.as_str()) {
                return Err(TksError::configuration(
                    "connectors",
                    &format!("duplicate connector {}", connector.connector_id),
                ));
            }
        }
        Ok(())
    }
}
