/*!
 * Token Key Diversification Engine
 *
 * Derives the per-token ENC, MAC and KEK keys of a card from a key family
 * master key and the card's key derivation data (KDD). Every function here is
 * pure: identical inputs always give identical bytes, so a card personalized
 * with the same scheme holds matching keys.
 *
 * Schemes are pinned by identifier. A scheme only accepts the algorithms it
 * was defined for; anything else fails closed with `UnsupportedScheme`.
 */

mod des3;
mod scp03;


use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::block;
use crate::error::{TksError, TksResult};
use crate::model::KeyAlgorithm;
use crate::secure_memory::SecureBytes;

/// Length of GlobalPlatform key derivation data
pub const KDD_LEN: usize = 10;

/// Pinned key diversification schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationScheme {
    /// GlobalPlatform VISA2 layout, two-key triple DES in ECB
    Visa2,
    /// GlobalPlatform EMV CPS layout, two-key triple DES in ECB
    Emv,
    /// NIST SP 800-108 counter mode with AES-CMAC, GlobalPlatform SCP03 data layout
    Scp03,
}

impl DerivationScheme {
    /// Versioned identifier agreed with connectors
    pub fn identifier(&self) -> &'static str {
        match self {
            DerivationScheme::Visa2 => "GP-VISA2/1",
            DerivationScheme::Emv => "GP-EMV-CPS/1",
            DerivationScheme::Scp03 => "GP-SCP03-KDF/1",
        }
    }

    pub fn accepts(&self, algorithm: KeyAlgorithm) -> bool {
        match self {
            DerivationScheme::Visa2 | DerivationScheme::Emv => algorithm == KeyAlgorithm::Des3,
            DerivationScheme::Scp03 => algorithm.is_aes(),
        }
    }

    pub fn diversifier_len(&self) -> usize {
        match self {
            DerivationScheme::Visa2 | DerivationScheme::Emv | DerivationScheme::Scp03 => KDD_LEN,
        }
    }

    /// Check that `algorithm` belongs to this scheme
    pub fn ensure_accepts(&self, algorithm: KeyAlgorithm) -> TksResult<()> {
        if self.accepts(algorithm) {
            Ok(())
        } else {
            Err(TksError::unsupported_scheme(
                self.identifier(),
                &format!("not defined for {} keys", algorithm),
            ))
        }
    }
}

impl fmt::Display for DerivationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for DerivationScheme {
    type Err = TksError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GP-VISA2/1" | "visa2" => Ok(DerivationScheme::Visa2),
            "GP-EMV-CPS/1" | "emv" => Ok(DerivationScheme::Emv),
            "GP-SCP03-KDF/1" | "scp03" => Ok(DerivationScheme::Scp03),
            other => Err(TksError::unsupported_scheme(other, "unknown scheme identifier")),
        }
    }
}

/// Token key derivation data, validated against a scheme
#[derive(Clone, PartialEq, Eq)]
pub struct Diversifier {
    kdd: [u8; KDD_LEN],
}

impl Diversifier {
    /// Validate raw diversifier bytes for `scheme`
    pub fn parse(bytes: &[u8], scheme: DerivationScheme) -> TksResult<Self> {
        let expected = scheme.diversifier_len();
        if bytes.len() != expected {
            return Err(TksError::invalid_diversifier(
                &format!("{} bytes for {}", expected, scheme),
                &format!("{} bytes", bytes.len()),
            ));
        }

        let mut kdd = [0u8; KDD_LEN];
        kdd.copy_from_slice(bytes);
        Ok(Self { kdd })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.kdd
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.kdd)
    }
}

impl fmt::Debug for Diversifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Diversifier({})", self.to_hex())
    }
}

impl fmt::Display for Diversifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Role of one derived key within a session key set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKeyRole {
    Enc,
    Mac,
    Kek,
}

impl SessionKeyRole {
    /// Roles in payload order
    pub const ALL: [SessionKeyRole; 3] = [SessionKeyRole::Enc, SessionKeyRole::Mac, SessionKeyRole::Kek];

    /// GlobalPlatform key index used by the DES3 layouts
    fn gp_index(&self) -> u8 {
        match self {
            SessionKeyRole::Enc => 0x01,
            SessionKeyRole::Mac => 0x02,
            SessionKeyRole::Kek => 0x03,
        }
    }

    /// Derivation constant used in the SCP03 label
    fn scp03_constant(&self) -> u8 {
        match self {
            SessionKeyRole::Enc => 0x04,
            SessionKeyRole::Mac => 0x06,
            SessionKeyRole::Kek => 0x05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionKey {
    role: SessionKeyRole,
    material: SecureBytes,
}

/// Keys derived for one token interaction.
///
/// Never persisted. The material is zeroed when the set is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeySet {
    scheme: DerivationScheme,
    algorithm: KeyAlgorithm,
    diversifier: Diversifier,
    keys: Vec<SessionKey>,
}

impl SessionKeySet {
    pub fn scheme(&self) -> DerivationScheme {
        self.scheme
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn diversifier(&self) -> &Diversifier {
        &self.diversifier
    }

    pub fn roles(&self) -> Vec<SessionKeyRole> {
        self.keys.iter().map(|k| k.role).collect()
    }

    /// Check value of one derived key
    pub fn check_value(&self, role: SessionKeyRole) -> TksResult<[u8; block::CHECK_VALUE_LEN]> {
        let material = self
            .material(role)
            .ok_or_else(|| TksError::invalid_key_material("check_value", "role not derived"))?;
        block::key_check_value(self.algorithm, material)
    }

    pub(crate) fn material(&self, role: SessionKeyRole) -> Option<&[u8]> {
        self.keys
            .iter()
            .find(|k| k.role == role)
            .map(|k| k.material.as_bytes())
    }

    /// `ENC || MAC || KEK`, the layout wrapped for transport
    pub(crate) fn payload(&self) -> SecureBytes {
        let mut payload = SecureBytes::zeroed(0);
        for role in SessionKeyRole::ALL {
            if let Some(material) = self.material(role) {
                payload.extend_from_slice(material);
            }
        }
        payload
    }
}

/// Derive the ENC, MAC and KEK keys of one token.
///
/// # Arguments
///
/// * `master` - Raw family master key; must match `algorithm`
/// * `algorithm` - Algorithm of the master key and of the derived keys
/// * `diversifier` - The token's key derivation data
/// * `scheme` - Pinned derivation scheme
///
/// # Errors
///
/// * `UnsupportedScheme` if `scheme` is not defined for `algorithm`
/// * `InvalidKeyMaterial` if the master key has the wrong length
pub fn derive_session_keys(
    master: &[u8],
    algorithm: KeyAlgorithm,
    diversifier: &Diversifier,
    scheme: DerivationScheme,
) -> TksResult<SessionKeySet> {
    scheme.ensure_accepts(algorithm)?;
    if master.len() != algorithm.key_len() {
        return Err(TksError::invalid_key_material(
            "derive",
            &format!("{} master key must be {} bytes", algorithm, algorithm.key_len()),
        ));
    }

    let mut keys = Vec::with_capacity(SessionKeyRole::ALL.len());
    for role in SessionKeyRole::ALL {
        let material = match scheme {
            DerivationScheme::Visa2 => des3::derive_visa2(master, diversifier, role.gp_index())?,
            DerivationScheme::Emv => des3::derive_emv(master, diversifier, role.gp_index())?,
            DerivationScheme::Scp03 => {
                scp03::derive(master, algorithm, diversifier, role.scp03_constant())?
            }
        };
        keys.push(SessionKey { role, material });
    }

    log::debug!(
        "Derived {} session keys with {} for KDD {}",
        keys.len(),
        scheme,
        diversifier
    );

    Ok(SessionKeySet {
        scheme,
        algorithm,
        diversifier: diversifier.clone(),
        keys,
    })
}
