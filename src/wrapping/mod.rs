/*!
 * Transport Key Wrapping
 *
 * Protects released key material under a connector's transport key. Two
 * wrapping schemes are supported:
 *
 * - `AesKeyWrapPad`: RFC 5649 AES key wrap with padding. Deterministic, so the
 *   same key under the same transport key always gives the same bytes.
 * - `AesGcm`: AES-GCM with a random 96-bit nonce, authenticating the key
 *   identifier and version as associated data.
 *
 * Transport keys must be AES keys. A DES3 transport key is rejected with
 * `UnsupportedScheme`.
 */

mod gcm;
mod key_wrap;


use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TksError, TksResult};
use crate::model::{KeyAlgorithm, KeyIdentifier};
use crate::secure_memory::SecureBytes;

pub use gcm::{GcmCipher, NONCE_LEN, TAG_LEN};

/// Scheme used to wrap key material for a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrappingScheme {
    AesKeyWrapPad,
    AesGcm,
}

impl WrappingScheme {
    pub fn identifier(&self) -> &'static str {
        match self {
            WrappingScheme::AesKeyWrapPad => "AES-KWP/RFC5649",
            WrappingScheme::AesGcm => "AES-GCM/96",
        }
    }

    /// Whether equal inputs always give equal wrapped bytes
    pub fn is_deterministic(&self) -> bool {
        matches!(self, WrappingScheme::AesKeyWrapPad)
    }
}

impl fmt::Display for WrappingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Associated data binding a transport blob to a key identifier and version
pub fn transport_aad(key_id: &KeyIdentifier, version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(key_id.as_str().len() + 5);
    aad.extend_from_slice(key_id.as_str().as_bytes());
    aad.push(0x00);
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

/// Wrap `payload` under a connector transport key.
///
/// `aad` is authenticated by `AesGcm` only; RFC 5649 has no associated data.
pub(crate) fn wrap_for_transport(
    transport_key: &[u8],
    transport_algorithm: KeyAlgorithm,
    scheme: WrappingScheme,
    payload: &[u8],
    aad: &[u8],
) -> TksResult<Vec<u8>> {
    ensure_transport_algorithm(transport_algorithm, scheme)?;

    match scheme {
        WrappingScheme::AesKeyWrapPad => key_wrap::wrap_pad(transport_key, payload),
        WrappingScheme::AesGcm => GcmCipher::new(transport_key)?.seal(payload, aad),
    }
}

/// Recover key material from a transport blob.
///
/// This is the receiving connector's half of [`WrappingScheme`]; the service
/// itself never unwraps transport blobs.
pub fn unwrap_transport(
    transport_key: &[u8],
    scheme: WrappingScheme,
    wrapped: &[u8],
    aad: &[u8],
) -> TksResult<SecureBytes> {
    match scheme {
        WrappingScheme::AesKeyWrapPad => key_wrap::unwrap_pad(transport_key, wrapped),
        WrappingScheme::AesGcm => GcmCipher::new(transport_key)?.open(wrapped, aad),
    }
}

fn ensure_transport_algorithm(algorithm: KeyAlgorithm, scheme: WrappingScheme) -> TksResult<()> {
    if algorithm.is_aes() {
        Ok(())
    } else {
        Err(TksError::unsupported_scheme(
            scheme,
            &format!("{} transport keys cannot wrap", algorithm),
        ))
    }
}
