use aes::Aes192;
use aes_gcm::{
    aead::{consts::U12, Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
};

use crate::error::{TksError, TksResult};
use crate::secure_memory::SecureBytes;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Length of the GCM nonce prepended to every sealed blob
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag appended to every sealed blob
pub const TAG_LEN: usize = 16;

/// AES-GCM keyed with a 128, 192 or 256-bit key
///
/// Sealed blobs are laid out as `nonce || ciphertext || tag`.
///
/// # Examples
///
/// ```
/// use tks::wrapping::GcmCipher;
///
/// let cipher = GcmCipher::new(&[0x42; 32]).unwrap();
/// let sealed = cipher.seal(b"key bytes", b"context").unwrap();
/// let opened = cipher.open(&sealed, b"context").unwrap();
/// assert_eq!(opened.as_bytes(), b"key bytes");
/// assert!(cipher.open(&sealed, b"other context").is_err());
/// ```
pub enum GcmCipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl std::fmt::Debug for GcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GcmCipher::Aes128(_) => "[AES-128-GCM Cipher]",
            GcmCipher::Aes192(_) => "[AES-192-GCM Cipher]",
            GcmCipher::Aes256(_) => "[AES-256-GCM Cipher]",
        };
        f.debug_struct("GcmCipher").field("cipher", &name).finish()
    }
}

impl GcmCipher {
    /// Create a cipher from a raw AES key
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeyMaterial` if the key is not 16, 24 or 32 bytes long
    pub fn new(key: &[u8]) -> TksResult<Self> {
        let invalid = |_| TksError::invalid_key_material("gcm_init", "key rejected by cipher");
        let cipher = match key.len() {
            16 => GcmCipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
            24 => GcmCipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?),
            32 => GcmCipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
            other => {
                return Err(TksError::invalid_key_material(
                    "gcm_init",
                    &format!("AES-GCM requires a 16, 24 or 32 byte key, got {}", other),
                ))
            }
        };
        Ok(cipher)
    }

    /// Generate a random 96-bit nonce
    pub fn generate_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&Aes256Gcm::generate_nonce(&mut OsRng));
        nonce
    }

    /// Encrypt under a fresh random nonce
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> TksResult<Vec<u8>> {
        self.seal_with_nonce(&Self::generate_nonce(), plaintext, aad)
    }

    /// Encrypt under a caller-chosen nonce. The nonce must never repeat for a key.
    pub fn seal_with_nonce(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> TksResult<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        let nonce_ref = Nonce::from_slice(nonce);
        let ciphertext = match self {
            GcmCipher::Aes128(c) => c.encrypt(nonce_ref, payload),
            GcmCipher::Aes192(c) => c.encrypt(nonce_ref, payload),
            GcmCipher::Aes256(c) => c.encrypt(nonce_ref, payload),
        }
        .map_err(|_| TksError::invalid_key_material("gcm_seal", "encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt and authenticate a blob produced by [`GcmCipher::seal`]
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> TksResult<SecureBytes> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(TksError::invalid_key_material("gcm_open", "sealed blob too short"));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let payload = Payload { msg: ciphertext, aad };
        let nonce_ref = Nonce::from_slice(nonce);
        let plaintext = match self {
            GcmCipher::Aes128(c) => c.decrypt(nonce_ref, payload),
            GcmCipher::Aes192(c) => c.decrypt(nonce_ref, payload),
            GcmCipher::Aes256(c) => c.decrypt(nonce_ref, payload),
        }
        .map_err(|_| TksError::invalid_key_material("gcm_open", "authentication failed"))?;

        Ok(SecureBytes::from(plaintext))
    }
}
