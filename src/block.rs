//! Raw block cipher operations over DES3 and AES keys.
//!
//! Only the diversification engine, the key wrap and check value code use
//! these; nothing here leaves the crate.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use des::TdesEde2;

use crate::error::{TksError, TksResult};
use crate::model::KeyAlgorithm;

pub(crate) const DES_BLOCK_LEN: usize = 8;
pub(crate) const AES_BLOCK_LEN: usize = 16;

/// Length of a key check value in bytes
pub const CHECK_VALUE_LEN: usize = 3;

/// A keyed block cipher instance
pub(crate) enum BlockCipher {
    Des3(TdesEde2),
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockCipher {
    pub(crate) fn new(algorithm: KeyAlgorithm, key: &[u8]) -> TksResult<Self> {
        if key.len() != algorithm.key_len() {
            return Err(TksError::invalid_key_material(
                "cipher_init",
                &format!(
                    "{} requires {} key bytes, got {}",
                    algorithm,
                    algorithm.key_len(),
                    key.len()
                ),
            ));
        }

        let invalid = |_| TksError::invalid_key_material("cipher_init", "key rejected by cipher");
        let cipher = match algorithm {
            KeyAlgorithm::Des3 => BlockCipher::Des3(TdesEde2::new_from_slice(key).map_err(invalid)?),
            KeyAlgorithm::Aes128 => BlockCipher::Aes128(Aes128::new_from_slice(key).map_err(invalid)?),
            KeyAlgorithm::Aes192 => BlockCipher::Aes192(Aes192::new_from_slice(key).map_err(invalid)?),
            KeyAlgorithm::Aes256 => BlockCipher::Aes256(Aes256::new_from_slice(key).map_err(invalid)?),
        };
        Ok(cipher)
    }

    /// AES instance chosen by key length
    pub(crate) fn new_aes(key: &[u8]) -> TksResult<Self> {
        let algorithm = KeyAlgorithm::aes_for_len(key.len()).ok_or_else(|| {
            TksError::invalid_key_material(
                "cipher_init",
                &format!("AES requires 16, 24 or 32 key bytes, got {}", key.len()),
            )
        })?;
        Self::new(algorithm, key)
    }

    pub(crate) fn block_len(&self) -> usize {
        match self {
            BlockCipher::Des3(_) => DES_BLOCK_LEN,
            _ => AES_BLOCK_LEN,
        }
    }

    pub(crate) fn encrypt_block(&self, block: &mut [u8]) -> TksResult<()> {
        self.check_block(block)?;
        match self {
            BlockCipher::Des3(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes128(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes192(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes256(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
        }
        Ok(())
    }

    pub(crate) fn decrypt_block(&self, block: &mut [u8]) -> TksResult<()> {
        self.check_block(block)?;
        match self {
            BlockCipher::Des3(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes128(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes192(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes256(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
        }
        Ok(())
    }

    /// ECB over whole blocks, in place
    pub(crate) fn encrypt_ecb(&self, data: &mut [u8]) -> TksResult<()> {
        let block_len = self.block_len();
        if data.len() % block_len != 0 {
            return Err(TksError::invalid_key_material(
                "ecb_encrypt",
                "input is not a whole number of blocks",
            ));
        }
        for block in data.chunks_exact_mut(block_len) {
            self.encrypt_block(block)?;
        }
        Ok(())
    }

    fn check_block(&self, block: &[u8]) -> TksResult<()> {
        if block.len() != self.block_len() {
            return Err(TksError::invalid_key_material(
                "block_cipher",
                &format!("expected {}-byte block, got {}", self.block_len(), block.len()),
            ));
        }
        Ok(())
    }
}

/// Key check value: the first three bytes of a fixed block encrypted under the key.
///
/// DES3 encrypts eight zero bytes; AES encrypts sixteen `0x01` bytes, the
/// GlobalPlatform SCP03 convention.
pub fn key_check_value(algorithm: KeyAlgorithm, key: &[u8]) -> TksResult<[u8; CHECK_VALUE_LEN]> {
    let cipher = BlockCipher::new(algorithm, key)?;
    let mut block = match algorithm {
        KeyAlgorithm::Des3 => vec![0x00u8; DES_BLOCK_LEN],
        _ => vec![0x01u8; AES_BLOCK_LEN],
    };
    cipher.encrypt_block(&mut block)?;

    let mut kcv = [0u8; CHECK_VALUE_LEN];
    kcv.copy_from_slice(&block[..CHECK_VALUE_LEN]);
    Ok(kcv)
}

/// Force odd parity on every byte of a DES key
pub(crate) fn adjust_des_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        let high = *byte & 0xFE;
        *byte = high | u8::from(high.count_ones() % 2 == 0);
    }
}
