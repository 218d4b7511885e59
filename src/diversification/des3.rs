// Triple-DES key diversification.
//
// Both layouts build a 16-byte derivation block from the KDD and a key
// index, encrypt it in ECB under the family master key and use the result,
// parity adjusted, as a two-key triple DES key.

use super::{Diversifier, KDD_LEN};
use crate::block::{self, BlockCipher};
use crate::error::TksResult;
use crate::model::KeyAlgorithm;
use crate::secure_memory::SecureBytes;

/// `KDD[0] KDD[1] KDD[4..8] F0 idx || KDD[0] KDD[1] KDD[4..8] 0F idx`
pub(super) fn visa2_block(kdd: &[u8; KDD_LEN], index: u8) -> [u8; 16] {
    [
        kdd[0], kdd[1], kdd[4], kdd[5], kdd[6], kdd[7], 0xF0, index,
        kdd[0], kdd[1], kdd[4], kdd[5], kdd[6], kdd[7], 0x0F, index,
    ]
}

/// `KDD[4..10] F0 idx || KDD[4..10] 0F idx`
pub(super) fn emv_block(kdd: &[u8; KDD_LEN], index: u8) -> [u8; 16] {
    [
        kdd[4], kdd[5], kdd[6], kdd[7], kdd[8], kdd[9], 0xF0, index,
        kdd[4], kdd[5], kdd[6], kdd[7], kdd[8], kdd[9], 0x0F, index,
    ]
}

pub(super) fn derive_visa2(
    master: &[u8],
    diversifier: &Diversifier,
    index: u8,
) -> TksResult<SecureBytes> {
    encrypt_block_pair(master, visa2_block(&diversifier.kdd, index))
}

pub(super) fn derive_emv(
    master: &[u8],
    diversifier: &Diversifier,
    index: u8,
) -> TksResult<SecureBytes> {
    encrypt_block_pair(master, emv_block(&diversifier.kdd, index))
}

fn encrypt_block_pair(master: &[u8], data: [u8; 16]) -> TksResult<SecureBytes> {
    let cipher = BlockCipher::new(KeyAlgorithm::Des3, master)?;
    let mut derived = SecureBytes::new(&data);
    cipher.encrypt_ecb(derived.as_bytes_mut())?;
    block::adjust_des_parity(derived.as_bytes_mut());
    Ok(derived)
}
