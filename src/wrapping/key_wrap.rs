// AES key wrap with padding, RFC 5649, over the RFC 3394 wrapping core.
//
// Wrapping is deterministic: the same KEK and key always give the same
// ciphertext. Every unwrap failure reports the same error so callers cannot
// tell an integrity failure from a padding failure.

use subtle::ConstantTimeEq;

use crate::block::{BlockCipher, AES_BLOCK_LEN};
use crate::error::{TksError, TksResult};
use crate::secure_memory::SecureBytes;

const SEMIBLOCK: usize = 8;

/// RFC 5649 alternative IV prefix
const AIV_PREFIX: [u8; 4] = [0xA6, 0x59, 0x59, 0xA6];

/// RFC 3394 default IV
#[cfg(test)]
pub(super) const DEFAULT_IV: [u8; SEMIBLOCK] = [0xA6; SEMIBLOCK];

/// Wrap `key` under `kek`, padding to a whole number of semiblocks
pub(crate) fn wrap_pad(kek: &[u8], key: &[u8]) -> TksResult<Vec<u8>> {
    if key.is_empty() {
        return Err(TksError::invalid_key_material("key_wrap", "nothing to wrap"));
    }
    if key.len() > u32::MAX as usize {
        return Err(TksError::invalid_key_material("key_wrap", "input too long"));
    }

    let cipher = BlockCipher::new_aes(kek)?;

    let mut aiv = [0u8; SEMIBLOCK];
    aiv[..4].copy_from_slice(&AIV_PREFIX);
    aiv[4..].copy_from_slice(&(key.len() as u32).to_be_bytes());

    let padded_len = key.len().div_ceil(SEMIBLOCK) * SEMIBLOCK;
    let mut padded = SecureBytes::zeroed(padded_len);
    padded.as_bytes_mut()[..key.len()].copy_from_slice(key);

    if padded_len == SEMIBLOCK {
        // A single semiblock is encrypted as one AES block with the AIV
        let mut block = [0u8; AES_BLOCK_LEN];
        block[..SEMIBLOCK].copy_from_slice(&aiv);
        block[SEMIBLOCK..].copy_from_slice(padded.as_bytes());
        cipher.encrypt_block(&mut block)?;
        return Ok(block.to_vec());
    }

    wrap_blocks(&cipher, aiv, padded.as_bytes())
}

/// Reverse [`wrap_pad`], checking the AIV and the zero padding
pub(crate) fn unwrap_pad(kek: &[u8], wrapped: &[u8]) -> TksResult<SecureBytes> {
    if wrapped.len() < AES_BLOCK_LEN || wrapped.len() % SEMIBLOCK != 0 {
        return Err(TksError::invalid_key_material(
            "key_unwrap",
            "wrapped length must be a multiple of 8 and at least 16",
        ));
    }

    let cipher = BlockCipher::new_aes(kek)?;

    let (aiv, padded) = if wrapped.len() == AES_BLOCK_LEN {
        let mut block = SecureBytes::new(wrapped);
        cipher.decrypt_block(block.as_bytes_mut())?;
        let mut aiv = [0u8; SEMIBLOCK];
        aiv.copy_from_slice(&block.as_bytes()[..SEMIBLOCK]);
        (aiv, SecureBytes::new(&block.as_bytes()[SEMIBLOCK..]))
    } else {
        unwrap_blocks(&cipher, wrapped)?
    };

    let plain_len = check_aiv(&aiv, padded.as_bytes())
        .ok_or_else(|| TksError::invalid_key_material("key_unwrap", "integrity check failed"))?;

    Ok(SecureBytes::new(&padded.as_bytes()[..plain_len]))
}

/// Validate the AIV against the padded plaintext, returning the message length.
///
/// The prefix and padding are compared in constant time.
fn check_aiv(aiv: &[u8; SEMIBLOCK], padded: &[u8]) -> Option<usize> {
    let prefix_ok = aiv[..4].ct_eq(&AIV_PREFIX);

    let mut mli_bytes = [0u8; 4];
    mli_bytes.copy_from_slice(&aiv[4..]);
    let mli = u32::from_be_bytes(mli_bytes) as usize;

    let n = padded.len() / SEMIBLOCK;
    if mli <= SEMIBLOCK * (n - 1) || mli > SEMIBLOCK * n {
        return None;
    }

    let mut pad = 0u8;
    for byte in &padded[mli..] {
        pad |= *byte;
    }

    if bool::from(prefix_ok & pad.ct_eq(&0)) {
        Some(mli)
    } else {
        None
    }
}

/// RFC 3394 section 2.2.1 wrapping process with an explicit initial value
pub(super) fn wrap_blocks(cipher: &BlockCipher, iv: [u8; SEMIBLOCK], data: &[u8]) -> TksResult<Vec<u8>> {
    if data.len() % SEMIBLOCK != 0 || data.len() < 2 * SEMIBLOCK {
        return Err(TksError::invalid_key_material(
            "key_wrap",
            "input must be at least two whole semiblocks",
        ));
    }

    let n = data.len() / SEMIBLOCK;
    let mut a = iv;
    let mut r = SecureBytes::new(data);
    let mut block = SecureBytes::zeroed(AES_BLOCK_LEN);

    for j in 0..6 {
        for i in 0..n {
            let semiblock = &mut r.as_bytes_mut()[i * SEMIBLOCK..(i + 1) * SEMIBLOCK];
            block.as_bytes_mut()[..SEMIBLOCK].copy_from_slice(&a);
            block.as_bytes_mut()[SEMIBLOCK..].copy_from_slice(semiblock);
            cipher.encrypt_block(block.as_bytes_mut())?;

            let t = ((n * j) + i + 1) as u64;
            a.copy_from_slice(&block.as_bytes()[..SEMIBLOCK]);
            for (byte, counter) in a.iter_mut().zip(t.to_be_bytes()) {
                *byte ^= counter;
            }
            semiblock.copy_from_slice(&block.as_bytes()[SEMIBLOCK..]);
        }
    }

    let mut output = Vec::with_capacity(data.len() + SEMIBLOCK);
    output.extend_from_slice(&a);
    output.extend_from_slice(r.as_bytes());
    Ok(output)
}

/// RFC 3394 section 2.2.2 unwrapping process; returns the recovered IV and data
pub(super) fn unwrap_blocks(cipher: &BlockCipher, wrapped: &[u8]) -> TksResult<([u8; SEMIBLOCK], SecureBytes)> {
    if wrapped.len() % SEMIBLOCK != 0 || wrapped.len() < 3 * SEMIBLOCK {
        return Err(TksError::invalid_key_material(
            "key_unwrap",
            "input must be at least three whole semiblocks",
        ));
    }

    let n = wrapped.len() / SEMIBLOCK - 1;
    let mut a = [0u8; SEMIBLOCK];
    a.copy_from_slice(&wrapped[..SEMIBLOCK]);
    let mut r = SecureBytes::new(&wrapped[SEMIBLOCK..]);
    let mut block = SecureBytes::zeroed(AES_BLOCK_LEN);

    for j in (0..6).rev() {
        for i in (0..n).rev() {
            let semiblock = &mut r.as_bytes_mut()[i * SEMIBLOCK..(i + 1) * SEMIBLOCK];
            let t = ((n * j) + i + 1) as u64;
            for (k, counter) in t.to_be_bytes().iter().enumerate() {
                block.as_bytes_mut()[k] = a[k] ^ counter;
            }
            block.as_bytes_mut()[SEMIBLOCK..].copy_from_slice(semiblock);
            cipher.decrypt_block(block.as_bytes_mut())?;

            a.copy_from_slice(&block.as_bytes()[..SEMIBLOCK]);
            semiblock.copy_from_slice(&block.as_bytes()[SEMIBLOCK..]);
        }
    }

    Ok((a, r))
}
