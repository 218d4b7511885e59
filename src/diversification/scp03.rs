// AES key diversification: NIST SP 800-108 KDF in counter mode with AES-CMAC
// as the PRF, laid out as in GlobalPlatform SCP03:
//
//   label(11 x 00 || constant) || 00 || L (2 bytes, bits) || i (1 byte) || context
//
// The context is the 10-byte KDD. Output is as long as the master key.

use aes::{Aes128, Aes192, Aes256};
use cmac::{Cmac, Mac};
use zeroize::{Zeroize, Zeroizing};

use super::Diversifier;
use crate::error::{TksError, TksResult};
use crate::model::KeyAlgorithm;
use crate::secure_memory::SecureBytes;

const LABEL_PADDING: usize = 11;
const SEPARATION_INDICATOR: u8 = 0x00;
const PRF_OUTPUT_LEN: usize = 16;

pub(super) fn derive(
    master: &[u8],
    algorithm: KeyAlgorithm,
    diversifier: &Diversifier,
    constant: u8,
) -> TksResult<SecureBytes> {
    let output_len = algorithm.key_len();
    let output_bits = (output_len * 8) as u16;
    let iterations = output_len.div_ceil(PRF_OUTPUT_LEN);

    let mut output = SecureBytes::zeroed(0);
    for counter in 1..=iterations {
        let input = derivation_data(constant, output_bits, counter as u8, diversifier.as_bytes());
        let block = cmac_prf(master, &input)?;
        output.extend_from_slice(block.as_slice());
    }

    Ok(SecureBytes::new(&output.as_bytes()[..output_len]))
}

pub(super) fn derivation_data(constant: u8, output_bits: u16, counter: u8, context: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(LABEL_PADDING + 5 + context.len());
    data.extend_from_slice(&[0u8; LABEL_PADDING]);
    data.push(constant);
    data.push(SEPARATION_INDICATOR);
    data.extend_from_slice(&output_bits.to_be_bytes());
    data.push(counter);
    data.extend_from_slice(context);
    data
}

fn cmac_prf(key: &[u8], data: &[u8]) -> TksResult<Zeroizing<[u8; PRF_OUTPUT_LEN]>> {
    let invalid = |_| TksError::invalid_key_material("derive", "CMAC rejected key length");
    let mut tag = match key.len() {
        16 => {
            let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(invalid)?;
            mac.update(data);
            mac.finalize().into_bytes()
        }
        24 => {
            let mut mac = <Cmac<Aes192> as Mac>::new_from_slice(key).map_err(invalid)?;
            mac.update(data);
            mac.finalize().into_bytes()
        }
        32 => {
            let mut mac = <Cmac<Aes256> as Mac>::new_from_slice(key).map_err(invalid)?;
            mac.update(data);
            mac.finalize().into_bytes()
        }
        other => {
            return Err(TksError::invalid_key_material(
                "derive",
                &format!("AES-CMAC requires a 16, 24 or 32 byte key, got {}", other),
            ))
        }
    };

    let mut out = Zeroizing::new([0u8; PRF_OUTPUT_LEN]);
    out.copy_from_slice(tag.as_slice());
    tag.as_mut_slice().zeroize();
    Ok(out)
}

#[cfg(test)]
pub(super) fn cmac_for_test(key: &[u8], data: &[u8]) -> Zeroizing<[u8; PRF_OUTPUT_LEN]> {
    cmac_prf(key, data).unwrap()
}
