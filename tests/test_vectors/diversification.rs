// Session key derivation vectors
// Computed independently of this crate from the published GP layouts

use serde::{Deserialize, Serialize};
use tks::{DerivationScheme, KeyAlgorithm};

use super::bytes;

/// Expected ENC, MAC and KEK keys for one family key and KDD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiversificationVector {
    pub name: String,
    pub scheme: DerivationScheme,
    pub algorithm: KeyAlgorithm,
    pub master: Vec<u8>,
    pub kdd: Vec<u8>,
    pub enc: Vec<u8>,
    pub mac: Vec<u8>,
    pub kek: Vec<u8>,
}

impl DiversificationVector {
    /// `ENC || MAC || KEK`
    pub fn payload(&self) -> Vec<u8> {
        [self.enc.as_slice(), self.mac.as_slice(), self.kek.as_slice()].concat()
    }
}

fn gp_test_key() -> Vec<u8> {
    (0x40u8..0x50).collect()
}

fn kdd() -> Vec<u8> {
    bytes("00010203040506070809")
}

pub fn standard_test_vectors() -> Vec<DiversificationVector> {
    vec![
        DiversificationVector {
            name: "visa2-gp-test-key".to_string(),
            scheme: DerivationScheme::Visa2,
            algorithm: KeyAlgorithm::Des3,
            master: gp_test_key(),
            kdd: kdd(),
            enc: bytes("8510fd973208208ca86889bcec203734"),
            mac: bytes("1068b5fb6e07c78c7a4cfd343b20c78f"),
            kek: bytes("2caee908c71504fe259d3be694a1f76e"),
        },
        DiversificationVector {
            name: "emv-gp-test-key".to_string(),
            scheme: DerivationScheme::Emv,
            algorithm: KeyAlgorithm::Des3,
            master: gp_test_key(),
            kdd: kdd(),
            enc: bytes("0ef49ecbf8019b62e62af7ea20b9bf25"),
            mac: bytes("3e383eb6f2762a89155e76bcfed05b02"),
            kek: bytes("64021f43c1c7d364a1c7c7d01f1c8661"),
        },
        DiversificationVector {
            name: "scp03-aes128-gp-test-key".to_string(),
            scheme: DerivationScheme::Scp03,
            algorithm: KeyAlgorithm::Aes128,
            master: gp_test_key(),
            kdd: kdd(),
            enc: bytes("6c858e63babc4028edc67dc9fdbcb04a"),
            mac: bytes("036c5e747d9500229b7c99d225506ddd"),
            kek: bytes("3437e7edefd3e9c920834a0e722cc5c6"),
        },
    ]
}

/// Only the ENC key is published for the AES-256 family
pub fn scp03_aes256_enc() -> (Vec<u8>, Vec<u8>) {
    (
        (0x40u8..0x60).collect(),
        bytes("982c0a87853b0c3aec8b9a8cdc2627ad92ae3f2a50de7f1995082553c10f606e"),
    )
}
