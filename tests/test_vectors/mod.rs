// Known-answer vectors for interoperability testing
// Session key vectors use the GlobalPlatform test key 404142...4F

pub mod diversification;
pub mod key_wrap;

/// Decode a hex literal from a vector table
pub fn bytes(hex_str: &str) -> Vec<u8> {
    hex::decode(hex_str).expect("invalid hex in test vector")
}
