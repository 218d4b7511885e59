// AES key wrap with padding vectors from RFC 5649, section 6

use serde::{Deserialize, Serialize};

use super::bytes;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyWrapVector {
    pub kek: Vec<u8>,
    pub key: Vec<u8>,
    pub wrapped: Vec<u8>,
}

pub fn standard_test_vectors() -> Vec<KeyWrapVector> {
    let kek = bytes("5840df6e29b02af1ab493b705bf16ea1ae8338f4dcc176a8");
    vec![
        KeyWrapVector {
            kek: kek.clone(),
            key: bytes("c37b7e6492584340bed12207808941155068f738"),
            wrapped: bytes("138bdeaa9b8fa7fc61f97742e72248ee5ae6ae5360d1ae6a5f54f373fa543b6a"),
        },
        KeyWrapVector {
            kek,
            key: bytes("466f7250617369"),
            wrapped: bytes("afbeb0f07dfbf5419200f2ccb50bb24f"),
        },
    ]
}
