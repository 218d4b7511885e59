//! Tests for the master-key vault

use super::*;
use crate::audit::{AuditOutcome, MemoryAuditSink};
use crate::error::ErrorKind;
use crate::wrapping::{transport_aad, unwrap_transport};

fn vault_with_sink() -> (MasterKeyVault, Arc<MemoryAuditSink>) {
    let sink = Arc::new(MemoryAuditSink::new());
    let vault = MasterKeyVault::new(sink.clone());
    (vault, sink)
}

fn session_spec(id: &str) -> KeySpec {
    KeySpec::new(id, KeyType::Session, KeyAlgorithm::Des3).with_scheme(DerivationScheme::Visa2)
}

#[test]
fn test_wrap_unwrap_round_trip_all_algorithms() {
    let (vault, _) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();

    for algorithm in [KeyAlgorithm::Des3, KeyAlgorithm::Aes128, KeyAlgorithm::Aes192, KeyAlgorithm::Aes256] {
        let material: Vec<u8> = (0..algorithm.key_len() as u8).collect();
        let spec = KeySpec::new(format!("key-{}", algorithm), KeyType::SharedSecret, algorithm);
        let record = vault.import_record(spec, &master, 1, &material).unwrap();

        assert_ne!(record.wrapped_material.as_bytes(), material.as_slice());
        let handle = vault.unwrap(&record, &AuditContext::admin()).unwrap();
        assert_eq!(handle.material(), material.as_slice());
        assert_eq!(handle.algorithm(), algorithm);

        let rewrapped = vault.wrap(&master, &handle, &AuditContext::admin()).unwrap();
        let mut copy = record.clone();
        copy.wrapped_material = rewrapped;
        assert_eq!(vault.unwrap(&copy, &AuditContext::admin()).unwrap(), handle);
    }
}

#[test]
fn test_unknown_master_is_key_not_found() {
    let (vault, sink) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let mut record = vault
        .generate_record(KeySpec::new("k", KeyType::SharedSecret, KeyAlgorithm::Aes128), &master, 1)
        .unwrap();
    record.wrapping_key = MasterKeyHandle::new("other", 1);

    let err = vault.unwrap(&record, &AuditContext::admin()).unwrap_err();
    assert!(matches!(err, TksError::KeyNotFound { .. }));

    let last = sink.events().pop().unwrap();
    assert_eq!(last.operation, AuditOperation::Unwrap);
    assert_eq!(last.outcome, AuditOutcome::Failure);
    assert_eq!(last.error_kind, Some(ErrorKind::KeyNotFound));
}

#[test]
fn test_tampered_record_metadata_fails() {
    let (vault, _) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let record = vault
        .generate_record(KeySpec::new("k", KeyType::SharedSecret, KeyAlgorithm::Aes256), &master, 1)
        .unwrap();

    let mut renamed = record.clone();
    renamed.id = KeyIdentifier::from("k2");
    assert!(matches!(
        vault.unwrap(&renamed, &AuditContext::admin()),
        Err(TksError::InvalidKeyMaterial { .. })
    ));

    let mut retyped = record.clone();
    retyped.key_type = KeyType::Transport;
    assert!(vault.unwrap(&retyped, &AuditContext::admin()).is_err());

    let mut bumped = record;
    bumped.version = 2;
    assert!(vault.unwrap(&bumped, &AuditContext::admin()).is_err());
}

#[test]
fn test_import_rejects_wrong_length() {
    let (vault, _) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let err = vault
        .import_record(KeySpec::new("k", KeyType::SharedSecret, KeyAlgorithm::Aes256), &master, 1, &[0u8; 16])
        .unwrap_err();
    assert!(matches!(err, TksError::InvalidKeyMaterial { .. }));
}

#[test]
fn test_import_rejects_scheme_mismatch() {
    let (vault, _) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let spec = KeySpec::new("k", KeyType::Session, KeyAlgorithm::Aes128).with_scheme(DerivationScheme::Emv);
    let err = vault.generate_record(spec, &master, 1).unwrap_err();
    assert!(matches!(err, TksError::UnsupportedScheme { .. }));
}

#[test]
fn test_master_rotation_keeps_old_versions() {
    let (vault, _) = vault_with_sink();
    let v1 = vault.generate_master("mk").unwrap();
    let record = vault.generate_record(session_spec("fam"), &v1, 1).unwrap();
    let before = vault.unwrap(&record, &AuditContext::admin()).unwrap();

    let v2 = vault.rotate_master(&KeyIdentifier::from("mk")).unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(vault.current_master(&KeyIdentifier::from("mk")).unwrap(), v2);
    assert_eq!(vault.master_versions(&KeyIdentifier::from("mk")).unwrap(), vec![1, 2]);

    // Still pinned to v1
    assert_eq!(vault.unwrap(&record, &AuditContext::admin()).unwrap(), before);

    let moved = vault.rewrap_record(&record, &AuditContext::admin()).unwrap();
    assert_eq!(moved.wrapping_key, v2);
    assert_eq!(moved.version, record.version);

    vault.retire_master(&v1).unwrap();
    assert!(matches!(
        vault.unwrap(&record, &AuditContext::admin()),
        Err(TksError::KeyNotFound { .. })
    ));
    assert_eq!(vault.unwrap(&moved, &AuditContext::admin()).unwrap(), before);
}

#[test]
fn test_current_master_cannot_be_retired() {
    let (vault, _) = vault_with_sink();
    let v1 = vault.generate_master("mk").unwrap();
    assert!(matches!(vault.retire_master(&v1), Err(TksError::InvalidOperation { .. })));
    assert!(vault.rotate_master(&KeyIdentifier::from("absent")).is_err());
}

#[test]
fn test_install_master_checks_length() {
    let (vault, _) = vault_with_sink();
    assert!(vault.install_master("mk", &[0u8; 16]).is_err());
    let handle = vault.install_master("mk", &[7u8; 32]).unwrap();
    assert_eq!(handle.version, 1);
}

#[test]
fn test_sealed_vault_is_unavailable() {
    let (vault, sink) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let record = vault
        .generate_record(KeySpec::new("k", KeyType::SharedSecret, KeyAlgorithm::Aes128), &master, 1)
        .unwrap();

    vault.seal();
    let err = vault.unwrap(&record, &AuditContext::connector("tps-01")).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.kind(), ErrorKind::VaultUnavailable);
    let last = sink.events().pop().unwrap();
    assert_eq!(last.connector_id.as_deref(), Some("tps-01"));

    vault.unseal();
    assert!(vault.unwrap(&record, &AuditContext::admin()).is_ok());
}

#[test]
fn test_derive_through_vault_matches_engine() {
    let (vault, sink) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let record = vault.generate_record(session_spec("fam"), &master, 1).unwrap();
    let family = vault.unwrap(&record, &AuditContext::admin()).unwrap();
    let div = Diversifier::parse(&[0x42; 10], DerivationScheme::Visa2).unwrap();

    let keys = vault
        .derive(&family, &div, DerivationScheme::Visa2, &AuditContext::admin())
        .unwrap();
    let direct =
        diversification::derive_session_keys(family.material(), KeyAlgorithm::Des3, &div, DerivationScheme::Visa2)
            .unwrap();
    assert_eq!(keys, direct);
    assert_eq!(sink.events_for(AuditOperation::Derive).len(), 1);
}

#[test]
fn test_derive_rejects_static_keys() {
    let (vault, _) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let record = vault
        .generate_record(KeySpec::new("s", KeyType::SharedSecret, KeyAlgorithm::Des3), &master, 1)
        .unwrap();
    let handle = vault.unwrap(&record, &AuditContext::admin()).unwrap();
    let div = Diversifier::parse(&[0x42; 10], DerivationScheme::Visa2).unwrap();
    assert!(vault
        .derive(&handle, &div, DerivationScheme::Visa2, &AuditContext::admin())
        .is_err());
}

#[test]
fn test_transport_wrap_recoverable_by_connector() {
    let (vault, _) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let transport_material = [0x24u8; 32];
    let transport_record = vault
        .import_record(
            KeySpec::new("tk", KeyType::Transport, KeyAlgorithm::Aes256),
            &master,
            1,
            &transport_material,
        )
        .unwrap();
    let secret_record = vault
        .import_record(
            KeySpec::new("ss", KeyType::SharedSecret, KeyAlgorithm::Aes128),
            &master,
            1,
            &[0x99u8; 16],
        )
        .unwrap();

    let ctx = AuditContext::connector("tps-01");
    let transport = vault.unwrap(&transport_record, &ctx).unwrap();
    let secret = vault.unwrap(&secret_record, &ctx).unwrap();

    let aad = transport_aad(secret.key_id(), secret.version());
    for scheme in [WrappingScheme::AesKeyWrapPad, WrappingScheme::AesGcm] {
        let blob = vault
            .transport_wrap(&transport, TransportPayload::Key(&secret), scheme, &aad, &ctx)
            .unwrap();
        let plain = unwrap_transport(&transport_material, scheme, &blob, &aad).unwrap();
        assert_eq!(plain.as_bytes(), &[0x99u8; 16]);
    }

    // Only transport keys may wrap
    assert!(vault
        .transport_wrap(&secret, TransportPayload::Key(&transport), WrappingScheme::AesGcm, &aad, &ctx)
        .is_err());
}

#[test]
fn test_check_value_matches_material() {
    let (vault, _) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let gp_key: Vec<u8> = (0x40u8..0x50).collect();
    let record = vault
        .import_record(KeySpec::new("gp", KeyType::Session, KeyAlgorithm::Des3), &master, 1, &gp_key)
        .unwrap();
    let handle = vault.unwrap(&record, &AuditContext::admin()).unwrap();
    assert_eq!(vault.check_value(&handle).unwrap(), "8BAF47");
}

#[test]
fn test_audit_events_never_carry_material() {
    let (vault, sink) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let material = [0xC3u8; 16];
    let record = vault
        .import_record(KeySpec::new("k", KeyType::SharedSecret, KeyAlgorithm::Aes128), &master, 1, &material)
        .unwrap();
    vault.unwrap(&record, &AuditContext::admin()).unwrap();

    let material_hex = hex::encode(material);
    let wrapped_b64 = base64::encode(record.wrapped_material.as_bytes());
    for event in sink.events() {
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.to_lowercase().contains(&material_hex));
        assert!(!json.contains(&wrapped_b64));
    }
}

#[test]
fn test_handle_debug_is_redacted() {
    let (vault, _) = vault_with_sink();
    let master = vault.generate_master("mk").unwrap();
    let record = vault
        .import_record(KeySpec::new("k", KeyType::SharedSecret, KeyAlgorithm::Aes128), &master, 1, &[0xABu8; 16])
        .unwrap();
    let handle = vault.unwrap(&record, &AuditContext::admin()).unwrap();
    let printed = format!("{:?} {:?}", handle, vault);
    assert!(printed.contains("REDACTED"));
    assert!(!printed.contains("171, 171"));
    assert!(!printed.to_lowercase().contains("abab"));
}
