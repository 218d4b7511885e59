//! Tests for the key record store

use std::thread;

use chrono::Utc;
use tempfile::tempdir;

use super::*;
use crate::diversification::DerivationScheme;
use crate::model::{KeyAlgorithm, KeyType, MasterKeyHandle, WrappedMaterial};

fn record(id: &str, version: u32) -> KeyRecord {
    let now = Utc::now();
    KeyRecord {
        id: KeyIdentifier::from(id),
        key_type: KeyType::SharedSecret,
        algorithm: KeyAlgorithm::Aes128,
        status: KeyStatus::Active,
        version,
        wrapped_material: WrappedMaterial::new(vec![version as u8; 44]),
        wrapping_key: MasterKeyHandle::new("mk", 1),
        derivation_scheme: None,
        created_at: now,
        modified_at: now,
    }
}

fn next_version(current: &KeyRecord) -> TksResult<KeyRecord> {
    Ok(record(current.id.as_str(), current.version + 1))
}

#[test]
fn test_put_and_get() {
    let store = KeyRecordStore::in_memory();
    assert!(store.is_empty());
    store.put(record("shared-secret-1", 1)).unwrap();

    let fetched = store.get("shared-secret-1").unwrap();
    assert_eq!(fetched.version, 1);
    assert_eq!(store.len(), 1);
    assert!(matches!(store.get("missing-key"), Err(TksError::KeyNotFound { .. })));
}

#[test]
fn test_ids_are_exact() {
    let store = KeyRecordStore::in_memory();
    store.put(record("shared-secret-1", 1)).unwrap();
    assert!(store.get("Shared-Secret-1").is_err());
    assert!(store.get("shared-secret-1 ").is_err());
}

#[test]
fn test_put_rejects_existing_id() {
    let store = KeyRecordStore::in_memory();
    store.put(record("k", 1)).unwrap();
    assert!(matches!(store.put(record("k", 2)), Err(TksError::InvalidOperation { .. })));
    assert!(store.put(record("k", 1)).is_err());

    // A revoked id stays taken
    store.revoke("k", 1).unwrap();
    assert!(store.put(record("k", 2)).is_err());

    let versions = store.list_versions("k").unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, KeyStatus::Revoked);
    assert!(store.get_active("k", None).is_err());
}

#[test]
fn test_get_active_rejects_other_statuses() {
    let store = KeyRecordStore::in_memory();
    store.put(record("k", 1)).unwrap();

    for status in [KeyStatus::Compromised, KeyStatus::Revoked] {
        store.set_status("k", 1, status).unwrap();
        let err = store.get_active("k", None).unwrap_err();
        assert!(matches!(err, TksError::KeyNotActive { version: 1, .. }));
    }
    // Still readable for administration
    assert_eq!(store.get("k").unwrap().status, KeyStatus::Revoked);
}

#[test]
fn test_status_transition_table() {
    let store = KeyRecordStore::in_memory();
    store.put(record("k", 1)).unwrap();
    store.revoke("k", 1).unwrap();
    assert!(store.set_status("k", 1, KeyStatus::Active).is_err());
    assert!(store.set_status("k", 1, KeyStatus::Compromised).is_err());
    assert!(store.set_status("absent", 1, KeyStatus::Revoked).is_err());
}

#[test]
fn test_rotate_is_atomic() {
    let store = KeyRecordStore::in_memory();
    store.put(record("k", 1)).unwrap();

    let before = store.snapshot().unwrap();
    let current = store.rotate("k", next_version).unwrap();
    assert_eq!(current.version, 2);

    // The old snapshot is unchanged
    assert_eq!(before.latest("k").unwrap().version, 1);
    assert!(before.latest("k").unwrap().is_active());

    let versions = store.list_versions("k").unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].status, KeyStatus::Inactive);
    assert_eq!(versions[1].status, KeyStatus::Active);

    // Pinned requests for v1 now see an inactive record
    assert!(matches!(
        store.get_active("k", Some(1)),
        Err(TksError::KeyNotActive { .. })
    ));
    assert_eq!(store.get_active("k", Some(2)).unwrap().version, 2);
}

#[test]
fn test_rotate_validates_replacement() {
    let store = KeyRecordStore::in_memory();
    store.put(record("k", 1)).unwrap();

    assert!(store.rotate("k", |c| Ok(record(c.id.as_str(), c.version + 2))).is_err());
    assert!(store.rotate("k", |c| Ok(record("other", c.version + 1))).is_err());
    assert!(store
        .rotate("k", |_| Err(TksError::vault_unavailable("sealed")))
        .is_err());

    // Nothing changed
    assert_eq!(store.list_versions("k").unwrap().len(), 1);
    assert!(store.get_active("k", None).is_ok());
}

#[test]
fn test_rotate_keeps_algorithm() {
    let store = KeyRecordStore::in_memory();
    store.put(record("k", 1)).unwrap();

    let err = store
        .rotate("k", |c| {
            let mut replacement = record(c.id.as_str(), c.version + 1);
            replacement.algorithm = KeyAlgorithm::Aes256;
            Ok(replacement)
        })
        .unwrap_err();
    assert!(matches!(err, TksError::InvalidOperation { .. }));

    let current = store.get_active("k", None).unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.algorithm, KeyAlgorithm::Aes128);
    assert_eq!(store.list_versions("k").unwrap().len(), 1);
}

#[test]
fn test_rotate_requires_active_current() {
    let store = KeyRecordStore::in_memory();
    store.put(record("k", 1)).unwrap();
    store.revoke("k", 1).unwrap();
    assert!(matches!(store.rotate("k", next_version), Err(TksError::KeyNotActive { .. })));
}

#[test]
fn test_update_keeps_type_and_algorithm() {
    let store = KeyRecordStore::in_memory();
    store.put(record("k", 1)).unwrap();

    let mut rewrapped = record("k", 1);
    rewrapped.wrapping_key = MasterKeyHandle::new("mk", 2);
    store.update(rewrapped).unwrap();
    assert_eq!(store.get("k").unwrap().wrapping_key.version, 2);

    let mut changed = record("k", 1);
    changed.algorithm = KeyAlgorithm::Aes256;
    assert!(store.update(changed).is_err());
    assert!(store.update(record("k", 9)).is_err());
}

#[test]
fn test_concurrent_readers_see_consistent_versions() {
    let store = Arc::new(KeyRecordStore::in_memory());
    store.put(record("k", 1)).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = store.snapshot().unwrap();
                    let versions = snapshot.versions("k");
                    // Exactly one active version in any snapshot
                    assert_eq!(versions.iter().filter(|r| r.is_active()).count(), 1);
                    assert!(snapshot.latest("k").unwrap().is_active());
                }
            })
        })
        .collect();

    for _ in 0..20 {
        store.rotate("k", next_version).unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(store.get("k").unwrap().version, 21);
}

#[test]
fn test_persistence_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("keystore.json");

    {
        let store = KeyRecordStore::open(&path).unwrap();
        assert!(path.exists());
        let mut family = record("fam", 1);
        family.key_type = KeyType::Session;
        family.algorithm = KeyAlgorithm::Des3;
        family.derivation_scheme = Some(DerivationScheme::Emv);
        store.put(family).unwrap();
        store.put(record("k", 1)).unwrap();
        store.rotate("k", next_version).unwrap();
    }

    let reopened = KeyRecordStore::open(&path).unwrap();
    assert_eq!(reopened.list_ids().unwrap().len(), 2);
    assert_eq!(reopened.get("k").unwrap().version, 2);
    assert_eq!(reopened.get_version("k", 1).unwrap().status, KeyStatus::Inactive);
    let family = reopened.get("fam").unwrap();
    assert_eq!(family.derivation_scheme, Some(DerivationScheme::Emv));
    assert_eq!(family.wrapped_material.as_bytes(), &[1u8; 44][..]);

    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_persisted_json_layout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("keystore.json");
    let store = KeyRecordStore::open(&path).unwrap();
    store.put(record("k", 1)).unwrap();

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["format_version"], 1);
    let stored = &json["records"]["k"][0];
    assert_eq!(stored["algorithm"], "AES128");
    assert_eq!(stored["status"], "active");
    assert_eq!(stored["wrapped_material"], base64::encode([1u8; 44]));
}

#[test]
fn test_unsupported_format_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("keystore.json");
    std::fs::write(&path, r#"{"format_version": 7, "records": {}}"#).unwrap();
    assert!(matches!(KeyRecordStore::open(&path), Err(TksError::Storage { .. })));

    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(KeyRecordStore::open(&path), Err(TksError::Serialization(_))));
}
