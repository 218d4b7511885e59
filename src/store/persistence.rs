use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::StoreSnapshot;
use crate::error::{TksError, TksResult};
use crate::model::{KeyIdentifier, KeyRecord};

/// Current on-disk format
pub(super) const FORMAT_VERSION: u32 = 1;

/// Key store file format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedStore {
    /// Version of the key store format
    format_version: u32,
    /// Every version of every key, by key id
    records: BTreeMap<KeyIdentifier, Vec<KeyRecord>>,
}

/// Load a snapshot from `path`, creating an empty store file if none exists
pub(super) fn load_or_create(path: &Path) -> TksResult<StoreSnapshot> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| TksError::storage("create_dir", e))?;
            }
        }
        let empty = StoreSnapshot::default();
        save(path, &empty)?;
        log::info!("Created empty key store at {}", path.display());
        return Ok(empty);
    }

    let mut file = File::open(path).map_err(|e| TksError::storage("open", e))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| TksError::storage("read", e))?;

    let persisted: PersistedStore = serde_json::from_str(&contents)?;
    if persisted.format_version != FORMAT_VERSION {
        return Err(TksError::storage(
            "load",
            format!("unsupported key store format {}", persisted.format_version),
        ));
    }

    let mut snapshot = StoreSnapshot::default();
    for (id, versions) in persisted.records {
        let entry = snapshot.records.entry(id.clone()).or_default();
        for record in versions {
            if record.id != id {
                return Err(TksError::storage(
                    "load",
                    format!("record {} filed under {}", record.id, id),
                ));
            }
            if entry.insert(record.version, Arc::new(record)).is_some() {
                return Err(TksError::storage("load", format!("duplicate version for {}", id)));
            }
        }
    }

    log::info!(
        "Loaded {} keys from {}",
        snapshot.records.len(),
        path.display()
    );
    Ok(snapshot)
}

/// Write `snapshot` to a temporary file, then rename it over `path`
pub(super) fn save(path: &Path, snapshot: &StoreSnapshot) -> TksResult<()> {
    let persisted = PersistedStore {
        format_version: FORMAT_VERSION,
        records: snapshot
            .records
            .iter()
            .map(|(id, versions)| (id.clone(), versions.values().map(|r| (**r).clone()).collect()))
            .collect(),
    };
    let serialized = serde_json::to_string_pretty(&persisted)?;

    let temp_path = temp_path_for(path);
    {
        let mut file = File::create(&temp_path).map_err(|e| TksError::storage("create", e))?;
        file.write_all(serialized.as_bytes())
            .map_err(|e| TksError::storage("write", e))?;
        file.sync_all().map_err(|e| TksError::storage("sync", e))?;
    }
    fs::rename(&temp_path, path).map_err(|e| TksError::storage("rename", e))?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "keystore.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}
