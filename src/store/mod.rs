/*!
 * Key Record Store
 *
 * Versioned key records behind snapshot reads. Readers clone an `Arc` to the
 * current snapshot and never block on writers; writers are serialized, build
 * a new snapshot, persist it (when file backed) and only then publish it.
 * Rotation publishes the status change and the new version together.
 */

mod persistence;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;

use crate::error::{TksError, TksResult};
use crate::model::{KeyIdentifier, KeyInfo, KeyRecord, KeyStatus};

type VersionMap = BTreeMap<u32, Arc<KeyRecord>>;

/// Immutable view of the store at one point in time
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    records: BTreeMap<KeyIdentifier, VersionMap>,
}

impl StoreSnapshot {
    /// Highest version of `key_id`, whatever its status
    pub fn latest(&self, key_id: &str) -> Option<Arc<KeyRecord>> {
        self.records
            .get(key_id)
            .and_then(|versions| versions.values().next_back())
            .cloned()
    }

    pub fn version(&self, key_id: &str, version: u32) -> Option<Arc<KeyRecord>> {
        self.records
            .get(key_id)
            .and_then(|versions| versions.get(&version))
            .cloned()
    }

    pub fn versions(&self, key_id: &str) -> Vec<Arc<KeyRecord>> {
        self.records
            .get(key_id)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn key_ids(&self) -> Vec<KeyIdentifier> {
        self.records.keys().cloned().collect()
    }

    fn insert(&mut self, record: KeyRecord) {
        self.records
            .entry(record.id.clone())
            .or_default()
            .insert(record.version, Arc::new(record));
    }
}

/// Store of wrapped key records
#[derive(Debug)]
pub struct KeyRecordStore {
    snapshot: RwLock<Arc<StoreSnapshot>>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
}

impl KeyRecordStore {
    /// A store that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(StoreSnapshot::default())),
            writer: Mutex::new(()),
            path: None,
        }
    }

    /// Open a file-backed store, creating the file if it does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> TksResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = persistence::load_or_create(&path)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current snapshot; stays consistent however long the caller holds it
    pub fn snapshot(&self) -> TksResult<Arc<StoreSnapshot>> {
        self.snapshot
            .read()
            .map(|guard| Arc::clone(&*guard))
            .map_err(|_| TksError::storage("read", "store lock poisoned"))
    }

    /// Latest version of a key, whatever its status
    pub fn get(&self, key_id: &str) -> TksResult<Arc<KeyRecord>> {
        self.snapshot()?
            .latest(key_id)
            .ok_or_else(|| TksError::key_not_found(key_id))
    }

    pub fn get_version(&self, key_id: &str, version: u32) -> TksResult<Arc<KeyRecord>> {
        self.snapshot()?
            .version(key_id, version)
            .ok_or_else(|| TksError::key_not_found(key_id))
    }

    /// Record eligible for retrieval or derivation.
    ///
    /// Without `version` the latest version is used. Either way the record
    /// must be `Active`.
    pub fn get_active(&self, key_id: &str, version: Option<u32>) -> TksResult<Arc<KeyRecord>> {
        let record = match version {
            Some(v) => self.get_version(key_id, v)?,
            None => self.get(key_id)?,
        };

        if !record.is_active() {
            return Err(TksError::KeyNotActive {
                key_id: key_id.to_string(),
                version: record.version,
                status: record.status,
            });
        }
        Ok(record)
    }

    /// Metadata for every version of a key, oldest first
    pub fn list_versions(&self, key_id: &str) -> TksResult<Vec<KeyInfo>> {
        let versions = self.snapshot()?.versions(key_id);
        if versions.is_empty() {
            return Err(TksError::key_not_found(key_id));
        }
        Ok(versions.iter().map(|r| r.info()).collect())
    }

    pub fn list_ids(&self) -> TksResult<Vec<KeyIdentifier>> {
        Ok(self.snapshot()?.key_ids())
    }

    /// Number of distinct key ids
    pub fn len(&self) -> usize {
        self.snapshot().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert the first version of a new key.
    ///
    /// Fails if any version of the id is stored, whatever its status; new
    /// versions of an existing key only come from [`KeyRecordStore::rotate`].
    pub fn put(&self, record: KeyRecord) -> TksResult<()> {
        self.write(|snapshot| {
            if let Some(latest) = snapshot.latest(record.id.as_str()) {
                return Err(TksError::invalid_operation(
                    "put",
                    &format!(
                        "{} already exists at version {} ({}); rotate it instead",
                        record.id, latest.version, latest.status
                    ),
                ));
            }
            log::info!("Stored {} version {}", record.id, record.version);
            snapshot.insert(record);
            Ok(())
        })
    }

    /// Replace an existing key version, for example after re-wrapping
    pub fn update(&self, record: KeyRecord) -> TksResult<()> {
        self.write(|snapshot| {
            let existing = snapshot
                .version(record.id.as_str(), record.version)
                .ok_or_else(|| TksError::key_not_found(record.id.as_str()))?;

            if existing.key_type != record.key_type || existing.algorithm != record.algorithm {
                return Err(TksError::invalid_operation(
                    "update",
                    "key type and algorithm cannot change",
                ));
            }
            if existing.status != record.status && !existing.status.can_transition_to(record.status) {
                return Err(TksError::invalid_operation(
                    "update",
                    &format!("{} cannot become {}", existing.status, record.status),
                ));
            }

            log::info!("Updated {} version {}", record.id, record.version);
            snapshot.insert(record);
            Ok(())
        })
    }

    /// Administrative status change of one version
    pub fn set_status(&self, key_id: &str, version: u32, status: KeyStatus) -> TksResult<Arc<KeyRecord>> {
        self.write(|snapshot| {
            let existing = snapshot
                .version(key_id, version)
                .ok_or_else(|| TksError::key_not_found(key_id))?;

            if !existing.status.can_transition_to(status) {
                return Err(TksError::invalid_operation(
                    "set_status",
                    &format!("{} cannot become {}", existing.status, status),
                ));
            }

            let mut changed = (*existing).clone();
            changed.status = status;
            changed.modified_at = Utc::now();
            log::warn!("Key {} version {} is now {}", key_id, version, status);
            snapshot.insert(changed);
            snapshot
                .version(key_id, version)
                .ok_or_else(|| TksError::key_not_found(key_id))
        })
    }

    /// Logical delete: the version stays readable for audit but is never released
    pub fn revoke(&self, key_id: &str, version: u32) -> TksResult<Arc<KeyRecord>> {
        self.set_status(key_id, version, KeyStatus::Revoked)
    }

    /// Replace the current version of a key with a new one.
    ///
    /// `next` builds version + 1 from the current record. The current
    /// version becomes `Inactive` and the new version is inserted `Active` in
    /// one published snapshot.
    pub fn rotate<F>(&self, key_id: &str, next: F) -> TksResult<Arc<KeyRecord>>
    where
        F: FnOnce(&KeyRecord) -> TksResult<KeyRecord>,
    {
        self.write(|snapshot| {
            let current = snapshot
                .latest(key_id)
                .ok_or_else(|| TksError::key_not_found(key_id))?;
            if !current.is_active() {
                return Err(TksError::KeyNotActive {
                    key_id: key_id.to_string(),
                    version: current.version,
                    status: current.status,
                });
            }

            let replacement = next(&current)?;
            if replacement.id != current.id
                || replacement.version != current.version + 1
                || !replacement.is_active()
                || replacement.key_type != current.key_type
                || replacement.algorithm != current.algorithm
            {
                return Err(TksError::invalid_operation(
                    "rotate",
                    "replacement must be the next active version of the same key",
                ));
            }

            let mut retired = (*current).clone();
            retired.status = KeyStatus::Inactive;
            retired.modified_at = Utc::now();

            log::info!(
                "Rotated {} from version {} to {}",
                key_id,
                current.version,
                replacement.version
            );
            snapshot.insert(retired);
            snapshot.insert(replacement);
            snapshot
                .latest(key_id)
                .ok_or_else(|| TksError::key_not_found(key_id))
        })
    }

    /// Apply `change` to a copy of the snapshot, persist it, then publish it
    fn write<T, F>(&self, change: F) -> TksResult<T>
    where
        F: FnOnce(&mut StoreSnapshot) -> TksResult<T>,
    {
        let _writer = self.lock_writer()?;

        let mut next = (*self.snapshot()?).clone();
        let result = change(&mut next)?;

        if let Some(path) = &self.path {
            persistence::save(path, &next)?;
        }

        let mut published = self
            .snapshot
            .write()
            .map_err(|_| TksError::storage("write", "store lock poisoned"))?;
        *published = Arc::new(next);
        Ok(result)
    }

    fn lock_writer(&self) -> TksResult<MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|_| TksError::storage("write", "writer lock poisoned"))
    }
}
