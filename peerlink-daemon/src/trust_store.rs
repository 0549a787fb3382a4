//! File-backed trust store
//!
//! Pinned fingerprints and remembered device ids live in one JSON file. Every
//! change rewrites the whole file through a temporary sibling and a rename, so
//! a crash never leaves a half-written store behind.

use peerlink_protocol::{ProtocolError, Result, TrustRecords, TrustStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

pub struct FileTrustStore {
    path: PathBuf,
    records: Mutex<TrustRecords>,
}

impl FileTrustStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let records = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let records: TrustRecords = serde_json::from_str(&contents)?;
            info!(
                "Loaded {} paired and {} known devices from {}",
                records.fingerprints.len(),
                records.known_devices.len(),
                path.display()
            );
            records
        } else {
            debug!("Trust store {} not found, starting empty", path.display());
            TrustRecords::default()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current records
    pub fn records(&self) -> Result<TrustRecords> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, TrustRecords>> {
        self.records
            .lock()
            .map_err(|_| ProtocolError::InvalidState("trust store lock poisoned".to_string()))
    }

    /// Apply `change` and persist the result; memory is left untouched if the
    /// write fails
    fn update(&self, change: impl FnOnce(&mut TrustRecords)) -> Result<()> {
        let mut records = self.lock()?;
        let mut updated = records.clone();
        change(&mut updated);
        if updated == *records {
            return Ok(());
        }

        self.persist(&updated)?;
        *records = updated;
        Ok(())
    }

    fn persist(&self, records: &TrustRecords) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Saved trust store to {}", self.path.display());
        Ok(())
    }
}

impl TrustStore for FileTrustStore {
    fn fingerprint(&self, device_id: &str) -> Result<Option<String>> {
        Ok(self.lock()?.fingerprints.get(device_id).cloned())
    }

    fn store_fingerprint(&self, device_id: &str, fingerprint: &str) -> Result<()> {
        self.update(|records| {
            records
                .fingerprints
                .insert(device_id.to_string(), fingerprint.to_string());
        })
    }

    fn remove_fingerprint(&self, device_id: &str) -> Result<()> {
        self.update(|records| {
            records.fingerprints.remove(device_id);
        })
    }

    fn known_devices(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.known_devices.clone())
    }

    fn set_known_devices(&self, device_ids: &[String]) -> Result<()> {
        self.update(|records| records.known_devices = device_ids.to_vec())
    }
}
