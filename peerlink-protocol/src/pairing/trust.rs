//! Trust store interface
//!
//! Durable storage of pairing state belongs to the host application. The
//! engine only needs a small key-value surface: the pinned fingerprint of
//! each paired device and the list of device ids the user has seen.

use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Storage for pinned fingerprints and known devices
///
/// Implementations are called from async tasks and must not block for long.
pub trait TrustStore: Send + Sync {
    /// Stored fingerprint for a device, if it is paired
    fn fingerprint(&self, device_id: &str) -> Result<Option<String>>;

    /// Pin a fingerprint after a completed pairing
    fn store_fingerprint(&self, device_id: &str, fingerprint: &str) -> Result<()>;

    /// Forget a pinned fingerprint
    fn remove_fingerprint(&self, device_id: &str) -> Result<()>;

    /// Ids of every device the host has recorded
    fn known_devices(&self) -> Result<Vec<String>>;

    /// Replace the recorded device ids
    fn set_known_devices(&self, device_ids: &[String]) -> Result<()>;
}

/// Plain trust data, shared by in-memory and file-backed stores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecords {
    #[serde(default)]
    pub fingerprints: BTreeMap<String, String>,

    #[serde(default)]
    pub known_devices: Vec<String>,
}

/// Trust store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    records: Mutex<TrustRecords>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: TrustRecords) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Copy of the current records
    pub fn snapshot(&self) -> Result<TrustRecords> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, TrustRecords>> {
        self.records
            .lock()
            .map_err(|_| ProtocolError::InvalidState("trust store lock poisoned".to_string()))
    }
}

impl TrustStore for MemoryTrustStore {
    fn fingerprint(&self, device_id: &str) -> Result<Option<String>> {
        Ok(self.lock()?.fingerprints.get(device_id).cloned())
    }

    fn store_fingerprint(&self, device_id: &str, fingerprint: &str) -> Result<()> {
        self.lock()?
            .fingerprints
            .insert(device_id.to_string(), fingerprint.to_string());
        Ok(())
    }

    fn remove_fingerprint(&self, device_id: &str) -> Result<()> {
        self.lock()?.fingerprints.remove(device_id);
        Ok(())
    }

    fn known_devices(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.known_devices.clone())
    }

    fn set_known_devices(&self, device_ids: &[String]) -> Result<()> {
        self.lock()?.known_devices = device_ids.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_fingerprints() {
        let store = MemoryTrustStore::new();
        assert_eq!(store.fingerprint("alice").unwrap(), None);

        store.store_fingerprint("alice", "AA:BB").unwrap();
        assert_eq!(store.fingerprint("alice").unwrap().as_deref(), Some("AA:BB"));

        store.remove_fingerprint("alice").unwrap();
        assert_eq!(store.fingerprint("alice").unwrap(), None);
    }

    #[test]
    fn test_records_serialization() {
        let store = MemoryTrustStore::new();
        store.set_known_devices(&["alice".to_string()]).unwrap();
        store.store_fingerprint("alice", "AA").unwrap();

        let json = serde_json::to_string(&store.snapshot().unwrap()).unwrap();
        assert!(json.contains("knownDevices"));
        let parsed: TrustRecords = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, store.snapshot().unwrap());

        let empty: TrustRecords = serde_json::from_str("{}").unwrap();
        assert!(empty.fingerprints.is_empty());
    }
}
