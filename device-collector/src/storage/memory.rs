use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage::{merge_upsert, DeviceStore};
use crate::types::DeviceRecord;

/// `DeviceStore` kept in process memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    upserts: AtomicU64,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.read().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful upsert calls, repeated ids included.
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn upsert(&self, record: &DeviceRecord) -> Result<(), StorageError> {
        let mut devices = self
            .devices
            .write()
            .map_err(|e| StorageError::Constraint(format!("store lock poisoned: {e}")))?;

        let merged = merge_upsert(devices.get(&record.id), record);
        devices.insert(record.id.clone(), merged);

        self.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
