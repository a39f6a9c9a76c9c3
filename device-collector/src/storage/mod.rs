//! Durable device storage.
//!
//! The pipeline relies on three properties of every `DeviceStore`:
//! - an upsert on an existing id overwrites the mutable fields and `last_seen`, but keeps a
//!   previously stored `first_seen`; `first_seen` is only taken from the input when nothing
//!   was stored before,
//! - applying the same upsert twice leaves the same stored record as applying it once,
//! - a failed upsert reports a typed error and leaves no partial write.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::DeviceRecord;

pub mod memory;
pub mod postgres;

pub use memory::MemoryDeviceStore;
pub use postgres::PostgresDeviceStore;

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn upsert(&self, record: &DeviceRecord) -> Result<(), StorageError>;
}

/// Applies the upsert semantics to an already stored record. Shared by the in-memory
/// store and by tests asserting on the Postgres statement.
pub fn merge_upsert(existing: Option<&DeviceRecord>, incoming: &DeviceRecord) -> DeviceRecord {
    let mut merged = incoming.clone();
    if let Some(first_seen) = existing.and_then(|e| e.first_seen) {
        merged.first_seen = Some(first_seen);
    }
    merged
}
