//! Test doubles shared by unit tests and the integration tests under `tests/`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{SinkError, StorageError};
use crate::sinks::RecordSink;
use crate::storage::{DeviceStore, MemoryDeviceStore};
use crate::types::DeviceRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Records every delivered message. Topics can be switched to failing mode.
#[derive(Default, Clone)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<SentMessage>>>,
    failing_topics: Arc<Mutex<HashSet<String>>>,
    attempts: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().unwrap().insert(topic.to_string());
    }

    /// Successfully delivered messages, in send order.
    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn messages_for(&self, topic: &str) -> Vec<SentMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Every send call, failed ones included.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        *self.attempts.lock().unwrap() += 1;

        if self.failing_topics.lock().unwrap().contains(topic) {
            return Err(SinkError::Canceled);
        }

        self.messages.lock().unwrap().push(SentMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Wraps a `MemoryDeviceStore` and rejects upserts for selected ids.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryDeviceStore,
    failing_ids: Mutex<HashSet<String>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_id(&self, id: &str) {
        self.failing_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn inner(&self) -> &MemoryDeviceStore {
        &self.inner
    }
}

#[async_trait]
impl DeviceStore for FailingStore {
    async fn upsert(&self, record: &DeviceRecord) -> Result<(), StorageError> {
        if self.failing_ids.lock().unwrap().contains(&record.id) {
            return Err(StorageError::Timeout);
        }
        self.inner.upsert(record).await
    }
}
