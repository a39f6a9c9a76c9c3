use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const SOURCE_SERVICE: &str = "device-collector";

/// One decoded telemetry entry, as read from the input topic and republished downstream.
///
/// `id` is the device identity across the lifetime of the system. It is decoded leniently
/// (missing or null becomes empty) so that a record without an id can still be classified
/// and quarantined instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    #[serde(alias = "deviceId", default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(alias = "deviceType", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(alias = "manufacturer", default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub meta: HashMap<String, Value>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            vendor: None,
            model: None,
            firmware_version: None,
            first_seen: None,
            last_seen: None,
            status: None,
            meta: HashMap::new(),
        }
    }

    /// Records where this service saw the record. Existing keys other than these two are kept.
    pub fn stamp_meta(&mut self, processed_at: DateTime<Utc>) {
        self.meta
            .insert("source".to_string(), Value::from(SOURCE_SERVICE));
        self.meta.insert(
            "processed_at".to_string(),
            Value::from(processed_at.timestamp_millis()),
        );
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Where a message came from on the inbound transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

impl Origin {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A message handed to the ingestor: its origin, the raw bytes if the transport had any,
/// and the decoded record if decoding succeeded.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub origin: Origin,
    pub payload: Option<Vec<u8>>,
    pub record: Option<DeviceRecord>,
    pub decode_error: Option<String>,
}

impl InboundRecord {
    pub fn decode(origin: Origin, payload: Option<&[u8]>) -> Self {
        let Some(bytes) = payload.filter(|b| !b.is_empty()) else {
            return Self {
                origin,
                payload: None,
                record: None,
                decode_error: None,
            };
        };

        match serde_json::from_slice::<DeviceRecord>(bytes) {
            Ok(record) => Self {
                origin,
                payload: Some(bytes.to_vec()),
                record: Some(record),
                decode_error: None,
            },
            Err(e) => Self {
                origin,
                payload: Some(bytes.to_vec()),
                record: None,
                decode_error: Some(e.to_string()),
            },
        }
    }

    /// Builds an inbound record from an already decoded record, keeping the JSON bytes
    /// around as the raw payload.
    pub fn from_record(origin: Origin, record: DeviceRecord) -> Self {
        let payload = serde_json::to_vec(&record).ok();
        Self {
            origin,
            payload,
            record: Some(record),
            decode_error: None,
        }
    }

    pub fn empty(origin: Origin) -> Self {
        Self::decode(origin, None)
    }
}

/// Snapshot written to the dead-letter topic once a poison message exhausts its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinedRecord {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    #[serde(default)]
    pub original_key: Option<String>,
    /// Base64 of the raw message. Omitted when the transport delivered no bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_value: Option<String>,
    pub error_kind: String,
    pub error_type: String,
    pub error_message: String,
    pub retry_attempts: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub first_failure_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_failure_time: DateTime<Utc>,
    pub device_id: String,
    /// JSON text with diagnostic fields.
    pub metadata: String,
}

impl QuarantinedRecord {
    /// Dead-letter partition key: device id, else the original key, else empty.
    pub fn partition_key(&self) -> &str {
        if !self.device_id.is_empty() {
            return &self.device_id;
        }
        match self.original_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => "",
        }
    }
}
