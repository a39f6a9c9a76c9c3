use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ErrorKind, StructuralError};
use crate::types::{DeviceRecord, InboundRecord};

pub const MAX_DEVICE_ID_BYTES: usize = 255;
/// Shortest payload that can hold a JSON object with a field in it.
pub const MIN_PAYLOAD_BYTES: usize = 4;

static DEVICE_ID_CHARSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("device id regex is valid"));

/// Why a record ended up in quarantine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoisonReason {
    EmptyMessage,
    MalformedPayload(String),
    MissingId,
    Storage(String),
    /// The record decoded but could not be encoded for the output topic.
    Unencodable(String),
}

impl PoisonReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoisonReason::EmptyMessage
            | PoisonReason::MalformedPayload(_)
            | PoisonReason::MissingId
            | PoisonReason::Unencodable(_) => ErrorKind::Structural,
            PoisonReason::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            PoisonReason::EmptyMessage => "EmptyMessage",
            PoisonReason::MalformedPayload(_) => "MalformedPayload",
            PoisonReason::MissingId => "MissingId",
            PoisonReason::Storage(_) => "StorageError",
            PoisonReason::Unencodable(_) => "UnencodableRecord",
        }
    }
}

impl fmt::Display for PoisonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoisonReason::EmptyMessage => write!(f, "empty message"),
            PoisonReason::MalformedPayload(e) => write!(f, "malformed payload: {e}"),
            PoisonReason::MissingId => write!(f, "missing id"),
            PoisonReason::Storage(e) => write!(f, "storage failure: {e}"),
            PoisonReason::Unencodable(e) => write!(f, "unencodable record: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Valid(DeviceRecord),
    Poison(PoisonReason),
}

/// Classifies a decoded message. Only the presence of a record and a non-blank id are
/// checked here; storage failures are turned into poison by the ingestor.
pub fn classify(inbound: &InboundRecord) -> Classification {
    let Some(record) = inbound.record.as_ref() else {
        return match &inbound.decode_error {
            Some(e) => Classification::Poison(PoisonReason::MalformedPayload(e.clone())),
            None => Classification::Poison(PoisonReason::EmptyMessage),
        };
    };

    if record.id.trim().is_empty() {
        return Classification::Poison(PoisonReason::MissingId);
    }

    Classification::Valid(record.clone())
}

/// The stricter check quarantine runs on each attempt: the raw payload must be a JSON
/// object and the record's own id must be a well-formed device id.
pub fn check_structure(
    payload: Option<&[u8]>,
    device_id: Option<&str>,
) -> Result<(), StructuralError> {
    let payload = payload
        .filter(|p| !p.is_empty())
        .ok_or(StructuralError::EmptyPayload)?;

    if payload.len() < MIN_PAYLOAD_BYTES {
        return Err(StructuralError::TruncatedPayload {
            len: payload.len(),
            min: MIN_PAYLOAD_BYTES,
        });
    }

    serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(payload)
        .map_err(|e| StructuralError::MalformedPayload(e.to_string()))?;

    check_device_id(device_id)
}

pub fn check_device_id(device_id: Option<&str>) -> Result<(), StructuralError> {
    let id = device_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(StructuralError::MissingId)?;

    if id.len() > MAX_DEVICE_ID_BYTES {
        return Err(StructuralError::IdTooLong {
            len: id.len(),
            max: MAX_DEVICE_ID_BYTES,
        });
    }

    if !DEVICE_ID_CHARSET.is_match(id) {
        return Err(StructuralError::InvalidIdCharset);
    }

    Ok(())
}
