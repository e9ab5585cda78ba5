//! Versioned schemas carried inside frame segments.
//!
//! Mutation and deletion frames carry an [`EventMetadata`] document in their
//! metadata segment. Timer frames carry a [`TimerEvent`] in their payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current metadata schema version.
pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("malformed {what}: {source}")]
    Malformed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Json,
    Binary,
}

/// Per-document metadata attached to mutation and deletion events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(rename = "v")]
    pub version: u32,
    pub id: String,
    #[serde(default)]
    pub cas: u64,
    #[serde(rename = "vb")]
    pub partition: u16,
    pub seq: u64,
    #[serde(default)]
    pub expiration: u32,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub datatype: DataType,
}

impl EventMetadata {
    pub fn new(id: impl Into<String>, partition: u16, seq: u64) -> Self {
        Self {
            version: METADATA_VERSION,
            id: id.into(),
            cas: 0,
            partition,
            seq,
            expiration: 0,
            flags: 0,
            datatype: DataType::Json,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, SchemaError> {
        let meta: EventMetadata =
            serde_json::from_slice(bytes).map_err(|source| SchemaError::Malformed {
                what: "event metadata",
                source,
            })?;
        if meta.version != METADATA_VERSION {
            return Err(SchemaError::UnsupportedVersion(meta.version));
        }
        Ok(meta)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of plain fields cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A fired timer, delivered by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerEvent {
    pub callback: String,
    pub reference: String,
    pub due: i64,
    #[serde(rename = "vb")]
    pub partition: i16,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl TimerEvent {
    pub fn parse(bytes: &[u8]) -> Result<Self, SchemaError> {
        serde_json::from_slice(bytes).map_err(|source| SchemaError::Malformed {
            what: "timer event",
            source,
        })
    }
}

/// A timer a handler asked to schedule. Firing is owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRequest {
    pub callback: String,
    pub due: i64,
    pub reference: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_metadata_with_defaults() {
        let meta = EventMetadata::parse(br#"{"v":1,"id":"doc::1","vb":7,"seq":100}"#)
            .expect("parse");
        assert_eq!(meta, EventMetadata::new("doc::1", 7, 100));
        assert_eq!(meta.datatype, DataType::Json);
    }

    #[test]
    fn rejects_future_versions() {
        let err = EventMetadata::parse(br#"{"v":2,"id":"a","vb":1,"seq":1}"#).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_garbage() {
        let err = EventMetadata::parse(b"not json").unwrap_err();
        assert!(matches!(err, SchemaError::Malformed { what: "event metadata", .. }));
    }

    #[test]
    fn timer_event_context_defaults_to_null() {
        let event = TimerEvent::parse(
            br#"{"callback":"expire","reference":"r1","due":1700000000,"vb":4}"#,
        )
        .expect("parse");
        assert_eq!(event.partition, 4);
        assert!(event.context.is_null());
    }
}
