//! Event and transport message types plus topic naming.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message metadata key carrying the event type.
pub const METADATA_EVENT_TYPE: &str = "event_type";
/// Message metadata key carrying the RFC 3339 event timestamp.
pub const METADATA_TIMESTAMP: &str = "timestamp";

/// Domain event published through the bus.
///
/// `id` and `timestamp` may be left empty by publishers; the bus assigns a
/// UUID and the current UTC time on its own copy before encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier, generated when empty.
    #[serde(default)]
    pub id: String,
    /// Event type, e.g. `user.signed_up`. Must not be empty.
    #[serde(rename = "type")]
    pub kind: String,
    /// Moment the event happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Opaque JSON payload.
    #[serde(default)]
    pub payload: Value,
    /// Free-form string annotations.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Build an event of the given type carrying `payload`.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            timestamp: None,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Encoded event as carried by a [`crate::PubSub`] transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identifier copied from the event.
    pub id: String,
    /// JSON-encoded [`Event`].
    pub payload: Vec<u8>,
    /// Transport-level annotations (`event_type`, `timestamp`).
    pub metadata: HashMap<String, String>,
}

/// Derive the topic for an event type under `prefix`.
///
/// Trailing dots on the prefix are ignored and an empty prefix yields the
/// bare event type.
#[must_use]
pub fn topic_for(prefix: &str, event_type: &str) -> String {
    let prefix = prefix.trim_end_matches('.');
    if prefix.is_empty() {
        event_type.to_string()
    } else {
        format!("{prefix}.{event_type}")
    }
}
