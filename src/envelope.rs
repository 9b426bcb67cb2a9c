// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broadcast envelope: the document written for every broadcast.
//!
//! ```json
//! {"type": "broadcast", "timestamp": 1767225600000, "origin": "api-3", "key": "users:42"}
//! ```
//!
//! `type`, `timestamp` and `origin` are always set by the bus and override
//! any caller field with the same name. Store-owned fields (`_id`, `_rev`,
//! `_deleted`) are stripped from the payload, so envelopes are always
//! created fresh and never updated.

use crate::error::{BusError, Result};
use serde_json::{Map, Value};

/// Envelope fields owned by the bus.
pub const TYPE_FIELD: &str = "type";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const ORIGIN_FIELD: &str = "origin";

const STORE_FIELDS: [&str; 3] = ["_id", "_rev", "_deleted"];

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A broadcast envelope, as built for writing or as read off the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEnvelope {
    pub doc_type: String,
    pub timestamp: u64,
    pub origin: String,
    /// Caller fields, without the envelope fields.
    pub payload: Map<String, Value>,
    /// Store id, when read back from the store.
    pub id: Option<String>,
    /// Store revision, when read back from the store.
    pub rev: Option<String>,
}

impl BroadcastEnvelope {
    /// Build a new envelope around `payload`.
    pub fn build(doc_type: &str, origin: &str, payload: Option<Map<String, Value>>, timestamp: u64) -> Self {
        let mut payload = payload.unwrap_or_default();
        for key in STORE_FIELDS.iter().chain([TYPE_FIELD, TIMESTAMP_FIELD, ORIGIN_FIELD].iter()) {
            payload.remove(*key);
        }
        Self {
            doc_type: doc_type.to_string(),
            timestamp,
            origin: origin.to_string(),
            payload,
            id: None,
            rev: None,
        }
    }

    /// The document to hand to the store's create call.
    pub fn to_document(&self) -> Value {
        let mut doc = self.payload.clone();
        doc.insert(TYPE_FIELD.to_string(), Value::String(self.doc_type.clone()));
        doc.insert(TIMESTAMP_FIELD.to_string(), Value::from(self.timestamp));
        doc.insert(ORIGIN_FIELD.to_string(), Value::String(self.origin.clone()));
        Value::Object(doc)
    }

    /// Parse a document delivered by the feed.
    ///
    /// Returns `None` if any envelope field is missing or has the wrong
    /// shape.
    pub fn from_document(doc: &Value) -> Option<Self> {
        let obj = doc.as_object()?;
        let doc_type = obj.get(TYPE_FIELD)?.as_str()?.to_string();
        let timestamp = obj.get(TIMESTAMP_FIELD)?.as_u64()?;
        let origin = obj.get(ORIGIN_FIELD)?.as_str()?.to_string();

        let payload = obj
            .iter()
            .filter(|(k, _)| {
                !STORE_FIELDS.contains(&k.as_str())
                    && ![TYPE_FIELD, TIMESTAMP_FIELD, ORIGIN_FIELD].contains(&k.as_str())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            doc_type,
            timestamp,
            origin,
            payload,
            id: obj.get("_id").and_then(Value::as_str).map(str::to_string),
            rev: obj.get("_rev").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// Whether this envelope was published by `origin`.
    pub fn is_from(&self, origin: &str) -> bool {
        self.origin == origin
    }

    /// Payload field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Accept `null` or an object as a broadcast payload.
pub fn payload_from_value(value: Value) -> Result<Option<Map<String, Value>>> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(BusError::InvalidPayload(format!(
            "expected an object or null, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
