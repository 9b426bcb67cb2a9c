// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broadcaster: publishes envelopes into the shared store.
//!
//! A broadcast is one create-document call. It succeeds once the store
//! acknowledges the write; nothing is known about who, if anyone, receives
//! it. Failures come back as [`BusError::Write`] and are not retried here.

use crate::envelope::{epoch_millis, payload_from_value, BroadcastEnvelope};
use crate::error::{BusError, Result};
use crate::metrics;
use crate::store::{CreatedDocument, DocumentStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Publishes broadcast envelopes for one origin.
pub struct Broadcaster<S: DocumentStore> {
    store: Arc<S>,
    doc_type: String,
    origin: String,
}

impl<S: DocumentStore> Clone for Broadcaster<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            doc_type: self.doc_type.clone(),
            origin: self.origin.clone(),
        }
    }
}

impl<S: DocumentStore> Broadcaster<S> {
    pub fn new(store: Arc<S>, doc_type: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            store,
            doc_type: doc_type.into(),
            origin: origin.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    /// Publish `payload` (which may be absent).
    pub async fn broadcast(&self, payload: Option<Map<String, Value>>) -> Result<CreatedDocument> {
        let envelope = BroadcastEnvelope::build(&self.doc_type, &self.origin, payload, epoch_millis());
        let start = Instant::now();

        match self.store.create_document(envelope.to_document()).await {
            Ok(created) => {
                metrics::record_broadcast(true, start.elapsed());
                debug!(
                    id = %created.id,
                    fields = envelope.payload.len(),
                    "Broadcast written"
                );
                Ok(created)
            }
            Err(e) => {
                metrics::record_broadcast(false, start.elapsed());
                warn!(error = %e, "Broadcast write failed");
                Err(BusError::Write(e))
            }
        }
    }

    /// Publish a JSON value; must be an object or `null`.
    pub async fn broadcast_value(&self, payload: Value) -> Result<CreatedDocument> {
        let payload = payload_from_value(payload)?;
        self.broadcast(payload).await
    }
}
