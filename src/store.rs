// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store integration traits.
//!
//! Defines the four operations the bus needs from the shared store. The
//! production implementation is [`CouchStore`](crate::couch::CouchStore);
//! tests plug in an in-memory store.
//!
//! # Example
//!
//! ```rust,no_run
//! use broadcast_bus::store::{
//!     BoxFuture, BulkDocResult, ByteStream, ChangesRequest, CreatedDocument,
//!     DocumentRef, DocumentStore, ViewQuery, ViewRow,
//! };
//! use serde_json::Value;
//!
//! struct MyStore { /* ... */ }
//!
//! impl DocumentStore for MyStore {
//!     fn create_document(&self, _doc: Value) -> BoxFuture<'_, CreatedDocument> {
//!         Box::pin(async move {
//!             Ok(CreatedDocument { id: "a".into(), rev: "1-a".into() })
//!         })
//!     }
//!
//!     fn query_view(&self, _query: ViewQuery) -> BoxFuture<'_, Vec<ViewRow>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn bulk_delete(&self, _docs: Vec<DocumentRef>) -> BoxFuture<'_, Vec<BulkDocResult>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn open_changes(&self, _request: ChangesRequest) -> BoxFuture<'_, ByteStream> {
//!         Box::pin(async move {
//!             let stream: ByteStream = Box::pin(futures::stream::empty());
//!             Ok(stream)
//!         })
//!     }
//! }
//! ```

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Raw body of a streaming change-feed response.
///
/// Chunk boundaries carry no meaning; see [`crate::framing`].
pub type ByteStream = Pin<Box<dyn Stream<Item = StoreResult<Bytes>> + Send>>;

/// Error reported by the store (or by the transport in front of it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// HTTP status, `None` for transport failures.
    pub status: Option<u16>,
    /// Short machine-readable error name, e.g. `"conflict"`.
    pub error: String,
    /// Human-readable detail.
    pub reason: String,
}

impl StoreError {
    /// A failure before any response was received.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self {
            status: None,
            error: "transport".to_string(),
            reason: reason.into(),
        }
    }

    /// A non-success response from the store.
    pub fn http(status: u16, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            error: error.into(),
            reason: reason.into(),
        }
    }

    /// Transport failures, timeouts, throttling and 5xx.
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(408) | Some(429) => true,
            Some(s) => s >= 500,
        }
    }

    /// Stale revision token.
    pub fn is_conflict(&self) -> bool {
        self.status == Some(409) || self.error == "conflict"
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404) || self.error == "not_found"
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} {}: {}", status, self.error, self.reason),
            None => write!(f, "{}: {}", self.error, self.reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Identity assigned by the store to a newly created document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedDocument {
    pub id: String,
    pub rev: String,
}

/// A document id plus the revision token required to delete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    pub rev: String,
}

/// Secondary index query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewQuery {
    /// Design document name (without the `_design/` prefix).
    pub design_doc: String,
    pub view: String,
    /// Inclusive upper bound on the index key.
    pub end_key: Option<Value>,
    pub limit: Option<usize>,
}

/// One row of a view result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub id: String,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
}

/// Per-document outcome of a bulk delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDocResult {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkDocResult {
    pub fn success(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev.into()),
            ok: Some(true),
            error: None,
            reason: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            ok: None,
            error: Some(error.into()),
            reason: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Someone else already deleted or updated this document.
    pub fn is_conflict(&self) -> bool {
        matches!(self.error.as_deref(), Some("conflict") | Some("not_found"))
    }
}

/// Parameters for opening the continuous change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesRequest {
    /// Ask the store to only send documents with this `type`.
    pub doc_type: Option<String>,
    /// Interval at which the store writes keep-alive newlines.
    pub heartbeat: Duration,
    /// Sequence to start from; `"now"` skips history.
    pub since: String,
}

impl ChangesRequest {
    /// Start at the current head of the feed.
    pub fn from_now(doc_type: Option<String>, heartbeat: Duration) -> Self {
        Self {
            doc_type,
            heartbeat,
            since: "now".to_string(),
        }
    }
}

/// Trait defining what we need from the shared document store.
///
/// Implementations must be cheap to share across tasks; the bus holds them
/// behind an `Arc` and calls them concurrently.
pub trait DocumentStore: Send + Sync + 'static {
    /// Create a new document; the store assigns id and revision.
    fn create_document(&self, doc: Value) -> BoxFuture<'_, CreatedDocument>;

    /// Query a secondary index.
    fn query_view(&self, query: ViewQuery) -> BoxFuture<'_, Vec<ViewRow>>;

    /// Delete a set of documents in one request.
    ///
    /// Per-document failures are reported in the result, not as `Err`.
    fn bulk_delete(&self, docs: Vec<DocumentRef>) -> BoxFuture<'_, Vec<BulkDocResult>>;

    /// Open the continuous change feed.
    fn open_changes(&self, request: ChangesRequest) -> BoxFuture<'_, ByteStream>;
}
