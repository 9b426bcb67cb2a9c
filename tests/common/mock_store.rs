// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory DocumentStore for tests.
//!
//! Behaves like a single CouchDB database shared by every replica in a
//! test: created documents are emitted as NDJSON change lines on every open
//! feed, the envelope view is emulated from the design document's map
//! function, and bulk deletes honour revision tokens.
//!
//! Failures can be scripted: failing opens, failing creates, a listing
//! error, ids that always conflict on delete, and feeds dropped or broken
//! mid-stream.

use broadcast_bus::store::{
    BoxFuture, BulkDocResult, ByteStream, ChangesRequest, CreatedDocument, DocumentRef,
    DocumentStore, StoreError, StoreResult, ViewQuery, ViewRow,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One open change feed.
struct FeedSink {
    /// Server-side type filter requested by the client.
    doc_type: Option<String>,
    tx: mpsc::UnboundedSender<StoreResult<Bytes>>,
}

/// Mock store that records every call.
///
/// # Example
/// ```rust,ignore
/// let store = Arc::new(MockStore::new());
/// store.fail_next_opens(2);
///
/// // Use in tests...
///
/// assert_eq!(store.opens(), 3);
/// ```
pub struct MockStore {
    /// Live documents by id
    docs: Mutex<BTreeMap<String, Value>>,
    feeds: Mutex<Vec<FeedSink>>,
    seq: AtomicU64,
    next_id: AtomicU64,
    /// Remaining open_changes calls that fail
    fail_opens: AtomicU32,
    /// Remaining create_document calls that fail
    fail_creates: AtomicU32,
    listing_error: Mutex<Option<StoreError>>,
    bulk_error: Mutex<Option<StoreError>>,
    /// Ids whose delete always reports a conflict
    conflict_ids: Mutex<HashSet<String>>,
    opens: AtomicUsize,
    changes_requests: Mutex<Vec<ChangesRequest>>,
    view_queries: Mutex<Vec<ViewQuery>>,
    delete_batches: Mutex<Vec<Vec<DocumentRef>>>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            feeds: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            fail_opens: AtomicU32::new(0),
            fail_creates: AtomicU32::new(0),
            listing_error: Mutex::new(None),
            bulk_error: Mutex::new(None),
            conflict_ids: Mutex::new(HashSet::new()),
            opens: AtomicUsize::new(0),
            changes_requests: Mutex::new(Vec::new()),
            view_queries: Mutex::new(Vec::new()),
            delete_batches: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // Failure Scripting
    // =========================================================================

    /// Make the next `n` feed opens fail with a transport error.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` creates fail with a 503.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn set_listing_error(&self, error: Option<StoreError>) {
        *self.listing_error.lock().unwrap() = error;
    }

    pub fn set_bulk_error(&self, error: Option<StoreError>) {
        *self.bulk_error.lock().unwrap() = error;
    }

    /// Deletes of `id` report a conflict, as if another replica won.
    pub fn conflict_on(&self, id: &str) {
        self.conflict_ids.lock().unwrap().insert(id.to_string());
    }

    /// End every open feed cleanly (server closed the connection).
    pub fn drop_feeds(&self) {
        self.feeds.lock().unwrap().clear();
    }

    /// Fail every open feed with a transport error, then close it.
    pub fn break_feeds(&self) {
        let mut feeds = self.feeds.lock().unwrap();
        for sink in feeds.iter() {
            let _ = sink
                .tx
                .send(Err(StoreError::transport("connection reset by peer")));
        }
        feeds.clear();
    }

    /// Write raw bytes to every open feed.
    pub fn push_raw(&self, bytes: &[u8]) {
        let chunk = Bytes::copy_from_slice(bytes);
        self.feeds
            .lock()
            .unwrap()
            .retain(|sink| sink.tx.send(Ok(chunk.clone())).is_ok());
    }

    /// Insert a document directly, without emitting a change.
    pub fn insert_raw(&self, id: &str, doc: Value) -> String {
        let rev = format!("1-{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut doc = doc;
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("_id".into(), Value::String(id.to_string()));
            obj.insert("_rev".into(), Value::String(rev.clone()));
        }
        self.docs.lock().unwrap().insert(id.to_string(), doc);
        rev
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Feeds whose reader is still attached.
    pub fn open_feeds(&self) -> usize {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .filter(|sink| !sink.tx.is_closed())
            .count()
    }

    pub fn changes_requests(&self) -> Vec<ChangesRequest> {
        self.changes_requests.lock().unwrap().clone()
    }

    pub fn view_queries(&self) -> Vec<ViewQuery> {
        self.view_queries.lock().unwrap().clone()
    }

    pub fn delete_batches(&self) -> Vec<Vec<DocumentRef>> {
        self.delete_batches.lock().unwrap().clone()
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(id).cloned()
    }

    /// Live documents with `type == doc_type`.
    pub fn documents_of_type(&self, doc_type: &str) -> Vec<Value> {
        self.docs
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.get("type").and_then(Value::as_str) == Some(doc_type))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn emit(&self, id: &str, rev: &str, doc: &Value, deleted: bool) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut record = json!({
            "seq": format!("{}-g1AAAA", seq),
            "id": id,
            "changes": [{ "rev": rev }],
            "doc": doc,
        });
        if deleted {
            record["deleted"] = Value::Bool(true);
        }
        let mut line = record.to_string().into_bytes();
        line.push(b'\n');
        let chunk = Bytes::from(line);

        let doc_type = doc.get("type").and_then(Value::as_str);
        self.feeds.lock().unwrap().retain(|sink| {
            let wanted = match sink.doc_type {
                Some(ref tag) => !deleted && doc_type == Some(tag.as_str()),
                None => true,
            };
            !wanted || sink.tx.send(Ok(chunk.clone())).is_ok()
        });
    }

    /// The type tag the envelope view indexes, read from its map function.
    fn indexed_type(&self, query: &ViewQuery) -> Option<String> {
        let docs = self.docs.lock().unwrap();
        let ddoc = docs.get(&format!("_design/{}", query.design_doc))?;
        let map = ddoc["views"][query.view.as_str()]["map"].as_str()?;
        let rest = map.split("doc.type === ").nth(1)?;
        serde_json::Deserializer::from_str(rest)
            .into_iter::<String>()
            .next()?
            .ok()
    }
}

impl DocumentStore for MockStore {
    fn create_document(&self, doc: Value) -> BoxFuture<'_, CreatedDocument> {
        Box::pin(async move {
            if self
                .fail_creates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::http(503, "service_unavailable", "scripted failure"));
            }

            let mut doc = doc;
            let obj = doc
                .as_object_mut()
                .ok_or_else(|| StoreError::http(400, "bad_request", "Document must be a JSON object"))?;

            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let id = match obj.get("_id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => format!("{:032x}", n),
            };
            let rev = format!("1-{:08x}", n);

            {
                let mut docs = self.docs.lock().unwrap();
                if docs.contains_key(&id) {
                    return Err(StoreError::http(409, "conflict", "Document update conflict."));
                }
                obj.insert("_id".into(), Value::String(id.clone()));
                obj.insert("_rev".into(), Value::String(rev.clone()));
                docs.insert(id.clone(), doc.clone());
            }

            self.emit(&id, &rev, &doc, false);
            Ok(CreatedDocument { id, rev })
        })
    }

    fn query_view(&self, query: ViewQuery) -> BoxFuture<'_, Vec<ViewRow>> {
        Box::pin(async move {
            self.view_queries.lock().unwrap().push(query.clone());

            if let Some(err) = self.listing_error.lock().unwrap().clone() {
                return Err(err);
            }

            let tag = self
                .indexed_type(&query)
                .ok_or_else(|| StoreError::http(404, "not_found", "missing"))?;
            let end_key = query.end_key.as_ref().and_then(Value::as_u64);

            let mut rows: Vec<ViewRow> = self
                .docs
                .lock()
                .unwrap()
                .values()
                .filter(|d| d.get("type").and_then(Value::as_str) == Some(tag.as_str()))
                .filter(|d| match end_key {
                    Some(end) => d["timestamp"].as_u64().map_or(false, |ts| ts <= end),
                    None => true,
                })
                .map(|d| ViewRow {
                    id: d["_id"].as_str().unwrap_or_default().to_string(),
                    key: d["timestamp"].clone(),
                    value: d["_rev"].clone(),
                })
                .collect();

            rows.sort_by_key(|r| r.key.as_u64().unwrap_or(0));
            if let Some(limit) = query.limit {
                rows.truncate(limit);
            }
            Ok(rows)
        })
    }

    fn bulk_delete(&self, refs: Vec<DocumentRef>) -> BoxFuture<'_, Vec<BulkDocResult>> {
        Box::pin(async move {
            self.delete_batches.lock().unwrap().push(refs.clone());

            if let Some(err) = self.bulk_error.lock().unwrap().clone() {
                return Err(err);
            }

            let conflicts = self.conflict_ids.lock().unwrap().clone();
            let mut results = Vec::with_capacity(refs.len());
            for r in refs {
                if conflicts.contains(&r.id) {
                    results.push(BulkDocResult::failure(&r.id, "conflict", "Document update conflict."));
                    continue;
                }

                let removed = {
                    let mut docs = self.docs.lock().unwrap();
                    match docs.get(&r.id) {
                        None => Err(BulkDocResult::failure(&r.id, "not_found", "deleted")),
                        Some(d) if d["_rev"].as_str() != Some(r.rev.as_str()) => {
                            Err(BulkDocResult::failure(&r.id, "conflict", "Document update conflict."))
                        }
                        Some(_) => {
                            docs.remove(&r.id);
                            Ok(())
                        }
                    }
                };

                match removed {
                    Ok(()) => {
                        let rev = format!("2-{}", r.rev.trim_start_matches("1-"));
                        let tombstone = json!({ "_id": r.id, "_rev": rev, "_deleted": true });
                        self.emit(&r.id, &rev, &tombstone, true);
                        results.push(BulkDocResult::success(&r.id, rev));
                    }
                    Err(failure) => results.push(failure),
                }
            }
            Ok(results)
        })
    }

    fn open_changes(&self, request: ChangesRequest) -> BoxFuture<'_, ByteStream> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.changes_requests.lock().unwrap().push(request.clone());

            if self
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::transport("connection refused"));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().unwrap().push(FeedSink {
                doc_type: request.doc_type,
                tx,
            });

            let stream: ByteStream = Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }));
            Ok(stream)
        })
    }
}
