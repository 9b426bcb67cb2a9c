// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Feed reader: one streaming session against the change feed.
//!
//! [`FeedReader::open`] issues the streaming request and returns a
//! [`FeedSession`]. [`FeedSession::run`] consumes the body chunk by chunk,
//! reassembles change records with a [`FrameDecoder`], and hands each
//! broadcast document to a [`DocumentHandler`] in the order the store
//! emitted them.
//!
//! A session ends exactly once, reported as a [`SessionEnd`]:
//! - `Closed`: the store ended the feed (`last_seq` or end of body)
//! - `Failed`: transport error, idle timeout, desync or oversized record
//! - `Cancelled`: shutdown was signalled
//!
//! The reader never reconnects; that is the job of
//! [`FeedRunner`](crate::runner::FeedRunner).

use crate::config::FeedConfig;
use crate::error::{BusError, Result};
use crate::framing::{Frame, FrameDecoder};
use crate::metrics;
use crate::store::{ByteStream, ChangesRequest, DocumentStore, StoreError};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Receives every broadcast document seen on the feed.
///
/// Called inline on the runner task: keep it short, hand work off to
/// another task if it may block.
pub trait DocumentHandler: Send + Sync {
    fn on_document(&self, doc: Value);
}

impl<F> DocumentHandler for F
where
    F: Fn(Value) + Send + Sync,
{
    fn on_document(&self, doc: Value) {
        self(doc)
    }
}

/// Settings for a feed session, resolved from [`FeedConfig`].
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Database name, for logs.
    pub database: String,
    /// Documents whose `type` differs are skipped. `None` delivers all.
    pub doc_type: Option<String>,
    /// Ask the store to filter by type as well.
    pub server_filter: bool,
    pub heartbeat: Duration,
    pub idle_timeout: Duration,
    pub max_record_bytes: usize,
    pub max_consecutive_parse_failures: usize,
}

impl FeedSettings {
    pub fn from_config(database: &str, broadcast_type: &str, config: &FeedConfig) -> Self {
        Self {
            database: database.to_string(),
            doc_type: Some(broadcast_type.to_string()),
            server_filter: config.server_filter,
            heartbeat: config.heartbeat_duration(),
            idle_timeout: config.idle_timeout_duration(),
            max_record_bytes: config.max_record_bytes,
            max_consecutive_parse_failures: config.max_consecutive_parse_failures,
        }
    }

    /// Request for a fresh session starting at the head of the feed.
    pub fn changes_request(&self) -> ChangesRequest {
        let filter = if self.server_filter {
            self.doc_type.clone()
        } else {
            None
        };
        ChangesRequest::from_now(filter, self.heartbeat)
    }
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self::from_config("", crate::config::DEFAULT_BROADCAST_TYPE, &FeedConfig::default())
    }
}

/// Opens change feed sessions against a store.
pub struct FeedReader<S: DocumentStore> {
    store: Arc<S>,
    settings: FeedSettings,
}

impl<S: DocumentStore> FeedReader<S> {
    pub fn new(store: Arc<S>, settings: FeedSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.settings
    }

    /// Open one streaming request.
    ///
    /// Fails with [`BusError::Connection`] if the store refuses or cannot
    /// be reached.
    pub async fn open(&self) -> Result<FeedSession> {
        let request = self.settings.changes_request();
        debug!(
            since = %request.since,
            filter = ?request.doc_type,
            heartbeat_ms = request.heartbeat.as_millis() as u64,
            "Opening change feed"
        );
        let stream = self
            .store
            .open_changes(request)
            .await
            .map_err(|e| BusError::connection("open_changes", e))?;
        Ok(FeedSession::from_stream(stream, &self.settings))
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The store ended the feed.
    Closed,
    /// Shutdown was signalled.
    Cancelled,
    /// The session broke.
    Failed(BusError),
}

impl SessionEnd {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SessionEnd::Closed => "closed",
            SessionEnd::Cancelled => "cancelled",
            SessionEnd::Failed(_) => "failed",
        }
    }
}

/// Outcome of [`FeedSession::run`].
#[derive(Debug)]
pub struct SessionReport {
    pub end: SessionEnd,
    /// Documents passed to the handler.
    pub delivered: u64,
    /// Changes skipped (deleted, no document, other type).
    pub skipped: u64,
    /// Records dropped as unparseable.
    pub dropped: u64,
}

/// A single open change feed.
///
/// Owns the response stream and the partial-record buffer; both are
/// discarded when the session ends.
pub struct FeedSession {
    stream: ByteStream,
    decoder: FrameDecoder,
    doc_type: Option<String>,
    idle_timeout: Duration,
    delivered: u64,
    skipped: u64,
}

impl FeedSession {
    /// Wrap an already-open response body.
    pub fn from_stream(stream: ByteStream, settings: &FeedSettings) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(settings.max_record_bytes, settings.max_consecutive_parse_failures),
            doc_type: settings.doc_type.clone(),
            idle_timeout: settings.idle_timeout,
            delivered: 0,
            skipped: 0,
        }
    }

    /// Stream until the feed ends, fails, or `shutdown` turns `true`.
    ///
    /// Dropping the shutdown sender counts as cancellation.
    pub async fn run<H>(mut self, handler: &H, shutdown: &mut watch::Receiver<bool>) -> SessionReport
    where
        H: DocumentHandler + ?Sized,
    {
        let end = self.stream_until_end(handler, shutdown).await;

        let dropped = self.decoder.dropped();
        if dropped > 0 {
            metrics::record_dropped_records(dropped);
        }
        metrics::record_feed_session(end.label());

        SessionReport {
            end,
            delivered: self.delivered,
            skipped: self.skipped,
            dropped,
        }
    }

    async fn stream_until_end<H>(&mut self, handler: &H, shutdown: &mut watch::Receiver<bool>) -> SessionEnd
    where
        H: DocumentHandler + ?Sized,
    {
        loop {
            if *shutdown.borrow() {
                return SessionEnd::Cancelled;
            }

            let next = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received during feed read");
                        return SessionEnd::Cancelled;
                    }
                    continue;
                }

                next = tokio::time::timeout(self.idle_timeout, self.stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return SessionEnd::Failed(BusError::connection(
                        "changes_feed",
                        StoreError::transport(format!(
                            "no data for {}ms (idle timeout)",
                            self.idle_timeout.as_millis()
                        )),
                    ));
                }
                Ok(None) => {
                    debug!(buffered = self.decoder.buffered_len(), "Change feed body ended");
                    return SessionEnd::Closed;
                }
                Ok(Some(Err(e))) => {
                    return SessionEnd::Failed(BusError::connection("changes_feed", e));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            trace!(len = chunk.len(), "Received chunk");
            self.decoder.push(&chunk);

            loop {
                match self.decoder.next_frame() {
                    Ok(Some(Frame::Change(record))) => {
                        if record.deleted {
                            self.skip("deleted");
                            continue;
                        }
                        let Some(doc) = record.doc else {
                            self.skip("no_doc");
                            continue;
                        };
                        if !self.type_matches(&doc) {
                            self.skip("type_mismatch");
                            continue;
                        }
                        trace!(id = ?record.id, seq = %record.seq, "Delivering document");
                        handler.on_document(doc);
                        self.delivered += 1;
                        metrics::record_documents_delivered(1);
                    }
                    Ok(Some(Frame::Heartbeat)) => {}
                    Ok(Some(Frame::LastSeq(seq))) => {
                        debug!(last_seq = %seq, "Store ended change feed");
                        return SessionEnd::Closed;
                    }
                    Ok(None) => break,
                    Err(e) => return SessionEnd::Failed(e),
                }
            }
        }
    }

    fn type_matches(&self, doc: &Value) -> bool {
        match self.doc_type {
            Some(ref tag) => doc.get("type").and_then(Value::as_str) == Some(tag.as_str()),
            None => true,
        }
    }

    fn skip(&mut self, reason: &str) {
        trace!(reason, "Skipping change");
        self.skipped += 1;
        metrics::record_documents_skipped(reason, 1);
    }
}
