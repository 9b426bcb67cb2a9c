// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tidy (GC) worker: deletes broadcast envelopes that have served their
//! purpose.
//!
//! # Cycle
//!
//! 1. Query the envelope index (`timestamp` → `_rev`), optionally bounded
//!    by age and count
//! 2. Bulk delete exactly the returned set, in chunks of `batch_size`
//!
//! # Failure Handling
//!
//! | Failure | Result |
//! |---------|--------|
//! | Index query fails | `Err(BusError::Listing)`, nothing deleted |
//! | Zero matches | `Ok`, no delete call |
//! | Per-document delete errors | logged, `Ok` (retried next cycle) |
//! | Whole bulk request fails | logged, `Ok` (retried next cycle) |
//!
//! Several replicas may tidy the same envelopes at once. The loser of each
//! race sees a conflict or not-found for that document, which is expected.

use crate::config::TidyConfig;
use crate::envelope::epoch_millis;
use crate::error::{BusError, Result};
use crate::metrics;
use crate::store::{DocumentRef, DocumentStore, ViewQuery};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which envelopes a tidy cycle targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TidyCriteria {
    /// Only envelopes at least this old. `None` targets all of them.
    pub older_than: Option<Duration>,
    /// At most this many envelopes per cycle.
    pub limit: Option<usize>,
}

impl TidyCriteria {
    /// Every envelope in the index.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn older_than(age: Duration) -> Self {
        Self {
            older_than: Some(age),
            limit: None,
        }
    }

    pub fn from_config(config: &TidyConfig) -> Self {
        Self {
            older_than: config.max_age(),
            limit: config.limit,
        }
    }

    /// Index end key (inclusive) for a cycle starting at `now_ms`.
    fn end_key(&self, now_ms: u64) -> Option<Value> {
        self.older_than
            .map(|age| Value::from(now_ms.saturating_sub(age.as_millis() as u64)))
    }
}

/// Outcome of one tidy cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TidyReport {
    /// Rows returned by the index.
    pub listed: usize,
    /// Documents the store confirmed deleted.
    pub deleted: usize,
    /// Documents that could not be deleted this cycle.
    pub failed: usize,
    /// Rows without a usable revision token.
    pub skipped: usize,
}

/// Garbage collector for broadcast envelopes.
pub struct Tidy<S: DocumentStore> {
    store: Arc<S>,
    doc_type: String,
    design_doc: String,
    view: String,
    batch_size: usize,
}

impl<S: DocumentStore> Clone for Tidy<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            doc_type: self.doc_type.clone(),
            design_doc: self.design_doc.clone(),
            view: self.view.clone(),
            batch_size: self.batch_size,
        }
    }
}

impl<S: DocumentStore> Tidy<S> {
    pub fn new(store: Arc<S>, doc_type: impl Into<String>, config: &TidyConfig) -> Self {
        Self {
            store,
            doc_type: doc_type.into(),
            design_doc: config.design_doc.clone(),
            view: config.view.clone(),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Design document holding the envelope index.
    pub fn design_document(&self) -> Value {
        // serde_json escapes the tag for the JS string literal
        let tag = Value::String(self.doc_type.clone()).to_string();
        let mut views = Map::new();
        views.insert(
            self.view.clone(),
            json!({
                "map": format!(
                    "function (doc) {{ if (doc.type === {}) {{ emit(doc.timestamp, doc._rev); }} }}",
                    tag
                )
            }),
        );
        json!({
            "_id": format!("_design/{}", self.design_doc),
            "language": "javascript",
            "views": views
        })
    }

    /// Create the index design document if it does not exist yet.
    pub async fn ensure_index(&self) -> Result<()> {
        match self.store.create_document(self.design_document()).await {
            Ok(created) => {
                info!(id = %created.id, "Created broadcast index");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(design_doc = %self.design_doc, "Broadcast index already exists");
                Ok(())
            }
            Err(e) => Err(BusError::Write(e)),
        }
    }

    /// Run one tidy cycle.
    pub async fn tidy(&self, criteria: &TidyCriteria) -> Result<TidyReport> {
        let start = Instant::now();
        let query = ViewQuery {
            design_doc: self.design_doc.clone(),
            view: self.view.clone(),
            end_key: criteria.end_key(epoch_millis()),
            limit: criteria.limit,
        };

        let rows = match self.store.query_view(query).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Tidy listing failed");
                metrics::record_tidy_listing_failure();
                return Err(BusError::Listing(e));
            }
        };

        let mut report = TidyReport {
            listed: rows.len(),
            ..Default::default()
        };

        if rows.is_empty() {
            debug!("Nothing to tidy");
            metrics::record_tidy_cycle(0, 0, 0, start.elapsed());
            return Ok(report);
        }

        let mut refs = Vec::with_capacity(rows.len());
        for row in rows {
            match row.value.as_str() {
                Some(rev) => refs.push(DocumentRef {
                    id: row.id,
                    rev: rev.to_string(),
                }),
                None => {
                    debug!(id = %row.id, "Index row has no revision, skipping");
                    report.skipped += 1;
                }
            }
        }

        for chunk in refs.chunks(self.batch_size) {
            match self.store.bulk_delete(chunk.to_vec()).await {
                Ok(results) => {
                    for result in results {
                        if result.is_ok() {
                            report.deleted += 1;
                        } else if result.is_conflict() {
                            // Another replica got there first
                            debug!(id = %result.id, error = ?result.error, "Envelope already gone");
                            report.failed += 1;
                        } else {
                            warn!(
                                id = %result.id,
                                error = ?result.error,
                                reason = ?result.reason,
                                "Failed to delete envelope"
                            );
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, batch = chunk.len(), "Bulk delete failed, will retry next cycle");
                    report.failed += chunk.len();
                }
            }
        }

        let duration = start.elapsed();
        metrics::record_tidy_cycle(report.listed, report.deleted, report.failed, duration);
        info!(
            listed = report.listed,
            deleted = report.deleted,
            failed = report.failed,
            skipped = report.skipped,
            duration_ms = duration.as_millis() as u64,
            "Tidy cycle complete"
        );
        Ok(report)
    }

    /// Run [`tidy`](Self::tidy) every `interval` until `shutdown` turns
    /// `true` (or its sender is dropped). The first cycle runs immediately.
    pub fn spawn_periodic(
        &self,
        interval: Duration,
        criteria: TidyCriteria,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tidy = self.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(interval_ms = interval.as_millis() as u64, "Starting periodic tidy task");

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Periodic tidy task stopping");
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        // Listing errors are already logged; the next tick retries
                        let _ = tidy.tidy(&criteria).await;
                    }
                }
            }

            info!("Periodic tidy task stopped");
        })
    }
}
