// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP store adapter for CouchDB-compatible servers.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create | `POST /{db}` |
//! | view | `GET /{db}/_design/{ddoc}/_view/{view}?endkey=..&limit=..` |
//! | bulk delete | `POST /{db}/_bulk_docs` with `_deleted: true` |
//! | change feed | `POST /{db}/_changes?feed=continuous&include_docs=true&since=now&heartbeat=..` |
//!
//! The change feed request has no overall timeout; idle detection lives in
//! [`FeedSession`](crate::feed::FeedSession). All other requests use
//! `store.request_timeout`.

use crate::config::StoreConfig;
use crate::descriptor::ConnectionDescriptor;
use crate::error::{BusError, Result};
use crate::store::{
    BoxFuture, BulkDocResult, ByteStream, ChangesRequest, CreatedDocument, DocumentRef, DocumentStore,
    StoreError, StoreResult, ViewQuery, ViewRow,
};
use futures::TryStreamExt;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Deserialize)]
struct ViewResponse {
    #[serde(default)]
    rows: Vec<ViewRow>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// [`DocumentStore`] over the CouchDB HTTP API.
pub struct CouchStore {
    http: reqwest::Client,
    descriptor: ConnectionDescriptor,
    db_url: String,
    request_timeout: Duration,
}

impl CouchStore {
    pub fn new(descriptor: ConnectionDescriptor, config: &StoreConfig) -> Result<Self> {
        let request_timeout = config.request_timeout_duration();
        // No client-wide timeout: it would cut the change feed
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| BusError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            db_url: descriptor.database_url(),
            descriptor,
            request_timeout,
        })
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Create the database if it does not exist. Needs admin rights.
    pub async fn ensure_database(&self) -> StoreResult<()> {
        let resp = self
            .request(Method::PUT, &self.db_url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status().as_u16();
        if resp.status().is_success() {
            debug!(database = %self.descriptor.database, "Created database");
            return Ok(());
        }
        if status == 412 {
            // file_exists
            return Ok(());
        }
        Err(error_from_response(resp).await)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.descriptor.user {
            Some(ref user) => builder.basic_auth(user, self.descriptor.password.as_ref()),
            None => builder,
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> StoreResult<T> {
        let resp = builder
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        resp.json::<T>().await.map_err(transport_error)
    }
}

impl DocumentStore for CouchStore {
    fn create_document(&self, doc: Value) -> BoxFuture<'_, CreatedDocument> {
        Box::pin(async move {
            let builder = self.request(Method::POST, &self.db_url).json(&doc);
            self.send_json(builder).await
        })
    }

    fn query_view(&self, query: ViewQuery) -> BoxFuture<'_, Vec<ViewRow>> {
        Box::pin(async move {
            let url = view_url(&self.db_url, &query);
            let builder = self.request(Method::GET, &url).query(&view_params(&query));
            let resp: ViewResponse = self.send_json(builder).await?;
            trace!(rows = resp.rows.len(), view = %query.view, "View query");
            Ok(resp.rows)
        })
    }

    fn bulk_delete(&self, docs: Vec<DocumentRef>) -> BoxFuture<'_, Vec<BulkDocResult>> {
        Box::pin(async move {
            let url = format!("{}/_bulk_docs", self.db_url);
            let builder = self.request(Method::POST, &url).json(&bulk_delete_body(&docs));
            self.send_json(builder).await
        })
    }

    fn open_changes(&self, request: ChangesRequest) -> BoxFuture<'_, ByteStream> {
        Box::pin(async move {
            let url = format!("{}/_changes", self.db_url);
            let body = match request.doc_type {
                Some(ref tag) => json!({ "selector": { "type": tag } }),
                None => json!({}),
            };
            let resp = self
                .request(Method::POST, &url)
                .query(&changes_params(&request))
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;

            if !resp.status().is_success() {
                return Err(error_from_response(resp).await);
            }

            let stream: ByteStream = Box::pin(resp.bytes_stream().map_err(transport_error));
            Ok(stream)
        })
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::transport(format!("timed out: {e}"))
    } else {
        StoreError::transport(e.to_string())
    }
}

async fn error_from_response(resp: Response) -> StoreError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    parse_error_body(status.as_u16(), status.canonical_reason().unwrap_or("error"), &body)
}

/// Build a [`StoreError`] from a non-success response body.
fn parse_error_body(status: u16, fallback: &str, body: &str) -> StoreError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error, reason }) if error.is_some() || reason.is_some() => StoreError::http(
            status,
            error.unwrap_or_else(|| fallback.to_string()),
            reason.unwrap_or_default(),
        ),
        _ => StoreError::http(status, fallback.to_lowercase().replace(' ', "_"), body.trim()),
    }
}

fn view_url(db_url: &str, query: &ViewQuery) -> String {
    format!(
        "{}/_design/{}/_view/{}",
        db_url,
        urlencoding::encode(&query.design_doc),
        urlencoding::encode(&query.view)
    )
}

fn view_params(query: &ViewQuery) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(ref end_key) = query.end_key {
        params.push(("endkey", end_key.to_string()));
    }
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

fn changes_params(request: &ChangesRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("feed", "continuous".to_string()),
        ("include_docs", "true".to_string()),
        ("since", request.since.clone()),
        ("heartbeat", request.heartbeat.as_millis().to_string()),
    ];
    if request.doc_type.is_some() {
        params.push(("filter", "_selector".to_string()));
    }
    params
}

fn bulk_delete_body(docs: &[DocumentRef]) -> Value {
    let docs: Vec<Value> = docs
        .iter()
        .map(|d| json!({ "_id": d.id, "_rev": d.rev, "_deleted": true }))
        .collect();
    json!({ "docs": docs })
}
