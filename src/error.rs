// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the broadcast bus.
//!
//! Errors are categorized by how the rest of the process should react to
//! them. Store-level failures keep the underlying [`StoreError`] (including
//! the HTTP status, when there is one) so callers can inspect it.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Connection string or settings invalid |
//! | `Connection` | Yes | Feed could not be opened, or the stream dropped |
//! | `Framing` | No | A single change record is malformed or oversized |
//! | `Desync` | Yes | Repeated corrupt records; session torn down and reopened |
//! | `Write` | Store-dependent | Broadcaster's create-document call failed |
//! | `Listing` | Store-dependent | Tidy's index query failed |
//! | `InvalidPayload` | No | Caller passed a payload that is not an object |
//!
//! # Retry Behavior
//!
//! The feed runner retries `Connection` and `Desync` on its own. `Write`
//! and `Listing` are handed back to the caller untouched; use
//! [`BusError::is_retryable()`] if you want to decide on a retry.

use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur on the bus.
#[derive(Error, Debug)]
pub enum BusError {
    /// Invalid or missing configuration.
    ///
    /// Fatal at startup. Fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure talking to the store's change feed.
    #[error("Connection error ({operation}): {source}")]
    Connection {
        operation: String,
        #[source]
        source: StoreError,
    },

    /// A change record could not be framed.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Too many consecutive records failed to parse.
    #[error("Feed desynchronized after {consecutive} consecutive unparseable records")]
    Desync { consecutive: usize },

    /// The Broadcaster's create-document call failed.
    #[error("Broadcast write failed: {0}")]
    Write(#[source] StoreError),

    /// Tidy's index query failed.
    #[error("Broadcast listing failed: {0}")]
    Listing(#[source] StoreError),

    /// Payload was not a JSON object (or null).
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl BusError {
    /// Create a connection error for the given operation.
    pub fn connection(operation: impl Into<String>, source: StoreError) -> Self {
        Self::Connection {
            operation: operation.into(),
            source,
        }
    }

    /// The store error behind this error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Connection { source, .. } => Some(source),
            Self::Write(e) | Self::Listing(e) => Some(e),
            _ => None,
        }
    }

    /// HTTP status reported by the store, if any.
    pub fn status(&self) -> Option<u16> {
        self.store_error().and_then(|e| e.status)
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Desync { .. } => true,
            Self::Write(e) | Self::Listing(e) => e.is_transient(),
            Self::Config(_) => false,
            Self::Framing(_) => false,
            Self::InvalidPayload(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection { .. } => "connection",
            Self::Framing(_) => "framing",
            Self::Desync { .. } => "desync",
            Self::Write(_) => "write",
            Self::Listing(_) => "listing",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}
