// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Broadcast Bus
//!
//! A cross-replica notification bus for horizontally scaled services that
//! already share a CouchDB-compatible document store.
//!
//! ## Architecture
//!
//! Every replica writes small broadcast documents into the shared database
//! and tails its continuous change feed:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            broadcast-bus                             │
//! │                                                                      │
//! │  ┌─────────────┐  POST /{db}          ┌───────────────────────────┐  │
//! │  │ Broadcaster │─────────────────────►│                           │  │
//! │  └─────────────┘                      │                           │  │
//! │                                       │   shared document store   │  │
//! │  ┌─────────────┐  _changes (NDJSON)   │        (CouchDB)          │  │
//! │  │ FeedRunner  │◄─────────────────────│                           │  │
//! │  │ (reconnect) │                      │                           │  │
//! │  └──────┬──────┘                      │                           │  │
//! │         ▼                             │                           │  │
//! │  DocumentHandler                      │                           │  │
//! │                                       │                           │  │
//! │  ┌─────────────┐  view + _bulk_docs   │                           │  │
//! │  │    Tidy     │─────────────────────►│                           │  │
//! │  └─────────────┘                      └───────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is best-effort and at-most-once: each feed session starts at
//! the current end of the feed, so documents written while a replica is
//! disconnected are never delivered to it. A broadcaster also receives its
//! own broadcasts; compare [`BroadcastEnvelope::origin`] to filter them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use broadcast_bus::{Bus, BusConfig};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> broadcast_bus::Result<()> {
//!     let bus = Bus::connect(BusConfig::for_testing("replica-a"))?;
//!
//!     let mut feed = bus.start_feed(|doc: serde_json::Value| {
//!         println!("broadcast: {doc}");
//!     });
//!     let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!     let tidy = bus.spawn_tidy(shutdown_rx);
//!
//!     bus.broadcaster().broadcast(None).await?;
//!
//!     feed.stop().await;
//!     let _ = shutdown_tx.send(true);
//!     if let Some(task) = tidy {
//!         let _ = task.await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod couch;
pub mod descriptor;
pub mod envelope;
pub mod error;
pub mod feed;
pub mod framing;
pub mod metrics;
pub mod resilience;
pub mod runner;
pub mod store;
pub mod tidy;

// Re-exports for convenience
pub use broadcast::Broadcaster;
pub use bus::Bus;
pub use config::{BusConfig, FeedConfig, ReconnectConfig, StoreConfig, TidyConfig};
pub use couch::CouchStore;
pub use descriptor::{ConnectionDescriptor, Scheme};
pub use envelope::BroadcastEnvelope;
pub use error::{BusError, Result};
pub use feed::{DocumentHandler, FeedReader, FeedSettings};
pub use resilience::{Backoff, BackoffPolicy};
pub use runner::{FeedRunner, FeedRunnerHandle, RunnerHealth, RunnerState};
pub use store::{DocumentStore, StoreError};
pub use tidy::{Tidy, TidyCriteria, TidyReport};
