// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - CouchDB testcontainer setup
//! - In-memory MockStore with scripted failures
//! - A collecting document handler

#![allow(dead_code)]

pub mod containers;
pub mod mock_store;

pub use containers::*;
pub use mock_store::*;

use broadcast_bus::DocumentHandler;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Handler that keeps every delivered document.
#[derive(Clone, Default)]
pub struct Collector {
    docs: Arc<Mutex<Vec<Value>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn docs(&self) -> Vec<Value> {
        self.docs.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    /// Poll until at least `n` documents arrived or `timeout` passes.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.len() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.len() >= n
    }
}

impl DocumentHandler for Collector {
    fn on_document(&self, doc: Value) {
        self.docs.lock().unwrap().push(doc);
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
