// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Runner state types.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Created ─────────────→ Connecting ──────→ Streaming
//!                            ↑  │               │
//!                            │  │ (open failed) │ (feed ended)
//!                            │  ↓               ↓
//!                            └─ Backoff ←───────┘
//!
//! any state ── stop() ──→ Stopped
//! ```
//!
//! - **Created**: runner built, task not spawned.
//! - **Connecting**: opening the change feed.
//! - **Streaming**: session open, documents flowing.
//! - **Backoff**: session ended, waiting before the next attempt.
//! - **Stopped**: cancelled. Terminal.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// State of the feed runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Connecting,
    Streaming,
    Backoff,
    Stopped,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Created => write!(f, "Created"),
            RunnerState::Connecting => write!(f, "Connecting"),
            RunnerState::Streaming => write!(f, "Streaming"),
            RunnerState::Backoff => write!(f, "Backoff"),
            RunnerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Health snapshot for monitoring endpoints.
///
/// Collected from atomics and the state channel; no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerHealth {
    pub state: RunnerState,
    /// Currently streaming.
    pub healthy: bool,
    /// Failures since the last sustained session.
    pub consecutive_failures: u32,
    /// Sessions that got as far as an open stream.
    pub sessions_started: u64,
    pub documents_delivered: u64,
    /// `None` until the first document arrives.
    pub millis_since_document: Option<u64>,
}

/// Counters shared between the runner task and its handle.
#[derive(Debug, Default)]
pub(crate) struct RunnerStats {
    consecutive_failures: AtomicU32,
    sessions_started: AtomicU64,
    documents_delivered: AtomicU64,
    /// Epoch millis of the last delivery, 0 = never.
    last_document: AtomicU64,
}

impl RunnerStats {
    pub(crate) fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_document(&self) {
        self.documents_delivered.fetch_add(1, Ordering::Relaxed);
        self.last_document
            .store(crate::envelope::epoch_millis(), Ordering::Release);
    }

    pub(crate) fn set_consecutive_failures(&self, failures: u32) {
        self.consecutive_failures.store(failures, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, state: RunnerState) -> RunnerHealth {
        let last = self.last_document.load(Ordering::Acquire);
        RunnerHealth {
            state,
            healthy: state == RunnerState::Streaming,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            documents_delivered: self.documents_delivered.load(Ordering::Relaxed),
            millis_since_document: if last == 0 {
                None
            } else {
                Some(crate::envelope::epoch_millis().saturating_sub(last))
            },
        }
    }
}
