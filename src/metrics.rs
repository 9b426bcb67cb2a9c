// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Emits through the `metrics` facade; the host process installs the
//! exporter. Covers:
//! - Change feed sessions and delivered documents
//! - Reconnection backoff
//! - Broadcast writes
//! - Tidy cycles
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `bus_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use broadcast_bus::metrics;
//! use std::time::Duration;
//!
//! metrics::record_broadcast(true, Duration::from_millis(12));
//! metrics::record_tidy_cycle(40, 38, 2, Duration::from_millis(90));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record how a feed session ended (`closed`, `failed`, `cancelled`, `open_failed`).
pub fn record_feed_session(outcome: &str) {
    counter!("bus_feed_sessions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record documents handed to the document handler.
pub fn record_documents_delivered(count: u64) {
    counter!("bus_documents_delivered_total").increment(count);
}

/// Record changes skipped before delivery (`deleted`, `no_doc`, `type_mismatch`).
pub fn record_documents_skipped(reason: &str, count: u64) {
    counter!("bus_documents_skipped_total", "reason" => reason.to_string()).increment(count);
}

/// Record change records dropped because they failed to parse.
pub fn record_dropped_records(count: u64) {
    counter!("bus_dropped_records_total").increment(count);
}

/// Record the delay chosen before the next reconnect.
pub fn record_reconnect_delay(delay: Duration) {
    histogram!("bus_reconnect_delay_seconds").record(delay.as_secs_f64());
}

/// Current consecutive failure count of the feed runner.
pub fn set_consecutive_failures(failures: u32) {
    gauge!("bus_consecutive_failures").set(failures as f64);
}

/// Record runner state.
pub fn set_runner_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Streaming" => 2.0,
        "Backoff" => 3.0,
        "Stopped" => 4.0,
        _ => -1.0,
    };
    gauge!("bus_runner_state").set(value);
}

/// Record a broadcast write.
pub fn record_broadcast(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("bus_broadcasts_total", "status" => status).increment(1);
    histogram!("bus_broadcast_duration_seconds").record(duration.as_secs_f64());
}

/// Record a completed tidy cycle.
pub fn record_tidy_cycle(listed: usize, deleted: usize, failed: usize, duration: Duration) {
    counter!("bus_tidy_cycles_total", "status" => "success").increment(1);
    counter!("bus_tidy_listed_total").increment(listed as u64);
    counter!("bus_tidy_deleted_total").increment(deleted as u64);
    if failed > 0 {
        counter!("bus_tidy_failed_total").increment(failed as u64);
    }
    histogram!("bus_tidy_duration_seconds").record(duration.as_secs_f64());
}

/// Record a tidy cycle aborted by a listing failure.
pub fn record_tidy_listing_failure() {
    counter!("bus_tidy_cycles_total", "status" => "listing_failed").increment(1);
}

/// Record an error by kind.
pub fn record_error(kind: &str) {
    counter!("bus_errors_total", "kind" => kind.to_string()).increment(1);
}
