// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Feed runner: keeps one change feed session alive for the life of the
//! process.
//!
//! # Loop
//!
//! 1. Open a session via [`FeedReader`]
//! 2. Stream until the session ends (error or clean close)
//! 3. If the session streamed for at least `reset_after`, reset backoff
//! 4. Sleep `min(initial * growth^failures, max)`, then go to 1
//!
//! Every new session starts at the head of the feed, so broadcasts
//! published while disconnected are not seen by this replica.
//!
//! # Cancellation
//!
//! Raising the shutdown signal aborts an in-flight open or read and skips
//! a pending backoff sleep. Records the store emits after that point are
//! not delivered.

mod types;

pub use types::{RunnerHealth, RunnerState};

use crate::error::BusError;
use crate::feed::{DocumentHandler, FeedReader, FeedSettings, SessionEnd};
use crate::metrics;
use crate::resilience::{Backoff, BackoffPolicy};
use crate::store::DocumentStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use types::RunnerStats;

/// How long [`FeedRunnerHandle::stop`] waits for the task to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// What one pass of the loop produced.
enum Step {
    Stop,
    Ended { streamed_for: Duration },
}

/// Reconnecting wrapper around [`FeedReader`].
pub struct FeedRunner<S: DocumentStore> {
    reader: FeedReader<S>,
    policy: BackoffPolicy,
    state_tx: watch::Sender<RunnerState>,
    state_rx: watch::Receiver<RunnerState>,
    stats: Arc<RunnerStats>,
}

impl<S: DocumentStore> FeedRunner<S> {
    pub fn new(store: Arc<S>, settings: FeedSettings, policy: BackoffPolicy) -> Self {
        let (state_tx, state_rx) = watch::channel(RunnerState::Created);
        Self {
            reader: FeedReader::new(store, settings),
            policy,
            state_tx,
            state_rx,
            stats: Arc::new(RunnerStats::default()),
        }
    }

    /// Get current runner state.
    pub fn state(&self) -> RunnerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<RunnerState> {
        self.state_rx.clone()
    }

    pub fn health(&self) -> RunnerHealth {
        self.stats.snapshot(self.state())
    }

    /// Spawn the loop on the current runtime.
    pub fn start<H>(self, handler: H) -> FeedRunnerHandle
    where
        H: DocumentHandler + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state_rx = self.state_rx.clone();
        let stats = Arc::clone(&self.stats);

        let task = tokio::spawn(async move {
            self.run(&handler, shutdown_rx).await;
        });

        FeedRunnerHandle {
            shutdown_tx,
            state_rx,
            stats,
            task: Some(task),
        }
    }

    /// Run until `shutdown` turns `true` or its sender is dropped.
    pub async fn run<H>(&self, handler: &H, mut shutdown: watch::Receiver<bool>)
    where
        H: DocumentHandler + ?Sized,
    {
        let database = self.reader.settings().database.clone();
        let stats = &self.stats;
        let counted = |doc: Value| {
            stats.record_document();
            handler.on_document(doc);
        };

        let mut backoff = Backoff::new(self.policy.clone());
        let mut attempt: u64 = 0;

        info!(database = %database, "Starting feed runner");

        loop {
            if *shutdown.borrow() {
                break;
            }
            attempt += 1;

            let span = info_span!("feed_session", database = %database, attempt);
            let step = async {
                self.set_state(RunnerState::Connecting);

                let opened = tokio::select! {
                    biased;
                    _ = cancelled(&mut shutdown) => return Step::Stop,
                    opened = self.reader.open() => opened,
                };

                let session = match opened {
                    Ok(session) => session,
                    Err(e) => {
                        log_session_error(&e, "Failed to open change feed");
                        metrics::record_feed_session("open_failed");
                        return Step::Ended {
                            streamed_for: Duration::ZERO,
                        };
                    }
                };

                self.stats.record_session_started();
                self.set_state(RunnerState::Streaming);
                info!("Change feed connected");

                let started = Instant::now();
                let run = session.run(&counted, &mut shutdown);
                let sustained = tokio::time::sleep(backoff.policy().reset_after);
                tokio::pin!(run, sustained);
                let mut sustained_fired = false;
                let report = loop {
                    tokio::select! {
                        report = &mut run => break report,
                        _ = &mut sustained, if !sustained_fired => {
                            sustained_fired = true;
                            if backoff.failures() > 0 {
                                debug!(
                                    previous_failures = backoff.failures(),
                                    "Session streaming past reset threshold, backoff reset"
                                );
                            }
                            backoff.reset();
                            self.stats.set_consecutive_failures(0);
                            metrics::set_consecutive_failures(0);
                        }
                    }
                };
                let streamed_for = started.elapsed();

                match report.end {
                    SessionEnd::Cancelled => Step::Stop,
                    SessionEnd::Closed => {
                        info!(
                            delivered = report.delivered,
                            dropped = report.dropped,
                            streamed_ms = streamed_for.as_millis() as u64,
                            "Change feed closed by store"
                        );
                        Step::Ended { streamed_for }
                    }
                    SessionEnd::Failed(e) => {
                        log_session_error(&e, "Change feed session failed");
                        debug!(
                            delivered = report.delivered,
                            dropped = report.dropped,
                            streamed_ms = streamed_for.as_millis() as u64,
                            "Session summary"
                        );
                        Step::Ended { streamed_for }
                    }
                }
            }
            .instrument(span)
            .await;

            let streamed_for = match step {
                Step::Stop => break,
                Step::Ended { streamed_for } => streamed_for,
            };

            if backoff.record_session(streamed_for) {
                debug!(streamed_ms = streamed_for.as_millis() as u64, "Sustained session, backoff reset");
            }
            let delay = backoff.next_delay();
            self.stats.set_consecutive_failures(backoff.failures());
            metrics::set_consecutive_failures(backoff.failures());
            metrics::record_reconnect_delay(delay);

            self.set_state(RunnerState::Backoff);
            info!(
                delay_ms = delay.as_millis() as u64,
                consecutive_failures = backoff.failures(),
                "Reconnecting change feed after backoff"
            );

            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(RunnerState::Stopped);
        info!(sessions = attempt, "Feed runner stopped");
    }

    fn set_state(&self, state: RunnerState) {
        let _ = self.state_tx.send(state);
        metrics::set_runner_state(&state.to_string());
    }
}

/// Resolves once shutdown is requested (or the sender is gone).
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn log_session_error(e: &BusError, message: &str) {
    metrics::record_error(e.kind());
    if e.is_retryable() {
        warn!(error = %e, "{}", message);
    } else {
        error!(error = %e, kind = e.kind(), "{}", message);
    }
}

/// Owned handle to a running [`FeedRunner`].
///
/// Dropping the handle without calling [`stop`](Self::stop) also ends the
/// runner at its next suspension point, but does not wait for it.
pub struct FeedRunnerHandle {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<RunnerState>,
    stats: Arc<RunnerStats>,
    task: Option<JoinHandle<()>>,
}

impl FeedRunnerHandle {
    pub fn state(&self) -> RunnerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<RunnerState> {
        self.state_rx.clone()
    }

    /// Whether the runner task is still alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Health snapshot. No I/O.
    pub fn health(&self) -> RunnerHealth {
        self.stats.snapshot(self.state())
    }

    /// Signal shutdown and wait for the task to finish.
    ///
    /// Calling it again, or after the task already ended, is a no-op.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        let Some(task) = self.task.take() else {
            return;
        };
        let abort = task.abort_handle();

        match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
            Ok(Ok(())) => debug!("Feed runner task completed"),
            Ok(Err(e)) => warn!(error = %e, "Feed runner task panicked"),
            Err(_) => {
                warn!("Feed runner task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}
