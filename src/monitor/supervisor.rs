//! The watch loop behind [`CredentialMonitor::run`](super::CredentialMonitor::run).
//!
//! ```text
//! Starting -> Subscribing -> Streaming -> Backoff -> Subscribing -> ...
//!                  |             |           |
//!                  +--> Backoff  +-----------+--> ShuttingDown -> Stopped
//! ```
//!
//! Cancellation is observed only while streaming and while backing off.

use super::credential_monitor::{Inner, PublishOutcome};
use super::errors::MetricsErrorKind;
use super::state::MonitorState;
use crate::prelude::{debug, error, info, warn};
use crate::secret::Secret;
use crate::store::{SecretWatch, StoreError, WatchEventKind};
use futures::StreamExt as _;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Number of consecutive identical connectivity failures logged at WARN
/// before further repeats are downgraded to DEBUG.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Category of connectivity failure, for log suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorKey {
    WatchOpen,
    Fetch,
    StreamEnded,
}

/// Tracks repeated connectivity failures to suppress log noise.
///
/// The first occurrences of each kind are logged at WARN; after
/// `max_consecutive` identical failures in a row they drop to DEBUG.
pub(crate) struct ErrorTracker {
    last_error_kind: Option<ErrorKey>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    /// Records a failure and returns whether it should be logged at WARN.
    pub(crate) fn record_error(&mut self, error_kind: ErrorKey) -> bool {
        let should_warn = self.last_error_kind != Some(error_kind)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_error_kind == Some(error_kind) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(error_kind);
        }

        should_warn
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }

    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }
}

/// Sleeps for `dur` unless `token` fires first. Returns `true` on cancellation.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Why [`Inner::process_watch_events`] returned.
enum StreamOutcome {
    Cancelled,
    Ended,
}

impl Inner {
    pub(super) async fn run_supervisor(&self, cancel: CancellationToken) {
        let mut state = MonitorState::Starting;
        let mut watch: Option<SecretWatch> = None;
        let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        loop {
            self.set_state(state);
            state = match state {
                MonitorState::Starting => {
                    info!("Starting credential monitor for secret {}", self.secret());
                    self.callbacks().monitor_running();
                    MonitorState::Subscribing
                }
                MonitorState::Subscribing => {
                    watch = self.subscribe(&mut error_tracker).await;
                    if watch.is_some() {
                        MonitorState::Streaming
                    } else {
                        MonitorState::Backoff
                    }
                }
                MonitorState::Streaming => {
                    let outcome = match watch.as_mut() {
                        Some(w) => self.process_watch_events(w, &cancel).await,
                        None => StreamOutcome::Ended,
                    };
                    match outcome {
                        StreamOutcome::Cancelled => MonitorState::ShuttingDown,
                        StreamOutcome::Ended => {
                            let should_warn = error_tracker.record_error(ErrorKey::StreamEnded);
                            if should_warn {
                                warn!(
                                    "Watching secret {} failed: the watch stream ended; reconnecting",
                                    self.secret()
                                );
                            } else {
                                debug!(
                                    "Watching secret {} failed (repeated): consecutive_failures={}",
                                    self.secret(),
                                    error_tracker.consecutive_count()
                                );
                            }
                            self.record_error(MetricsErrorKind::StreamEnded);
                            if let Some(mut w) = watch.take() {
                                w.stop();
                            }
                            MonitorState::Backoff
                        }
                    }
                }
                MonitorState::Backoff => {
                    if let Some(metrics) = self.metrics() {
                        metrics.record_reconnect();
                    }
                    let delay = self.reconnect().next_delay();
                    debug!(
                        "Waiting before re-subscribing to secret {}: backoff_ms={}",
                        self.secret(),
                        delay.as_millis()
                    );
                    if sleep_or_cancel(&cancel, delay).await {
                        MonitorState::ShuttingDown
                    } else {
                        MonitorState::Subscribing
                    }
                }
                MonitorState::ShuttingDown => {
                    info!(
                        "Shutting down credential monitoring for secret {}",
                        self.secret()
                    );
                    if let Some(mut w) = watch.take() {
                        w.stop();
                    }
                    self.callbacks().monitor_shutting_down();
                    MonitorState::Stopped
                }
                MonitorState::Idle | MonitorState::Stopped => return,
            };
        }
    }

    /// Opens a watch, then fetches and publishes the current secret.
    ///
    /// The fetch after the watch is open covers changes that happened before
    /// the watch started delivering.
    async fn subscribe(&self, error_tracker: &mut ErrorTracker) -> Option<SecretWatch> {
        debug!("Watching secret {} for changes", self.secret());

        let mut watch = match self.store().watch(self.secret()).await {
            Ok(w) => w,
            Err(e) => {
                self.connectivity_failure(error_tracker, ErrorKey::WatchOpen, &e);
                return None;
            }
        };

        let secret = match self.store().get(self.secret()).await {
            Ok(s) => s,
            Err(e) => {
                watch.stop();
                self.connectivity_failure(error_tracker, ErrorKey::Fetch, &e);
                return None;
            }
        };

        if error_tracker.consecutive_count() > 0 {
            info!(
                "Watch on secret {} recovered after {} consecutive failures",
                self.secret(),
                error_tracker.consecutive_count()
            );
        }
        error_tracker.reset();

        self.apply_secret(&secret);
        Some(watch)
    }

    fn connectivity_failure(
        &self,
        error_tracker: &mut ErrorTracker,
        key: ErrorKey,
        e: &StoreError,
    ) {
        let (action, metric) = match key {
            ErrorKey::WatchOpen => ("creating a watch for", MetricsErrorKind::WatchOpen),
            ErrorKey::Fetch | ErrorKey::StreamEnded => ("fetching", MetricsErrorKind::Fetch),
        };

        if error_tracker.record_error(key) {
            warn!(
                "{} secret {} failed; retrying: error={}",
                action,
                self.secret(),
                e
            );
        } else {
            debug!(
                "{} secret {} failed (repeated); retrying: error={}, consecutive_failures={}",
                action,
                self.secret(),
                e,
                error_tracker.consecutive_count()
            );
        }
        self.record_error(metric);
    }

    /// Processes events until the watch ends or cancellation is requested.
    async fn process_watch_events(
        &self,
        watch: &mut SecretWatch,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Cancellation signal received; stopping watch loop");
                    return StreamOutcome::Cancelled;
                }
                e = watch.next() => e,
            };

            let Some(event) = event else {
                return StreamOutcome::Ended;
            };

            debug!("Change type {:?} received", event.kind());
            if event.kind() != WatchEventKind::Modified {
                continue;
            }
            if let Some(secret) = event.into_secret() {
                self.apply_secret(&secret);
            }
        }
    }

    /// Runs the publish procedure and logs the outcome. Never fails.
    fn apply_secret(&self, secret: &Secret) {
        match self.publish(secret) {
            Ok(PublishOutcome::Published) => info!(
                "Credentials in secret {} have changed: version={}",
                self.secret(),
                secret.version()
            ),
            Ok(PublishOutcome::Unchanged) => debug!(
                "Secret {} unchanged: version={}",
                self.secret(),
                secret.version()
            ),
            Err(e) => error!(
                "Secret {} contains an invalid configuration; keeping current credentials: version={}, error={}",
                self.secret(),
                secret.version(),
                e
            ),
        }
    }
}
