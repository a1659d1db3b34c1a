use super::errors::MetricsErrorKind;

/// Trait for recording metrics from a [`CredentialMonitor`](super::CredentialMonitor).
///
/// Implement this trait to integrate with your metrics system (e.g., Prometheus, `StatsD`).
///
/// # Example
///
/// ```no_run
/// use credential_monitor::monitor::{MetricsErrorKind, MetricsRecorder};
///
/// struct MyMetrics;
///
/// impl MetricsRecorder for MyMetrics {
///     fn record_update(&self) {}
///
///     fn record_reconnect(&self) {}
///
///     fn record_error(&self, kind: MetricsErrorKind) {
///         println!("error: {}", kind.as_str());
///     }
/// }
/// ```
pub trait MetricsRecorder: Send + Sync {
    /// Records that new credentials were published.
    fn record_update(&self);

    /// Records that the monitor is about to back off before re-subscribing.
    ///
    /// Recorded exactly once per backoff wait.
    fn record_reconnect(&self);

    /// Records an error with a structured error kind.
    fn record_error(&self, kind: MetricsErrorKind);
}
