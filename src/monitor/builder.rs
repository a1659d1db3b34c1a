use super::callbacks::Callbacks;
use super::credential_monitor::CredentialMonitor;
use super::errors::MonitorError;
use super::metrics::MetricsRecorder;
use crate::connection::Connector;
use crate::secret::SecretRef;
use crate::store::{store_factory, SecretStore, StoreFactory};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Reconnect configuration.
///
/// After a failed subscription or a closed watch the monitor waits `interval`
/// plus a random delay in `[0, max_jitter]` before subscribing again. Retries
/// never stop and the delay never grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Fixed delay between subscription attempts.
    pub interval: Duration,
    /// Upper bound of the random delay added to `interval`.
    pub max_jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_jitter: Duration::ZERO,
        }
    }
}

impl ReconnectConfig {
    /// Delay to wait before the next subscription attempt.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn next_delay(&self) -> Duration {
        let jitter_ms = self.max_jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval
            .saturating_add(Duration::from_millis(fastrand::u64(0..=jitter_ms)))
    }
}

/// Builder for [`CredentialMonitor`].
///
/// # Example
///
/// ```no_run
/// use credential_monitor::store::memory::InMemorySecretStore;
/// use credential_monitor::{
///     BoxError, Callbacks, Connection, ConnectionSettings, CredentialMonitor, SecretRef,
/// };
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # fn connect(_: ConnectionSettings) -> Result<Arc<dyn Connection>, BoxError> { unimplemented!() }
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let monitor = CredentialMonitor::builder()
///     .secret(SecretRef::new("kube-system", "ovirt-credentials"))
///     .store(Arc::new(InMemorySecretStore::new()))
///     .connector(connect)
///     .callbacks(Callbacks::new().on_credentials_change(|conn| {
///         println!("now talking to {}", conn.url());
///     }))
///     .reconnect_interval(Duration::from_secs(30))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct CredentialMonitorBuilder {
    secret: Option<SecretRef>,
    make_store: Option<StoreFactory>,
    connector: Option<Arc<dyn Connector>>,
    callbacks: Callbacks,
    reconnect: ReconnectConfig,
    initial_fetch_timeout: Duration,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl Debug for CredentialMonitorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialMonitorBuilder")
            .field("secret", &self.secret)
            .field(
                "make_store",
                &self.make_store.as_ref().map(|_| "<StoreFactory>"),
            )
            .field("connector", &self.connector.as_ref().map(|_| "<Connector>"))
            .field("callbacks", &self.callbacks)
            .field("reconnect", &self.reconnect)
            .field("initial_fetch_timeout", &self.initial_fetch_timeout)
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}

impl Default for CredentialMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialMonitorBuilder {
    /// Creates a builder with default reconnect settings and callbacks.
    pub fn new() -> Self {
        Self {
            secret: None,
            make_store: None,
            connector: None,
            callbacks: Callbacks::new(),
            reconnect: ReconnectConfig::default(),
            initial_fetch_timeout: Duration::from_secs(60),
            metrics: None,
        }
    }

    /// Sets the secret to watch.
    #[must_use]
    pub fn secret(mut self, secret: SecretRef) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Uses an already opened store client.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.make_store = Some(store_factory(store));
        self
    }

    /// Sets a factory that opens the store client during [`build`](Self::build).
    #[must_use]
    pub fn store_factory(mut self, factory: StoreFactory) -> Self {
        self.make_store = Some(factory);
        self
    }

    /// Sets the library used to turn credentials into connections.
    #[must_use]
    pub fn connector<C>(mut self, connector: C) -> Self
    where
        C: Connector,
    {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Sets the lifecycle hooks and validator.
    #[must_use]
    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Sets the delay between subscription attempts. Default is one minute.
    #[must_use]
    pub const fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect.interval = interval;
        self
    }

    /// Sets the full reconnect configuration.
    #[must_use]
    pub const fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets how long [`build`](Self::build) waits for the initial fetch. Default is one minute.
    #[must_use]
    pub const fn initial_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.initial_fetch_timeout = timeout;
        self
    }

    /// Sets an optional metrics recorder.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds a monitor holding a validated connection.
    ///
    /// Opens the store client, fetches the secret, builds a connection from
    /// it and validates that connection. The returned monitor does not watch
    /// for changes until [`CredentialMonitor::run`] is called.
    ///
    /// # Errors
    ///
    /// Returns a [`MonitorError`] if the configuration is incomplete, the store
    /// cannot be reached, the secret cannot be fetched or parsed, or the
    /// resulting connection fails validation.
    pub async fn build(self) -> Result<CredentialMonitor, MonitorError> {
        let secret = self.secret.unwrap_or_else(|| SecretRef::new("", ""));
        secret.validate()?;

        if !self.callbacks.has_credentials_change() {
            return Err(MonitorError::MissingCredentialsChangeCallback);
        }
        let connector = self.connector.ok_or(MonitorError::MissingConnector)?;
        let make_store = self.make_store.ok_or(MonitorError::MissingStore)?;

        CredentialMonitor::build_with(
            secret,
            make_store,
            connector,
            self.callbacks,
            self.reconnect,
            self.initial_fetch_timeout,
            self.metrics,
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_is_one_minute_without_jitter() {
        let config = ReconnectConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = ReconnectConfig {
            interval: Duration::from_secs(10),
            max_jitter: Duration::from_millis(500),
        };
        for _ in 0..100 {
            let delay = config.next_delay();
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_millis(10_500));
        }
    }

    #[test]
    fn reconnect_interval_setter_keeps_jitter() {
        let builder = CredentialMonitorBuilder::new()
            .reconnect(ReconnectConfig {
                interval: Duration::from_secs(5),
                max_jitter: Duration::from_secs(1),
            })
            .reconnect_interval(Duration::from_secs(30));
        assert_eq!(builder.reconnect.interval, Duration::from_secs(30));
        assert_eq!(builder.reconnect.max_jitter, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn build_rejects_missing_secret_ref() {
        let err = CredentialMonitorBuilder::new().build().await.unwrap_err();
        assert!(matches!(err, MonitorError::InvalidSecretRef(_)));
    }

    #[tokio::test]
    async fn build_requires_credentials_change_callback() {
        let err = CredentialMonitorBuilder::new()
            .secret(SecretRef::new("default", "ovirt-credentials"))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MonitorError::MissingCredentialsChangeCallback
        ));
    }
}
