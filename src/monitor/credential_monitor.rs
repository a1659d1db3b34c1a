use super::callbacks::Callbacks;
use super::builder::{CredentialMonitorBuilder, ReconnectConfig};
use super::errors::{AccessError, MetricsErrorKind, MonitorError};
use super::metrics::MetricsRecorder;
use super::state::{MonitorState, PublishedState};
use crate::connection::{build_connection, Connection, Connector};
use crate::prelude::{debug, error};
use crate::secret::{ResourceVersion, Secret, SecretRef};
use crate::store::{SecretStore, StoreError, StoreFactory};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle for receiving publication notifications from a [`CredentialMonitor`].
///
/// Each successful publication increments a sequence number. The connection
/// obtained at construction has sequence 0. Slow receivers may skip
/// intermediate sequence numbers.
#[derive(Clone, Debug)]
pub struct CredentialUpdates {
    rx: watch::Receiver<u64>,
}

impl CredentialUpdates {
    /// Waits for the next publication and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Closed`] if the monitor has been dropped.
    pub async fn changed(&mut self) -> Result<u64, AccessError> {
        self.rx.changed().await.map_err(|_| AccessError::Closed)?;
        Ok(*self.rx.borrow_and_update())
    }

    /// Returns the last sequence number without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Waits until the sequence number satisfies `f`.
    ///
    /// Returns immediately if the current sequence number already does.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Closed`] if the monitor has been dropped.
    pub async fn wait_for<F>(&mut self, mut f: F) -> Result<u64, AccessError>
    where
        F: FnMut(&u64) -> bool,
    {
        let current = self.last();
        if f(&current) {
            return Ok(current);
        }
        loop {
            let seq = self.changed().await?;
            if f(&seq) {
                return Ok(seq);
            }
        }
    }
}

/// Keeps a validated connection in sync with a credentials secret.
///
/// A monitor is built with a connection derived from the current contents of
/// the secret. [`CredentialMonitor::run`] then watches the secret and
/// publishes a new connection every time its version changes and the new
/// contents yield a connection that passes validation. Secrets that cannot be
/// parsed or whose connection is rejected are logged and skipped; the last
/// good connection stays in place.
///
/// Cloning a monitor yields another handle to the same state.
///
/// # Example
///
/// ```no_run
/// use credential_monitor::store::memory::InMemorySecretStore;
/// use credential_monitor::{
///     BoxError, Callbacks, Connection, ConnectionSettings, CredentialMonitor, SecretRef,
/// };
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # fn connect(_: ConnectionSettings) -> Result<Arc<dyn Connection>, BoxError> { unimplemented!() }
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let monitor = CredentialMonitor::builder()
///     .secret(SecretRef::new("default", "ovirt-credentials"))
///     .store(Arc::new(InMemorySecretStore::new()))
///     .connector(connect)
///     .callbacks(Callbacks::new().on_credentials_change(|_conn| {}))
///     .build()
///     .await?;
///
/// let cancel = CancellationToken::new();
/// let task = monitor.spawn(cancel.clone());
///
/// let connection = monitor.current()?;
/// println!("connected to {}", connection.url());
///
/// cancel.cancel();
/// task.await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct CredentialMonitor {
    inner: Arc<Inner>,
}

pub(super) struct Inner {
    secret: SecretRef,
    store: Arc<dyn SecretStore>,
    connector: Arc<dyn Connector>,
    callbacks: Callbacks,
    reconnect: ReconnectConfig,
    metrics: Option<Arc<dyn MetricsRecorder>>,

    // Guarded by one lock: publications, callback dispatch and reads.
    published: Mutex<PublishedState>,

    update_tx: watch::Sender<u64>,
    state_tx: watch::Sender<MonitorState>,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialMonitor")
            .field("secret", &self.secret)
            .field("store", &"<SecretStore>")
            .field("connector", &"<Connector>")
            .field("callbacks", &self.callbacks)
            .field("reconnect", &self.reconnect)
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

/// Result of offering a secret to the publish procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PublishOutcome {
    Published,
    Unchanged,
}

impl CredentialMonitor {
    /// Creates a builder for configuring a [`CredentialMonitor`].
    pub fn builder() -> CredentialMonitorBuilder {
        CredentialMonitorBuilder::new()
    }

    /// Builds a monitor for `secret` using an opened store client.
    ///
    /// Shorthand for the builder with default reconnect settings.
    ///
    /// # Errors
    ///
    /// See [`CredentialMonitorBuilder::build`].
    pub async fn new<C>(
        store: Arc<dyn SecretStore>,
        secret: SecretRef,
        callbacks: Callbacks,
        connector: C,
    ) -> Result<Self, MonitorError>
    where
        C: Connector,
    {
        CredentialMonitorBuilder::new()
            .store(store)
            .secret(secret)
            .callbacks(callbacks)
            .connector(connector)
            .build()
            .await
    }

    /// Returns the current connection.
    ///
    /// If a validator is configured it is run against the connection first,
    /// while holding the same lock as publications. A connection that fails
    /// this check is not returned, even though the monitor keeps it until a
    /// new secret version arrives.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::StaleOrInvalidCredentials`] if the validator
    /// rejects the connection.
    pub fn current(&self) -> Result<Arc<dyn Connection>, AccessError> {
        let published = self.inner.lock_published();
        if let Err(e) = self.inner.callbacks.validate(published.connection.as_ref()) {
            error!(
                "Stored credentials for secret {} are invalid: version={}, error={}",
                self.inner.secret, published.version, e
            );
            self.inner.record_error(MetricsErrorKind::AccessRejected);
            return Err(AccessError::StaleOrInvalidCredentials(e));
        }
        Ok(Arc::clone(&published.connection))
    }

    /// Version of the secret the current connection was built from.
    pub fn version(&self) -> ResourceVersion {
        self.inner.lock_published().version.clone()
    }

    /// The watched secret.
    pub fn secret(&self) -> &SecretRef {
        &self.inner.secret
    }

    /// Current phase of the watch loop.
    pub fn state(&self) -> MonitorState {
        *self.inner.state_tx.borrow()
    }

    /// Returns a handle for receiving publication notifications.
    pub fn updated(&self) -> CredentialUpdates {
        CredentialUpdates {
            rx: self.inner.update_tx.subscribe(),
        }
    }

    /// Watches the secret until `cancel` fires.
    ///
    /// Invokes the monitor running hook on entry and the shutting down hook
    /// exactly once before returning. Subscription failures and closed watches
    /// are retried forever at the configured interval; none of them end the
    /// loop.
    pub async fn run(&self, cancel: CancellationToken) {
        self.inner.run_supervisor(cancel).await;
    }

    /// Runs [`CredentialMonitor::run`] on a new tokio task.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    }

    pub(super) async fn build_with(
        secret: SecretRef,
        make_store: StoreFactory,
        connector: Arc<dyn Connector>,
        callbacks: Callbacks,
        reconnect: ReconnectConfig,
        initial_fetch_timeout: Duration,
        metrics: Option<Arc<dyn MetricsRecorder>>,
    ) -> Result<Self, MonitorError> {
        let store = (make_store)().await.map_err(MonitorError::StoreConnect)?;

        let initial = match tokio::time::timeout(initial_fetch_timeout, store.get(&secret)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(initial_fetch_timeout)),
        }
        .map_err(|source| MonitorError::InitialFetch {
            secret: secret.clone(),
            source,
        })?;

        let connection = build_connection(&initial, connector.as_ref())?;
        callbacks.validate(connection.as_ref())?;
        debug!(
            "Initial credentials loaded from secret {}: version={}",
            secret,
            initial.version()
        );

        let (update_tx, _) = watch::channel(0u64);
        let (state_tx, _) = watch::channel(MonitorState::Idle);

        let inner = Inner {
            secret,
            store,
            connector,
            callbacks,
            reconnect,
            metrics,
            published: Mutex::new(PublishedState::new(initial.version().clone(), connection)),
            update_tx,
            state_tx,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

impl Inner {
    pub(super) fn secret(&self) -> &SecretRef {
        &self.secret
    }

    pub(super) fn store(&self) -> &dyn SecretStore {
        self.store.as_ref()
    }

    pub(super) fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    pub(super) fn reconnect(&self) -> ReconnectConfig {
        self.reconnect
    }

    pub(super) fn metrics(&self) -> Option<&dyn MetricsRecorder> {
        self.metrics.as_deref()
    }

    pub(super) fn set_state(&self, state: MonitorState) {
        self.state_tx.send_replace(state);
    }

    pub(super) fn record_error(&self, kind: MetricsErrorKind) {
        if let Some(metrics) = self.metrics() {
            metrics.record_error(kind);
        }
    }

    // A panicking callback poisons the lock; the state itself is only ever
    // replaced as a whole, so it is still consistent.
    fn lock_published(&self) -> MutexGuard<'_, PublishedState> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Parses, validates, stores and announces `secret` as one critical section.
    ///
    /// A secret whose version matches the published one is ignored. On error
    /// the published state is left untouched.
    pub(super) fn publish(&self, secret: &Secret) -> Result<PublishOutcome, MonitorError> {
        let mut published = self.lock_published();
        if published.version == *secret.version() {
            return Ok(PublishOutcome::Unchanged);
        }

        let connection = build_connection(secret, self.connector.as_ref())
            .inspect_err(|_| self.record_error(MetricsErrorKind::ParseFailed))?;
        self.callbacks
            .validate(connection.as_ref())
            .inspect_err(|_| self.record_error(MetricsErrorKind::ValidationFailed))?;

        published.replace(secret.version().clone(), Arc::clone(&connection));
        if let Some(metrics) = self.metrics() {
            metrics.record_update();
        }

        self.callbacks.credentials_changed(&connection);
        self.update_tx.send_replace(published.sequence);
        Ok(PublishOutcome::Published)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::connection::{
        ConnectionSettings, INSECURE_FIELD, PASSWORD_FIELD, URL_FIELD, USERNAME_FIELD,
    };
    use crate::store::memory::InMemorySecretStore;
    use crate::BoxError;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use url::Url;

    #[derive(Debug)]
    struct FakeConnection {
        url: Url,
        username: String,
    }

    impl Connection for FakeConnection {
        fn url(&self) -> &Url {
            &self.url
        }
        fn username(&self) -> &str {
            &self.username
        }
        fn test(&self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn connect(settings: ConnectionSettings) -> Result<Arc<dyn Connection>, BoxError> {
        Ok(Arc::new(FakeConnection {
            url: settings.url().clone(),
            username: settings.username().to_owned(),
        }))
    }

    fn fields(url: &str) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            (URL_FIELD, url.as_bytes().to_vec()),
            (USERNAME_FIELD, b"admin@internal".to_vec()),
            (PASSWORD_FIELD, b"secret".to_vec()),
            (INSECURE_FIELD, b"true".to_vec()),
        ]
    }

    fn secret(version: &str, url: &str) -> Secret {
        let data: BTreeMap<String, Vec<u8>> = fields(url)
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        Secret::new(version, data)
    }

    /// Test metrics recorder that counts error recordings by kind.
    #[derive(Default)]
    struct CountingMetrics {
        updates: AtomicU32,
        errors: std::sync::Mutex<HashMap<MetricsErrorKind, u32>>,
    }

    impl CountingMetrics {
        fn count(&self, kind: MetricsErrorKind) -> u32 {
            *self.errors.lock().unwrap().get(&kind).unwrap_or(&0)
        }
    }

    impl MetricsRecorder for CountingMetrics {
        fn record_update(&self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        fn record_reconnect(&self) {}
        fn record_error(&self, kind: MetricsErrorKind) {
            *self.errors.lock().unwrap().entry(kind).or_insert(0) += 1;
        }
    }

    struct Fixture {
        monitor: CredentialMonitor,
        changes: Arc<AtomicU32>,
        accept: Arc<AtomicBool>,
        metrics: Arc<CountingMetrics>,
    }

    async fn fixture() -> Fixture {
        let store = InMemorySecretStore::new();
        let secret_ref = SecretRef::new("default", "ovirt-credentials");
        store.put(&secret_ref, fields("https://a.example.com/"));

        let changes = Arc::new(AtomicU32::new(0));
        let accept = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(CountingMetrics::default());

        let callbacks = Callbacks::new()
            .on_credentials_change({
                let changes = Arc::clone(&changes);
                move |_| {
                    changes.fetch_add(1, Ordering::SeqCst);
                }
            })
            .validate_credentials({
                let accept = Arc::clone(&accept);
                move |_: &dyn Connection| -> Result<(), BoxError> {
                    if accept.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err("rejected".into())
                    }
                }
            });

        let monitor = CredentialMonitor::builder()
            .secret(secret_ref)
            .store(Arc::new(store))
            .connector(connect)
            .callbacks(callbacks)
            .metrics(metrics.clone())
            .build()
            .await
            .unwrap();

        Fixture {
            monitor,
            changes,
            accept,
            metrics,
        }
    }

    #[tokio::test]
    async fn construction_publishes_initial_connection_without_callback() {
        let f = fixture().await;
        let conn = f.monitor.current().unwrap();
        assert_eq!(conn.url().as_str(), "https://a.example.com/");
        assert_eq!(f.monitor.version().as_str(), "1");
        assert_eq!(f.monitor.state(), MonitorState::Idle);
        assert_eq!(f.monitor.updated().last(), 0);
        assert_eq!(f.changes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn same_version_is_ignored() {
        let f = fixture().await;
        let before = f.monitor.current().unwrap();

        let outcome = f
            .monitor
            .inner
            .publish(&secret("1", "https://b.example.com/"))
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Unchanged);
        assert!(Arc::ptr_eq(&before, &f.monitor.current().unwrap()));
        assert_eq!(f.changes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_version_is_published_and_announced() {
        let f = fixture().await;
        let mut updates = f.monitor.updated();

        let outcome = f
            .monitor
            .inner
            .publish(&secret("7", "https://b.example.com/"))
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(
            f.monitor.current().unwrap().url().as_str(),
            "https://b.example.com/"
        );
        assert_eq!(f.monitor.version().as_str(), "7");
        assert_eq!(f.changes.load(Ordering::SeqCst), 1);
        assert_eq!(updates.changed().await.unwrap(), 1);
        assert_eq!(f.metrics.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_secret_keeps_previous_connection() {
        let f = fixture().await;
        let before = f.monitor.current().unwrap();

        let mut broken = BTreeMap::new();
        broken.insert(URL_FIELD.to_owned(), b"https://b.example.com/".to_vec());
        let err = f
            .monitor
            .inner
            .publish(&Secret::new("2", broken))
            .unwrap_err();

        assert!(matches!(err, MonitorError::Parse(_)));
        assert!(Arc::ptr_eq(&before, &f.monitor.current().unwrap()));
        assert_eq!(f.monitor.version().as_str(), "1");
        assert_eq!(f.changes.load(Ordering::SeqCst), 0);
        assert_eq!(f.metrics.count(MetricsErrorKind::ParseFailed), 1);
    }

    #[tokio::test]
    async fn rejected_connection_is_not_published() {
        let f = fixture().await;
        f.accept.store(false, Ordering::SeqCst);

        let err = f
            .monitor
            .inner
            .publish(&secret("2", "https://b.example.com/"))
            .unwrap_err();
        assert!(matches!(err, MonitorError::Validation(_)));
        assert_eq!(f.metrics.count(MetricsErrorKind::ValidationFailed), 1);

        f.accept.store(true, Ordering::SeqCst);
        assert_eq!(
            f.monitor.current().unwrap().url().as_str(),
            "https://a.example.com/"
        );
        assert_eq!(f.changes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn read_time_rejection_returns_error_and_keeps_state() {
        let f = fixture().await;
        f.accept.store(false, Ordering::SeqCst);

        assert!(matches!(
            f.monitor.current(),
            Err(AccessError::StaleOrInvalidCredentials(_))
        ));
        assert_eq!(f.metrics.count(MetricsErrorKind::AccessRejected), 1);
        assert_eq!(f.monitor.version().as_str(), "1");

        f.accept.store(true, Ordering::SeqCst);
        assert!(f.monitor.current().is_ok());
    }

    #[tokio::test]
    async fn change_hook_receives_the_connection_readers_get() {
        let store = InMemorySecretStore::new();
        let secret_ref = SecretRef::new("default", "ovirt-credentials");
        store.put(&secret_ref, fields("https://a.example.com/"));

        let announced: Arc<Mutex<Option<Arc<dyn Connection>>>> = Arc::new(Mutex::new(None));
        let callbacks = Callbacks::new()
            .on_credentials_change({
                let announced = Arc::clone(&announced);
                move |conn| {
                    *announced.lock().unwrap() = Some(conn);
                }
            })
            .skip_validation();

        let monitor = CredentialMonitor::builder()
            .secret(secret_ref)
            .store(Arc::new(store))
            .connector(connect)
            .callbacks(callbacks)
            .build()
            .await
            .unwrap();

        monitor
            .inner
            .publish(&secret("2", "https://b.example.com/"))
            .unwrap();

        let announced = announced.lock().unwrap().take().unwrap();
        let current = monitor.current().unwrap();
        assert!(std::ptr::addr_eq(
            Arc::as_ptr(&announced),
            Arc::as_ptr(&current)
        ));
        assert_eq!(announced.url().as_str(), "https://b.example.com/");
    }

    #[tokio::test]
    async fn readers_never_see_version_and_connection_out_of_step() {
        const LAST_VERSION: u64 = 1000;

        let store = InMemorySecretStore::new();
        let secret_ref = SecretRef::new("default", "ovirt-credentials");
        store.put(&secret_ref, fields("https://v1.example.com/"));

        let monitor = CredentialMonitor::builder()
            .secret(secret_ref)
            .store(Arc::new(store))
            .connector(connect)
            .callbacks(
                Callbacks::new()
                    .on_credentials_change(|_| {})
                    .skip_validation(),
            )
            .build()
            .await
            .unwrap();
        let inner = monitor.inner.as_ref();
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut reads = 0u64;
                        loop {
                            let finished = done.load(Ordering::SeqCst);
                            let published = inner.lock_published();
                            let expected = format!("v{}.example.com", published.version);
                            assert_eq!(
                                published.connection.url().host_str(),
                                Some(expected.as_str())
                            );
                            reads += 1;
                            if finished {
                                return reads;
                            }
                        }
                    })
                })
                .collect();

            for v in 2..=LAST_VERSION {
                let url = format!("https://v{v}.example.com/");
                let outcome = inner.publish(&secret(&v.to_string(), &url)).unwrap();
                assert_eq!(outcome, PublishOutcome::Published);
            }
            done.store(true, Ordering::SeqCst);

            for reader in readers {
                assert!(reader.join().unwrap() > 0);
            }
        });

        assert_eq!(monitor.version().as_str(), LAST_VERSION.to_string());
        assert_eq!(monitor.updated().last(), LAST_VERSION - 1);
    }

    #[tokio::test]
    async fn updates_wait_for_returns_immediately_when_satisfied() {
        let (tx, rx) = watch::channel(5u64);
        let mut updates = CredentialUpdates { rx };

        assert_eq!(updates.wait_for(|&seq| seq > 3).await.unwrap(), 5);

        tx.send_replace(10);
        assert_eq!(updates.wait_for(|&seq| seq > 8).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn updates_report_closed_monitor() {
        let (tx, rx) = watch::channel(0u64);
        let mut updates = CredentialUpdates { rx };
        drop(tx);

        assert!(matches!(updates.changed().await, Err(AccessError::Closed)));
    }
}
