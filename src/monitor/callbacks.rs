use super::errors::ValidationError;
use super::validation::{run_validator, CredentialValidator, ProbeValidator};
use crate::connection::Connection;
use std::fmt;
use std::sync::Arc;

type LifecycleHook = Box<dyn Fn() + Send + Sync + 'static>;
type ChangeHook = Box<dyn Fn(Arc<dyn Connection>) + Send + Sync + 'static>;

/// Hooks invoked by a [`CredentialMonitor`](super::CredentialMonitor).
///
/// [`on_credentials_change`](Callbacks::on_credentials_change) is required;
/// every other hook is optional. Unless configured otherwise, connections are
/// validated with [`ProbeValidator`].
///
/// All hooks run synchronously on the monitor task. The credentials change
/// hook runs while the monitor holds its state lock, so it is serialized with
/// every other publication and every read. Panics raised by a hook are not
/// caught.
///
/// The lock is not reentrant: calling [`CredentialMonitor::current`] or
/// [`CredentialMonitor::version`] on the same monitor from inside the
/// credentials change hook or a validator deadlocks. Use the connection
/// passed to the hook instead.
///
/// [`CredentialMonitor::current`]: super::CredentialMonitor::current
/// [`CredentialMonitor::version`]: super::CredentialMonitor::version
pub struct Callbacks {
    on_credentials_change: Option<ChangeHook>,
    on_monitor_running: Option<LifecycleHook>,
    on_monitor_shutting_down: Option<LifecycleHook>,
    validator: Option<Arc<dyn CredentialValidator>>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field(
                "on_credentials_change",
                &self.on_credentials_change.as_ref().map(|_| "<Fn>"),
            )
            .field(
                "on_monitor_running",
                &self.on_monitor_running.as_ref().map(|_| "<Fn>"),
            )
            .field(
                "on_monitor_shutting_down",
                &self.on_monitor_shutting_down.as_ref().map(|_| "<Fn>"),
            )
            .field(
                "validator",
                &self.validator.as_ref().map(|_| "<CredentialValidator>"),
            )
            .finish()
    }
}

impl Callbacks {
    /// Creates a callback set with no hooks and the default validator.
    pub fn new() -> Self {
        Self {
            on_credentials_change: None,
            on_monitor_running: None,
            on_monitor_shutting_down: None,
            validator: Some(Arc::new(ProbeValidator)),
        }
    }

    /// Called with the new connection every time the credentials change.
    #[must_use]
    pub fn on_credentials_change<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<dyn Connection>) + Send + Sync + 'static,
    {
        self.on_credentials_change = Some(Box::new(f));
        self
    }

    /// Called once when [`CredentialMonitor::run`](super::CredentialMonitor::run) starts.
    #[must_use]
    pub fn on_monitor_running<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_monitor_running = Some(Box::new(f));
        self
    }

    /// Called once before [`CredentialMonitor::run`](super::CredentialMonitor::run) returns.
    #[must_use]
    pub fn on_monitor_shutting_down<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_monitor_shutting_down = Some(Box::new(f));
        self
    }

    /// Replaces the default validator.
    #[must_use]
    pub fn validate_credentials<V>(mut self, validator: V) -> Self
    where
        V: CredentialValidator,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Disables validation entirely.
    ///
    /// Readers then receive the last published connection even if it has
    /// stopped working since.
    #[must_use]
    pub fn skip_validation(mut self) -> Self {
        self.validator = None;
        self
    }

    pub(super) fn has_credentials_change(&self) -> bool {
        self.on_credentials_change.is_some()
    }

    pub(super) fn monitor_running(&self) {
        if let Some(f) = &self.on_monitor_running {
            f();
        }
    }

    pub(super) fn monitor_shutting_down(&self) {
        if let Some(f) = &self.on_monitor_shutting_down {
            f();
        }
    }

    pub(super) fn credentials_changed(&self, connection: &Arc<dyn Connection>) {
        if let Some(f) = &self.on_credentials_change {
            f(Arc::clone(connection));
        }
    }

    /// Runs the configured validator; always succeeds when validation is disabled.
    pub(super) fn validate(&self, connection: &dyn Connection) -> Result<(), ValidationError> {
        match &self.validator {
            Some(validator) => run_validator(validator.as_ref(), connection),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::BoxError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use url::Url;

    #[derive(Debug)]
    struct Unreachable(Url);

    impl Connection for Unreachable {
        fn url(&self) -> &Url {
            &self.0
        }
        fn username(&self) -> &str {
            "admin@internal"
        }
        fn test(&self) -> Result<(), BoxError> {
            Err("connection refused".into())
        }
    }

    fn unreachable() -> Arc<dyn Connection> {
        Arc::new(Unreachable(Url::parse("https://engine.example.com/").unwrap()))
    }

    #[test]
    fn default_callbacks_use_probe_validation() {
        let callbacks = Callbacks::new();
        assert!(!callbacks.has_credentials_change());
        assert!(callbacks.validate(unreachable().as_ref()).is_err());
    }

    #[test]
    fn skip_validation_accepts_everything() {
        let callbacks = Callbacks::new().skip_validation();
        assert!(callbacks.validate(unreachable().as_ref()).is_ok());
    }

    #[test]
    fn hooks_are_dispatched() {
        let running = Arc::new(AtomicU32::new(0));
        let stopping = Arc::new(AtomicU32::new(0));
        let changes = Arc::new(AtomicU32::new(0));

        let callbacks = Callbacks::new()
            .on_monitor_running({
                let running = Arc::clone(&running);
                move || {
                    running.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_monitor_shutting_down({
                let stopping = Arc::clone(&stopping);
                move || {
                    stopping.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_credentials_change({
                let changes = Arc::clone(&changes);
                move |conn| {
                    assert_eq!(conn.url().host_str(), Some("engine.example.com"));
                    changes.fetch_add(1, Ordering::SeqCst);
                }
            });

        callbacks.monitor_running();
        callbacks.credentials_changed(&unreachable());
        callbacks.monitor_shutting_down();

        assert_eq!(running.load(Ordering::SeqCst), 1);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(stopping.load(Ordering::SeqCst), 1);
    }
}
