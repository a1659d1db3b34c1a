//! Boundary to the remote store that owns the credential secret.
//!
//! The monitor only needs two operations from a store: an authoritative
//! [`get`](SecretStore::get) and a [`watch`](SecretStore::watch) that yields
//! change notifications until it ends or is stopped. Implementations for a
//! concrete backend (for example a Kubernetes API client) live outside this
//! crate; [`memory::InMemorySecretStore`] is provided for local use and tests.

pub mod memory;

use crate::secret::{Secret, SecretRef};
use crate::BoxError;
use futures::stream::{BoxStream, Stream};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`SecretStore`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The secret does not exist.
    #[error("secret {0} not found")]
    NotFound(SecretRef),

    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The request did not complete in time.
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),

    /// Any other backend failure.
    #[error("store error: {0}")]
    Other(#[source] BoxError),
}

/// Future returned by [`SecretStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Future returned by a [`StoreFactory`].
pub type StoreClientFuture =
    Pin<Box<dyn Future<Output = Result<Arc<dyn SecretStore>, StoreError>> + Send + 'static>>;

/// Opens a client for the remote store.
///
/// Connection parameters are captured by the closure; the monitor never inspects them.
pub type StoreFactory = Arc<dyn Fn() -> StoreClientFuture + Send + Sync + 'static>;

/// Read and watch access to secrets in a remote store.
pub trait SecretStore: Send + Sync + 'static {
    /// Fetches the current contents of `secret`.
    fn get<'a>(&'a self, secret: &'a SecretRef) -> StoreFuture<'a, Secret>;

    /// Opens a change notification stream for `secret`.
    ///
    /// Delivery between opening the watch and the next [`get`](SecretStore::get)
    /// is not required to be gap free.
    fn watch<'a>(&'a self, secret: &'a SecretRef) -> StoreFuture<'a, SecretWatch>;
}

/// Kind of change carried by a [`WatchEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum WatchEventKind {
    /// The secret was created.
    Added,
    /// The secret was modified.
    Modified,
    /// The secret was deleted.
    Deleted,
    /// A progress marker without a meaningful payload.
    Bookmark,
    /// The store reported an error on the stream.
    Error,
}

/// A single change notification.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    kind: WatchEventKind,
    secret: Option<Secret>,
}

impl WatchEvent {
    /// Creates an event of the given kind.
    pub fn new(kind: WatchEventKind, secret: Option<Secret>) -> Self {
        Self { kind, secret }
    }

    /// Creates a [`WatchEventKind::Modified`] event carrying `secret`.
    pub fn modified(secret: Secret) -> Self {
        Self::new(WatchEventKind::Modified, Some(secret))
    }

    /// Kind of the change.
    pub fn kind(&self) -> WatchEventKind {
        self.kind
    }

    /// Secret carried by the event, if any.
    pub fn secret(&self) -> Option<&Secret> {
        self.secret.as_ref()
    }

    /// Consumes the event and returns its secret, if any.
    pub fn into_secret(self) -> Option<Secret> {
        self.secret
    }
}

/// A stoppable stream of [`WatchEvent`]s.
///
/// Yields `None` once the underlying stream ends or after [`SecretWatch::stop`]
/// has been called. Dropping the watch stops it.
pub struct SecretWatch {
    events: Option<BoxStream<'static, WatchEvent>>,
    on_stop: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl SecretWatch {
    /// Wraps a stream of events.
    pub fn new<S>(events: S) -> Self
    where
        S: Stream<Item = WatchEvent> + Send + 'static,
    {
        Self {
            events: Some(Box::pin(events)),
            on_stop: None,
        }
    }

    /// Registers a hook that releases backend resources when the watch is stopped.
    #[must_use]
    pub fn with_stop<F>(mut self, on_stop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_stop = Some(Box::new(on_stop));
        self
    }

    /// Stops the watch. Idempotent.
    pub fn stop(&mut self) {
        self.events = None;
        if let Some(on_stop) = self.on_stop.take() {
            on_stop();
        }
    }

    /// Returns `true` once the watch has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.events.is_none()
    }
}

impl Stream for SecretWatch {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.events.as_mut() {
            Some(events) => events.as_mut().poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for SecretWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SecretWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretWatch")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Wraps an already opened store client in a [`StoreFactory`].
pub fn store_factory(store: Arc<dyn SecretStore>) -> StoreFactory {
    Arc::new(move || {
        let store = Arc::clone(&store);
        Box::pin(async move { Ok(store) })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt as _;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn secret(version: &str) -> Secret {
        Secret::new(version, BTreeMap::new())
    }

    #[tokio::test]
    async fn stop_ends_stream_and_runs_hook_once() {
        let stops = Arc::new(AtomicU32::new(0));
        let hook = Arc::clone(&stops);
        let mut watch = SecretWatch::new(futures::stream::iter(vec![
            WatchEvent::modified(secret("1")),
            WatchEvent::modified(secret("2")),
        ]))
        .with_stop(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });

        let first = watch.next().await.unwrap();
        assert_eq!(first.secret().unwrap().version().as_str(), "1");

        watch.stop();
        watch.stop();
        assert!(watch.is_stopped());
        assert!(watch.next().await.is_none());
        drop(watch);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_stops_watch() {
        let stops = Arc::new(AtomicU32::new(0));
        let hook = Arc::clone(&stops);
        let watch = SecretWatch::new(futures::stream::pending()).with_stop(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });
        drop(watch);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
