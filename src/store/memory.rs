//! In-process [`SecretStore`] implementation.
//!
//! Versions are assigned from a per-store counter on every write. Watches are
//! served from unbounded channels, so a notification is delivered to every
//! watch that is open at the time of the write.

use super::{SecretStore, SecretWatch, StoreError, StoreFuture, WatchEvent, WatchEventKind};
use crate::secret::{ResourceVersion, Secret, SecretRef};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A [`SecretStore`] that keeps secrets in memory.
///
/// Cloning the store yields another handle to the same secrets.
#[derive(Clone, Debug, Default)]
pub struct InMemorySecretStore {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    secrets: HashMap<SecretRef, Secret>,
    watchers: Vec<Watcher>,
    last_version: u64,
    next_watch_id: u64,
    unavailable: Option<String>,
    gets: u64,
    watches_opened: u64,
    watches_stopped: u64,
}

#[derive(Debug)]
struct Watcher {
    id: u64,
    secret: SecretRef,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl State {
    fn broadcast(&mut self, secret: &SecretRef, event: &WatchEvent) {
        // Receivers that were dropped without stopping are pruned here.
        self.watchers
            .retain(|w| &w.secret != secret || w.tx.send(event.clone()).is_ok());
    }

    fn next_version(&mut self) -> ResourceVersion {
        self.last_version += 1;
        ResourceVersion::from(self.last_version)
    }
}

impl InMemorySecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or replaces `secret` with `data` and notifies open watches.
    ///
    /// Returns the version assigned to the write.
    pub fn put<I, K, V>(&self, secret: &SecretRef, data: I) -> ResourceVersion
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let data: BTreeMap<String, Vec<u8>> = data
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut state = self.lock();
        let version = state.next_version();
        let value = Secret::new(version.clone(), data);
        let kind = if state.secrets.contains_key(secret) {
            WatchEventKind::Modified
        } else {
            WatchEventKind::Added
        };
        state.secrets.insert(secret.clone(), value.clone());
        state.broadcast(secret, &WatchEvent::new(kind, Some(value)));
        version
    }

    /// Sends a [`WatchEventKind::Modified`] event for the stored value of
    /// `secret` without changing its version.
    ///
    /// Returns `false` if the secret does not exist.
    pub fn redeliver(&self, secret: &SecretRef) -> bool {
        let mut state = self.lock();
        let Some(value) = state.secrets.get(secret).cloned() else {
            return false;
        };
        state.broadcast(secret, &WatchEvent::modified(value));
        true
    }

    /// Sends an arbitrary event to the open watches of `secret`.
    pub fn notify(&self, secret: &SecretRef, event: WatchEvent) {
        self.lock().broadcast(secret, &event);
    }

    /// Removes `secret` and notifies open watches.
    ///
    /// Returns `false` if the secret did not exist.
    pub fn delete(&self, secret: &SecretRef) -> bool {
        let mut state = self.lock();
        let Some(value) = state.secrets.remove(secret) else {
            return false;
        };
        state.broadcast(
            secret,
            &WatchEvent::new(WatchEventKind::Deleted, Some(value)),
        );
        true
    }

    /// Ends every open watch stream, as a server side disconnect would.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Makes every subsequent `get` and `watch` fail with
    /// [`StoreError::Unavailable`] until [`InMemorySecretStore::set_available`] is called.
    pub fn set_unavailable(&self, reason: impl Into<String>) {
        self.lock().unavailable = Some(reason.into());
    }

    /// Restores normal operation after [`InMemorySecretStore::set_unavailable`].
    pub fn set_available(&self) {
        self.lock().unavailable = None;
    }

    /// Number of `get` calls served successfully.
    pub fn get_count(&self) -> u64 {
        self.lock().gets
    }

    /// Number of watches opened.
    pub fn watch_count(&self) -> u64 {
        self.lock().watches_opened
    }

    /// Number of watches explicitly stopped (or dropped) by their owner.
    pub fn stopped_watch_count(&self) -> u64 {
        self.lock().watches_stopped
    }

    /// Number of watches currently registered.
    pub fn open_watch_count(&self) -> usize {
        self.lock().watchers.len()
    }

    fn get_now(&self, secret: &SecretRef) -> Result<Secret, StoreError> {
        let mut state = self.lock();
        if let Some(reason) = &state.unavailable {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        let value = state
            .secrets
            .get(secret)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(secret.clone()))?;
        state.gets += 1;
        Ok(value)
    }

    fn watch_now(&self, secret: &SecretRef) -> Result<SecretWatch, StoreError> {
        let mut state = self.lock();
        if let Some(reason) = &state.unavailable {
            return Err(StoreError::Unavailable(reason.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_watch_id;
        state.next_watch_id += 1;
        state.watches_opened += 1;
        state.watchers.push(Watcher {
            id,
            secret: secret.clone(),
            tx,
        });

        let shared = Arc::clone(&self.state);
        Ok(
            SecretWatch::new(UnboundedReceiverStream::new(rx)).with_stop(move || {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                state.watchers.retain(|w| w.id != id);
                state.watches_stopped += 1;
            }),
        )
    }
}

impl SecretStore for InMemorySecretStore {
    fn get<'a>(&'a self, secret: &'a SecretRef) -> StoreFuture<'a, Secret> {
        Box::pin(futures::future::ready(self.get_now(secret)))
    }

    fn watch<'a>(&'a self, secret: &'a SecretRef) -> StoreFuture<'a, SecretWatch> {
        Box::pin(futures::future::ready(self.watch_now(secret)))
    }
}
