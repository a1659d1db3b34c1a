#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! This crate keeps a connection to a management API in sync with the
//! credentials stored in a secret of a cluster secret store.
//!
//! The secret holds the API URL, a username and password, and either a CA
//! bundle or an explicit opt-out of certificate verification. A
//! [`CredentialMonitor`] turns the current contents of the secret into a
//! validated [`Connection`], then watches the secret and swaps in a new
//! connection every time the secret changes and the new credentials work.
//! Components that need the API ask the monitor for the current connection
//! and are told through a callback whenever it changes.
//!
//! The store client and the management API client are supplied by the
//! embedder through the [`SecretStore`] and [`Connector`] traits.
//!
//! # Example
//!
//! ```no_run
//! use credential_monitor::store::memory::InMemorySecretStore;
//! use credential_monitor::{
//!     BoxError, Callbacks, Connection, ConnectionSettings, CredentialMonitor, SecretRef,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn connect(_: ConnectionSettings) -> Result<Arc<dyn Connection>, BoxError> { unimplemented!() }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Resolve the secret from CREDENTIALS_SECRET_NAME / CREDENTIALS_SECRET_NAMESPACE
//! let secret = SecretRef::from_env()?;
//!
//! let monitor = CredentialMonitor::builder()
//!     .secret(secret)
//!     .store(Arc::new(InMemorySecretStore::new()))
//!     .connector(connect)
//!     .callbacks(Callbacks::new().on_credentials_change(|conn| {
//!         println!("credentials changed, now using {}", conn.url());
//!     }))
//!     .build()
//!     .await?;
//!
//! // Watch for changes in the background
//! let cancel = CancellationToken::new();
//! let task = monitor.spawn(cancel.clone());
//!
//! // Use the current connection
//! let connection = monitor.current()?;
//! println!("talking to {} as {}", connection.url(), connection.username());
//!
//! cancel.cancel();
//! task.await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`logging`** (default): emit events through the `log` facade
//! - **`tracing`**: emit events through `tracing` instead

mod observability;
mod prelude;

pub mod connection;
pub mod monitor;
pub mod secret;
pub mod store;

/// Boxed error type used at trait boundaries implemented by embedders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// -----------------------
// Re-exports
// -----------------------

pub use crate::observability::LOG_TARGET;

pub use crate::connection::{Connection, ConnectionSettings, Connector, ParseError, TlsPolicy};

pub use crate::monitor::{
    AccessError, Callbacks, CredentialMonitor, CredentialMonitorBuilder, CredentialUpdates,
    CredentialValidator, MonitorError, MonitorState, ProbeValidator, ReconnectConfig,
    ValidationError,
};

pub use crate::secret::{ResourceVersion, Secret, SecretRef, SecretRefError};

pub use crate::store::{SecretStore, SecretWatch, StoreError, WatchEvent, WatchEventKind};
