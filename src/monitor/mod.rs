//! Credential monitor: keeps a validated connection in sync with a secret.
//!
//! A [`CredentialMonitor`] is built from the current contents of a secret and
//! holds the connection derived from it. [`CredentialMonitor::run`] watches the
//! secret and replaces that connection whenever a new version arrives whose
//! contents parse and whose connection passes validation. Invalid versions are
//! logged and skipped.
//!
//! Watch failures never end the loop. After a failed subscription or a closed
//! stream the monitor waits for the reconnect interval and subscribes again,
//! fetching the secret afresh so that no change is missed.
//!
//! Primary types are re-exported at the crate root. For advanced configuration
//! types (e.g. [`MetricsErrorKind`], [`MetricsRecorder`]), import from this
//! module.
//!
//! # Example
//!
//! ```no_run
//! use credential_monitor::monitor::{Callbacks, CredentialMonitor};
//! use credential_monitor::store::memory::InMemorySecretStore;
//! use credential_monitor::{BoxError, Connection, ConnectionSettings, SecretRef};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn connect(_: ConnectionSettings) -> Result<Arc<dyn Connection>, BoxError> { unimplemented!() }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let callbacks = Callbacks::new()
//!     .on_credentials_change(|conn| println!("credentials changed: {}", conn.url()))
//!     .on_monitor_shutting_down(|| println!("stopped"));
//!
//! let monitor = CredentialMonitor::new(
//!     Arc::new(InMemorySecretStore::new()),
//!     SecretRef::from_env()?,
//!     callbacks,
//!     connect,
//! )
//! .await?;
//!
//! let cancel = CancellationToken::new();
//! monitor.run(cancel).await;
//! # Ok(())
//! # }
//! ```

mod builder;
mod callbacks;
mod credential_monitor;
mod errors;
mod metrics;
mod state;
mod supervisor;
mod validation;

pub use builder::{CredentialMonitorBuilder, ReconnectConfig};
pub use callbacks::Callbacks;
pub use credential_monitor::{CredentialMonitor, CredentialUpdates};
pub use errors::{AccessError, MetricsErrorKind, MonitorError, ValidationError};
pub use metrics::MetricsRecorder;
pub use state::MonitorState;
pub use validation::{CredentialValidator, ProbeValidator};
