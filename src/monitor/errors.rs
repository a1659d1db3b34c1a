use crate::connection::ParseError;
use crate::secret::{SecretRef, SecretRefError};
use crate::store::StoreError;
use crate::BoxError;
use std::fmt;
use thiserror::Error;

/// Errors returned while building a [`CredentialMonitor`](super::CredentialMonitor).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitorError {
    /// The secret reference is incomplete.
    #[error("secret configuration validation failed: {0}")]
    InvalidSecretRef(#[from] SecretRefError),

    /// No credentials change callback was configured.
    #[error("the credentials change callback is required")]
    MissingCredentialsChangeCallback,

    /// No connector was configured.
    #[error("a connector is required to build connections")]
    MissingConnector,

    /// No secret store was configured.
    #[error("a secret store is required")]
    MissingStore,

    /// The store client could not be opened.
    #[error("failed to create store client: {0}")]
    StoreConnect(#[source] StoreError),

    /// The initial fetch of the secret failed.
    #[error("failed to fetch secret {secret}: {source}")]
    InitialFetch {
        /// The secret that was requested.
        secret: SecretRef,
        /// The store failure.
        #[source]
        source: StoreError,
    },

    /// The secret does not hold a usable configuration.
    #[error("the secret contains an invalid configuration: {0}")]
    Parse(#[from] ParseError),

    /// The connection built from the secret was rejected by the validator.
    #[error("the credentials are invalid: {0}")]
    Validation(#[from] ValidationError),
}

/// A validator rejected a connection.
#[derive(Debug, Error)]
#[error("credential validation failed: {0}")]
pub struct ValidationError(#[source] BoxError);

impl ValidationError {
    /// Wraps the reason a connection was rejected.
    pub fn new(cause: impl Into<BoxError>) -> Self {
        Self(cause.into())
    }

    /// Returns the reason the connection was rejected.
    pub fn into_inner(self) -> BoxError {
        self.0
    }
}

/// Errors returned to readers of a [`CredentialMonitor`](super::CredentialMonitor).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AccessError {
    /// The published connection failed validation when it was read.
    #[error("stored credentials are invalid: {0}")]
    StaleOrInvalidCredentials(#[source] ValidationError),

    /// The monitor has been dropped.
    #[error("credential monitor is closed")]
    Closed,
}

/// Error kinds for structured metrics reporting.
///
/// Use these stable, low-cardinality labels when recording metrics.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MetricsErrorKind {
    /// Failed to open a watch on the secret.
    WatchOpen,
    /// Failed to fetch the secret after opening a watch.
    Fetch,
    /// The watch stream ended.
    StreamEnded,
    /// A secret could not be parsed into a connection.
    ParseFailed,
    /// A new connection was rejected by the validator before publication.
    ValidationFailed,
    /// A reader was refused the published connection.
    AccessRejected,
}

impl MetricsErrorKind {
    /// Returns a string representation of the error kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WatchOpen => "watch_open",
            Self::Fetch => "fetch",
            Self::StreamEnded => "stream_ended",
            Self::ParseFailed => "parse_failed",
            Self::ValidationFailed => "validation_failed",
            Self::AccessRejected => "access_rejected",
        }
    }
}

impl fmt::Display for MetricsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
