use crate::connection::Connection;
use crate::secret::ResourceVersion;
use std::fmt;
use std::sync::Arc;

/// Phase of the watch loop driven by [`CredentialMonitor::run`](super::CredentialMonitor::run).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum MonitorState {
    /// The monitor is built but the loop is not running.
    Idle,
    /// The loop is announcing that it is running.
    Starting,
    /// Opening a watch and fetching the current secret.
    Subscribing,
    /// Processing change notifications.
    Streaming,
    /// Waiting before the next subscription attempt.
    Backoff,
    /// Releasing the watch and announcing shutdown.
    ShuttingDown,
    /// The loop has returned.
    Stopped,
}

impl MonitorState {
    /// Returns a stable string representation of the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Backoff => "backoff",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The version and connection currently handed out to readers.
///
/// Both fields are replaced together and only after the connection was built
/// and validated.
#[derive(Debug)]
pub(super) struct PublishedState {
    pub(super) version: ResourceVersion,
    pub(super) connection: Arc<dyn Connection>,
    // Number of publications since construction.
    pub(super) sequence: u64,
}

impl PublishedState {
    pub(super) fn new(version: ResourceVersion, connection: Arc<dyn Connection>) -> Self {
        Self {
            version,
            connection,
            sequence: 0,
        }
    }

    pub(super) fn replace(&mut self, version: ResourceVersion, connection: Arc<dyn Connection>) {
        self.version = version;
        self.connection = connection;
        self.sequence += 1;
    }
}
