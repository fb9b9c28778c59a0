use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

/// Version argument for [`Coordinator::set`] that skips the version check.
pub const ANY_VERSION: i32 = -1;

/// Node metadata returned alongside its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    pub version: i32,
}

/// What made a watch fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    DataChanged,
    NodeDeleted,
    /// The service dropped the subscription (session loss, shutdown).
    Disconnected,
}

/// Connection-level state reported by a coordination-service session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    HasSession,
    Disconnected,
    Expired,
    Unknown,
}

impl SessionState {
    /// Expired and unknown sessions cannot recover on their own.
    pub fn is_fatal(self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Unknown)
    }
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One-shot change notification for a single node.
///
/// Fires at most once. A dropped sender counts as [`WatchEvent::Disconnected`]
/// so a waiting loop always wakes up and refetches.
#[derive(Debug)]
pub struct WatchSignal {
    rx: oneshot::Receiver<WatchEvent>,
}

impl WatchSignal {
    /// Returns the sending half the coordinator keeps until the node changes.
    pub fn channel() -> (oneshot::Sender<WatchEvent>, WatchSignal) {
        let (tx, rx) = oneshot::channel();
        (tx, WatchSignal { rx })
    }

    pub async fn fired(self) -> WatchEvent {
        self.rx.await.unwrap_or(WatchEvent::Disconnected)
    }
}

/// The three operations the rollout watcher needs from a coordination service.
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, CoordinationError>;

    /// Fetch the node payload and leave a one-shot watch on it.
    async fn get_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, NodeStat, WatchSignal), CoordinationError>;

    /// Replace the node payload if its version still matches
    /// (or unconditionally with [`ANY_VERSION`]).
    async fn set(&self, path: &str, data: &[u8], version: i32)
        -> Result<NodeStat, CoordinationError>;
}
