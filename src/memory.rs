use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::coordinator::{
    CoordinationError, Coordinator, NodeStat, SessionState, WatchEvent, WatchSignal, ANY_VERSION,
};

struct Node {
    data: Vec<u8>,
    version: i32,
    watches: Vec<oneshot::Sender<WatchEvent>>,
}

impl Node {
    fn fire(&mut self, event: WatchEvent) {
        for watch in self.watches.drain(..) {
            let _ = watch.send(event);
        }
    }
}

/// In-process coordination service backed by a `Mutex<HashMap>`.
///
/// Nodes carry a version bumped on every write; watches are one-shot and are
/// consumed by the first change. `fail_next_gets` and `fail_next_exists`
/// inject transport errors.
pub struct MemoryCoordinator {
    nodes: Mutex<HashMap<String, Node>>,
    failing_gets: AtomicUsize,
    failing_exists: AtomicUsize,
    sessions: Mutex<Vec<mpsc::UnboundedSender<SessionState>>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            failing_gets: AtomicUsize::new(0),
            failing_exists: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub async fn create(&self, path: &str, data: &[u8]) -> Result<NodeStat, CoordinationError> {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: 0,
                watches: Vec::new(),
            },
        );
        Ok(NodeStat { version: 0 })
    }

    pub async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let mut nodes = self.nodes.lock().await;
        let mut node = nodes
            .remove(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        node.fire(WatchEvent::NodeDeleted);
        Ok(())
    }

    /// The next `count` calls to `get_and_watch` fail with a connection loss.
    pub fn fail_next_gets(&self, count: usize) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// The next `count` calls to `exists` fail with a connection loss.
    pub fn fail_next_exists(&self, count: usize) {
        self.failing_exists.store(count, Ordering::SeqCst);
    }

    /// Number of watches currently armed on `path`.
    pub async fn pending_watches(&self, path: &str) -> usize {
        let mut nodes = self.nodes.lock().await;
        match nodes.get_mut(path) {
            Some(node) => {
                node.watches.retain(|w| !w.is_closed());
                node.watches.len()
            }
            None => 0,
        }
    }

    /// Subscribes to session state changes published with [`Self::emit_session`].
    pub async fn session_events(&self) -> mpsc::UnboundedReceiver<SessionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().await.push(tx);
        rx
    }

    /// Publishes a session state. A fatal state also drops every armed watch.
    pub async fn emit_session(&self, state: SessionState) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|tx| tx.send(state).is_ok());
        drop(sessions);

        if state.is_fatal() {
            let mut nodes = self.nodes.lock().await;
            for node in nodes.values_mut() {
                node.fire(WatchEvent::Disconnected);
            }
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        if Self::take_failure(&self.failing_exists) {
            return Err(CoordinationError::ConnectionLoss(format!(
                "injected failure checking {}",
                path
            )));
        }
        Ok(self.nodes.lock().await.contains_key(path))
    }

    async fn get_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, NodeStat, WatchSignal), CoordinationError> {
        if Self::take_failure(&self.failing_gets) {
            return Err(CoordinationError::ConnectionLoss(format!(
                "injected failure reading {}",
                path
            )));
        }
        let mut nodes = self.nodes.lock().await;
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        let (tx, signal) = WatchSignal::channel();
        node.watches.push(tx);
        Ok((
            node.data.clone(),
            NodeStat {
                version: node.version,
            },
            signal,
        ))
    }

    async fn set(
        &self,
        path: &str,
        data: &[u8],
        version: i32,
    ) -> Result<NodeStat, CoordinationError> {
        let mut nodes = self.nodes.lock().await;
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        if version != ANY_VERSION && version != node.version {
            return Err(CoordinationError::BadVersion {
                path: path.to_string(),
                expected: version,
                actual: node.version,
            });
        }
        node.data = data.to_vec();
        node.version += 1;
        node.fire(WatchEvent::DataChanged);
        Ok(NodeStat {
            version: node.version,
        })
    }
}
