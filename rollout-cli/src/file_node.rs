use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rollout::{CoordinationError, Coordinator, NodeStat, WatchEvent, WatchSignal};
use tokio::sync::{mpsc, oneshot};

/// Editors tend to emit several events per save.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Serves a local JSON file as a coordination-service node. Node paths are
/// filesystem paths; watches are filesystem notifications on the parent
/// directory. Files carry no version, so every stat reports version 0 and
/// writes are unconditional.
pub struct FileCoordinator;

fn not_found_as_no_node(path: &str, err: io::Error) -> CoordinationError {
    if err.kind() == io::ErrorKind::NotFound {
        CoordinationError::NoNode(path.to_string())
    } else {
        CoordinationError::Io(err)
    }
}

/// Check whether a notify event touches the watched file.
fn event_affects(event: &notify::Event, file_name: &OsString) -> bool {
    event
        .paths
        .iter()
        .any(|p| p.file_name().is_some_and(|n| n == file_name))
}

fn classify(kind: &EventKind) -> Option<WatchEvent> {
    match kind {
        EventKind::Modify(_) | EventKind::Create(_) => Some(WatchEvent::DataChanged),
        EventKind::Remove(_) => Some(WatchEvent::NodeDeleted),
        _ => None,
    }
}

fn arm(path: &Path, mut fire: oneshot::Sender<WatchEvent>) -> Result<(), CoordinationError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| CoordinationError::NoNode(path.display().to_string()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, mut rx) = mpsc::channel::<WatchEvent>(1);
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                if let Some(kind) = classify(&event.kind) {
                    if event_affects(&event, &file_name) {
                        let _ = tx.try_send(kind);
                    }
                }
            }
        })
        .map_err(|e| CoordinationError::Io(io::Error::other(e)))?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| CoordinationError::Io(io::Error::other(e)))?;

    tokio::spawn(async move {
        // Keep watcher alive until the one-shot fires or nobody listens
        let _watcher = watcher;
        let event = tokio::select! {
            _ = fire.closed() => return,
            event = rx.recv() => event.unwrap_or(WatchEvent::Disconnected),
        };
        tokio::time::sleep(DEBOUNCE).await;
        let _ = fire.send(event);
    });
    Ok(())
}

#[async_trait]
impl Coordinator for FileCoordinator {
    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn get_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, NodeStat, WatchSignal), CoordinationError> {
        // arm first so a write racing with the read still wakes us
        let (fire, signal) = WatchSignal::channel();
        arm(Path::new(path), fire)?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| not_found_as_no_node(path, e))?;
        Ok((data, NodeStat::default(), signal))
    }

    async fn set(
        &self,
        path: &str,
        data: &[u8],
        _version: i32,
    ) -> Result<NodeStat, CoordinationError> {
        tokio::fs::write(path, data)
            .await
            .map_err(|e| not_found_as_no_node(path, e))?;
        Ok(NodeStat::default())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn reads_file_and_fires_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"{"feature:a":"1||"}"#).unwrap();
        let path = path.to_str().unwrap();

        assert!(FileCoordinator.exists(path).await.unwrap());
        let (data, stat, watch) = FileCoordinator.get_and_watch(path).await.unwrap();
        assert_eq!(data, br#"{"feature:a":"1||"}"#);
        assert_eq!(stat.version, 0);

        FileCoordinator
            .set(path, br#"{"feature:a":"2||"}"#, -1)
            .await
            .unwrap();
        let event = timeout(Duration::from_secs(10), watch.fired())
            .await
            .unwrap();
        assert_eq!(event, WatchEvent::DataChanged);
    }

    #[tokio::test]
    async fn missing_file_is_no_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let path = path.to_str().unwrap();

        assert!(!FileCoordinator.exists(path).await.unwrap());
        assert!(matches!(
            FileCoordinator.get_and_watch(path).await,
            Err(CoordinationError::NoNode(_))
        ));
    }
}
