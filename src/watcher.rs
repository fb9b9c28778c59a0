use std::collections::HashMap;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::{self, WatcherBuilder};
use crate::coordinator::{Coordinator, NodeStat, SessionState};
use crate::error::{Error, Result};
use crate::store::{RuleSnapshot, RuleStore};

pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;
pub type UpdateHook = Arc<dyn Fn(&RuleSnapshot) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) on_fatal: Option<ErrorHook>,
    pub(crate) on_update: Option<UpdateHook>,
}

impl Hooks {
    fn report(&self, err: &Error) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }

    fn fatal(&self, err: Error) {
        error!(error = %err, "rollout watcher cannot recover");
        match &self.on_fatal {
            Some(cb) => cb(&err),
            None => process::exit(1),
        }
    }
}

struct Shared {
    coordinator: Arc<dyn Coordinator>,
    path: String,
    backoff: Duration,
    store: RuleStore,
    version: AtomicI32,
    hooks: Hooks,
}

impl Shared {
    fn install(&self, snapshot: RuleSnapshot, stat: NodeStat) {
        info!(
            path = %self.path,
            features = snapshot.len(),
            digest = snapshot.digest(),
            version = stat.version,
            "installed rollout rules"
        );
        self.store.replace(snapshot);
        if let Some(cb) = &self.hooks.on_update {
            let current = self.store.current();
            cb(current.as_ref());
        }
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    /// The refresh task is always first; once it exits the watcher is idle
    /// even if a session monitor is still attached.
    fn is_live(&self) -> bool {
        self.tasks.first().is_some_and(|task| !task.is_finished())
    }

    async fn shutdown(self, path: &str) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(path, error = %err, "rollout task panicked");
            }
        }
    }
}

/// Keeps a local copy of the rollout rules stored at one coordination-service
/// node and answers activation queries against it.
///
/// [`Watcher::start`] spawns a single refresh task that refetches the node every
/// time its watch fires. Queries never touch the network; they read whatever
/// snapshot the refresh task installed last.
pub struct Watcher {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Watcher {
    pub fn new(coordinator: Arc<dyn Coordinator>, path: &str) -> Self {
        builder::create_builder(coordinator, path).build()
    }

    pub fn builder(coordinator: Arc<dyn Coordinator>, path: &str) -> WatcherBuilder {
        builder::create_builder(coordinator, path)
    }

    pub(crate) fn from_parts(
        coordinator: Arc<dyn Coordinator>,
        path: String,
        backoff: Duration,
        hooks: Hooks,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                coordinator,
                path,
                backoff,
                store: RuleStore::new(),
                version: AtomicI32::new(0),
                hooks,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Checks the node exists, then launches the refresh task and returns.
    ///
    /// A watcher whose refresh task ended on a fatal error can be started
    /// again; the leftover tasks are reaped first.
    pub async fn start(&self) -> Result<()> {
        let finished = {
            let mut running = self.lock_running();
            match running.as_ref() {
                Some(current) if current.is_live() => return Err(Error::AlreadyStarted),
                Some(_) => running.take(),
                None => None,
            }
        };
        if let Some(finished) = finished {
            finished.shutdown(&self.shared.path).await;
        }

        info!(path = %self.shared.path, "starting rollout watcher");
        if !self.shared.coordinator.exists(&self.shared.path).await? {
            return Err(Error::PathNotFound(self.shared.path.clone()));
        }

        let mut running = self.lock_running();
        if running.as_ref().is_some_and(Running::is_live) {
            return Err(Error::AlreadyStarted);
        }
        if let Some(stale) = running.take() {
            stale.cancel.cancel();
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(Arc::clone(&self.shared), cancel.clone()));
        *running = Some(Running {
            cancel,
            tasks: vec![task],
        });
        Ok(())
    }

    /// Cancels the refresh task (and any session monitor) and waits for them
    /// to exit. Does nothing if the watcher is not running.
    pub async fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };
        running.shutdown(&self.shared.path).await;
    }

    /// False before [`Watcher::start`], after [`Watcher::stop`], and once the
    /// refresh task has given up on a fatal error.
    pub fn is_running(&self) -> bool {
        self.lock_running().as_ref().is_some_and(Running::is_live)
    }

    /// Forwards fatal session states to the error hook until [`Watcher::stop`].
    pub fn monitor_session(&self, events: mpsc::UnboundedReceiver<SessionState>) -> Result<()> {
        let mut running = self.lock_running();
        let Some(running) = running.as_mut().filter(|running| running.is_live()) else {
            return Err(Error::NotStarted);
        };
        let task = tokio::spawn(session_loop(
            Arc::clone(&self.shared),
            events,
            running.cancel.clone(),
        ));
        running.tasks.push(task);
        Ok(())
    }

    pub fn feature_active(&self, feature: &str, user_id: i64, groups: &[&str]) -> bool {
        self.shared
            .store
            .current()
            .feature_active(feature, user_id, groups)
    }

    pub fn raw_percentage(&self, feature: &str) -> Result<f64> {
        self.shared.store.current().raw_percentage(feature)
    }

    /// The currently installed snapshot.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.shared.store.current()
    }

    /// Version of the node as of the last fetch.
    pub fn node_version(&self) -> i32 {
        self.shared.version.load(Ordering::SeqCst)
    }

    /// Writes `rules` to the node, conditioned on the last fetched version.
    ///
    /// The local snapshot is left alone; the refresh task picks the change up
    /// through the watch like any other update.
    pub async fn write(&self, rules: &HashMap<String, String>) -> Result<NodeStat> {
        let data = serde_json::to_vec(rules)?;
        let version = self.node_version();
        self.shared
            .coordinator
            .set(&self.shared.path, &data, version)
            .await
            .map_err(|err| {
                error!(path = %self.shared.path, version, error = %err, "could not write rollout rules");
                Error::from(err)
            })
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn refresh_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let (data, stat, watch) = match shared.coordinator.get_and_watch(&shared.path).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(path = %shared.path, error = %err, "failed to get data/set watch");
                shared.hooks.report(&Error::from(err));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.backoff) => continue,
                }
            }
        };
        shared.version.store(stat.version, Ordering::SeqCst);

        let watch = match RuleSnapshot::from_json(&data) {
            Ok(snapshot) => {
                shared.install(snapshot, stat);
                watch
            }
            Err(err) => {
                error!(
                    path = %shared.path,
                    error = %err,
                    "couldn't decode rollout data, rewatching node and leaving rules unchanged"
                );
                shared.hooks.report(&Error::from(err));
                // re-arm so we hear about the fix
                drop(watch);
                match shared.coordinator.get_and_watch(&shared.path).await {
                    Ok((data, stat, watch)) => {
                        shared.version.store(stat.version, Ordering::SeqCst);
                        match RuleSnapshot::from_json(&data) {
                            Ok(snapshot) => shared.install(snapshot, stat),
                            Err(err) => {
                                error!(
                                    path = %shared.path,
                                    error = %err,
                                    "couldn't decode rollout data after rewatch, leaving rules unchanged"
                                );
                                shared.hooks.report(&Error::from(err));
                            }
                        }
                        watch
                    }
                    Err(source) => {
                        shared.hooks.fatal(Error::WatchLost {
                            path: shared.path.clone(),
                            source,
                        });
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            event = watch.fired() => {
                debug!(path = %shared.path, ?event, "watch triggered, rereading rollout node");
            }
        }
    }
    info!(path = %shared.path, "exiting rollout refresh loop");
}

async fn session_loop(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<SessionState>,
    cancel: CancellationToken,
) {
    loop {
        let state = tokio::select! {
            _ = cancel.cancelled() => break,
            state = events.recv() => match state {
                Some(state) => state,
                None => break,
            },
        };
        if state.is_fatal() {
            error!(path = %shared.path, ?state, "fatal coordination session event");
            shared.hooks.report(&Error::SessionLost(state));
        } else {
            debug!(path = %shared.path, ?state, "coordination session event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::coordinator::CoordinationError;
    use crate::memory::MemoryCoordinator;

    const PATH: &str = "/rollout-test";

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn start_fails_for_missing_path() {
        let zk = Arc::new(MemoryCoordinator::new());
        let watcher = Watcher::new(zk, PATH);
        let err = watcher.start().await.unwrap_err();
        assert!(matches!(err, Error::PathNotFound(ref p) if p == PATH));
        assert_eq!(err.to_string(), "rollout path (/rollout-test) does not exist");
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, b"{}").await.unwrap();
        let watcher = Watcher::new(zk, PATH);
        watcher.start().await.unwrap();
        assert!(matches!(watcher.start().await, Err(Error::AlreadyStarted)));
        watcher.stop().await;
        assert!(!watcher.is_running());
        // stopping twice is harmless
        watcher.stop().await;
    }

    #[tokio::test]
    async fn picks_up_changes() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, b"{}").await.unwrap();
        let watcher = Watcher::new(zk.clone(), PATH);
        watcher.start().await.unwrap();

        zk.set(PATH, br#"{"feature:hello": "0|1|"}"#, -1)
            .await
            .unwrap();
        eventually(|| watcher.feature_active("hello", 1, &["foo"])).await;
        assert!(!watcher.feature_active("hello", 2, &["foo"]));
        assert_eq!(watcher.node_version(), 1);

        watcher.stop().await;
    }

    #[tokio::test]
    async fn fetch_errors_are_retried_and_reported() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, br#"{"feature:a": "100||"}"#).await.unwrap();
        zk.fail_next_gets(3);

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let watcher = Watcher::builder(zk.clone(), PATH)
            .backoff(Duration::from_millis(10))
            .on_error(move |err| {
                assert!(matches!(err, Error::Coordination(CoordinationError::ConnectionLoss(_))));
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        watcher.start().await.unwrap();

        eventually(|| watcher.feature_active("a", 42, &[])).await;
        assert_eq!(errors.load(Ordering::SeqCst), 3);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn stop_interrupts_backoff() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, b"{}").await.unwrap();
        zk.fail_next_gets(usize::MAX);
        let watcher = Watcher::builder(zk, PATH)
            .backoff(Duration::from_secs(3600))
            .build();
        watcher.start().await.unwrap();
        sleep(Duration::from_millis(20)).await;
        timeout(Duration::from_secs(1), watcher.stop())
            .await
            .expect("stop should not wait out the backoff");
    }

    #[tokio::test]
    async fn bad_payload_keeps_previous_rules_and_rewatches() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, br#"{"feature:a": "100||"}"#).await.unwrap();
        let watcher = Watcher::new(zk.clone(), PATH);
        watcher.start().await.unwrap();
        eventually(|| watcher.feature_active("a", 1, &[])).await;

        zk.set(PATH, b"{not json", -1).await.unwrap();
        // the loop re-arms a watch after failing to decode
        timeout(Duration::from_secs(5), async {
            while zk.pending_watches(PATH).await == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(watcher.feature_active("a", 1, &[]));

        zk.set(PATH, br#"{"feature:b": "100||"}"#, -1)
            .await
            .unwrap();
        eventually(|| watcher.feature_active("b", 1, &[])).await;
        assert!(!watcher.feature_active("a", 1, &[]));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn lost_rewatch_is_fatal() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, b"[]").await.unwrap();
        // first fetch succeeds with an undecodable payload, the rewatch fails
        let fatal = Arc::new(Mutex::new(None));
        let seen = fatal.clone();
        let watcher = Watcher::builder(zk.clone(), PATH)
            .on_error({
                let zk = zk.clone();
                move |err| {
                    if matches!(err, Error::Json(_)) {
                        zk.fail_next_gets(1);
                    }
                }
            })
            .on_fatal(move |err| {
                *seen.lock().unwrap() = Some(err.to_string());
            })
            .build();
        watcher.start().await.unwrap();

        eventually(|| fatal.lock().unwrap().is_some()).await;
        let message = fatal.lock().unwrap().clone().unwrap();
        assert!(message.starts_with("could not re-establish watch on /rollout-test"));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn restart_after_lost_rewatch() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, b"[]").await.unwrap();
        let fatal = Arc::new(AtomicUsize::new(0));
        let seen = fatal.clone();
        let watcher = Watcher::builder(zk.clone(), PATH)
            .on_error({
                let zk = zk.clone();
                move |err| {
                    if matches!(err, Error::Json(_)) {
                        zk.fail_next_gets(1);
                    }
                }
            })
            .on_fatal(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        watcher.start().await.unwrap();

        eventually(|| fatal.load(Ordering::SeqCst) == 1).await;
        eventually(|| !watcher.is_running()).await;
        assert!(matches!(
            watcher.monitor_session(zk.session_events().await),
            Err(Error::NotStarted)
        ));

        zk.set(PATH, br#"{"feature:a": "100||"}"#, -1)
            .await
            .unwrap();
        watcher.start().await.unwrap();
        assert!(watcher.is_running());
        eventually(|| watcher.feature_active("a", 1, &[])).await;
        assert_eq!(fatal.load(Ordering::SeqCst), 1);
        watcher.stop().await;
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn start_propagates_exists_errors() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, b"{}").await.unwrap();
        zk.fail_next_exists(1);
        let watcher = Watcher::new(zk.clone(), PATH);

        let err = watcher.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Coordination(CoordinationError::ConnectionLoss(_))
        ));
        assert!(!watcher.is_running());
        assert_eq!(zk.pending_watches(PATH).await, 0);

        watcher.start().await.unwrap();
        assert!(watcher.is_running());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn bad_payload_after_rewatch_is_reported() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, br#"{"feature:a": "100||"}"#).await.unwrap();
        let decode_errors = Arc::new(AtomicUsize::new(0));
        let seen = decode_errors.clone();
        let watcher = Watcher::builder(zk.clone(), PATH)
            .on_error(move |err| {
                if matches!(err, Error::Json(_)) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build();
        watcher.start().await.unwrap();
        eventually(|| watcher.feature_active("a", 1, &[])).await;

        // the rewatch reads the same broken payload back
        zk.set(PATH, b"{not json", -1).await.unwrap();
        eventually(|| decode_errors.load(Ordering::SeqCst) == 2).await;
        assert!(watcher.feature_active("a", 1, &[]));
        assert!(watcher.is_running());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn fatal_session_states_are_reported() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, b"{}").await.unwrap();
        let lost = Arc::new(Mutex::new(Vec::new()));
        let seen = lost.clone();
        let watcher = Watcher::builder(zk.clone(), PATH)
            .on_error(move |err| {
                if let Error::SessionLost(state) = err {
                    seen.lock().unwrap().push(*state);
                }
            })
            .build();

        let events = zk.session_events().await;
        assert!(matches!(
            watcher.monitor_session(zk.session_events().await),
            Err(Error::NotStarted)
        ));
        watcher.start().await.unwrap();
        watcher.monitor_session(events).unwrap();

        zk.emit_session(SessionState::Connected).await;
        zk.emit_session(SessionState::Expired).await;
        eventually(|| !lost.lock().unwrap().is_empty()).await;
        assert_eq!(*lost.lock().unwrap(), vec![SessionState::Expired]);

        watcher.stop().await;
    }

    #[tokio::test]
    async fn write_uses_last_seen_version() {
        let zk = Arc::new(MemoryCoordinator::new());
        zk.create(PATH, b"{}").await.unwrap();
        let watcher = Watcher::new(zk.clone(), PATH);
        watcher.start().await.unwrap();

        let rules = HashMap::from([("feature:new".to_string(), "100||".to_string())]);
        let stat = watcher.write(&rules).await.unwrap();
        assert_eq!(stat.version, 1);
        eventually(|| watcher.feature_active("new", 5, &[])).await;
        eventually(|| watcher.node_version() == 1).await;

        // someone else writes while we are not watching
        watcher.stop().await;
        zk.set(PATH, b"{}", -1).await.unwrap();
        let stale = HashMap::from([("feature:old".to_string(), "0||".to_string())]);
        let err = watcher.write(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Coordination(CoordinationError::BadVersion {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }
}
