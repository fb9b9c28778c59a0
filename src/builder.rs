use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::store::RuleSnapshot;
use crate::watcher::{Hooks, Watcher};

/// Wait between a failed fetch and the next attempt.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

pub struct WatcherBuilder {
    coordinator: Arc<dyn Coordinator>,
    path: String,
    backoff: Duration,
    hooks: Hooks,
}

pub fn create_builder(coordinator: Arc<dyn Coordinator>, path: &str) -> WatcherBuilder {
    WatcherBuilder {
        coordinator,
        path: path.to_string(),
        backoff: DEFAULT_BACKOFF,
        hooks: Hooks::default(),
    }
}

impl WatcherBuilder {
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Register a callback for recoverable failures: fetch errors, undecodable
    /// payloads, fatal session states. Runs on the refresh task.
    pub fn on_error(mut self, cb: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.hooks.on_error = Some(Arc::new(cb));
        self
    }

    /// Register a callback for an unrecoverable watch loss. The refresh loop
    /// has already exited when it runs.
    ///
    /// Without one, the watcher exits the process.
    pub fn on_fatal(mut self, cb: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.hooks.on_fatal = Some(Arc::new(cb));
        self
    }

    /// Register a callback that fires after each installed snapshot.
    pub fn on_update(mut self, cb: impl Fn(&RuleSnapshot) + Send + Sync + 'static) -> Self {
        self.hooks.on_update = Some(Arc::new(cb));
        self
    }

    pub fn build(self) -> Watcher {
        Watcher::from_parts(self.coordinator, self.path, self.backoff, self.hooks)
    }
}
