//! Feature rollout client.
//!
//! Rollout rules live as a single JSON object in a coordination-service node:
//!
//! ```json
//! {"feature:new_checkout": "25|1001,1002|beta,staff"}
//! ```
//!
//! Each value is `<percentage>|<user ids>|<groups>`. A [`Watcher`] keeps a local
//! copy of that object fresh through one-shot watches and answers
//! [`Watcher::feature_active`] / [`Watcher::raw_percentage`] without touching
//! the network.
//!
//! # Examples
//! ```
//! use std::sync::Arc;
//!
//! use rollout::{MemoryCoordinator, Watcher};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> rollout::Result<()> {
//! let zk = Arc::new(MemoryCoordinator::new());
//! zk.create("/rollout", br#"{"feature:hello": "0||all"}"#).await?;
//!
//! let watcher = Watcher::new(zk, "/rollout");
//! watcher.start().await?;
//! // ... once the first snapshot is installed:
//! let _active = watcher.feature_active("hello", 42, &["staff"]);
//! watcher.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod rule;
pub mod store;
pub mod watcher;

pub use builder::WatcherBuilder;
pub use coordinator::{
    CoordinationError, Coordinator, NodeStat, SessionState, WatchEvent, WatchSignal, ANY_VERSION,
};
pub use error::{Error, Result};
pub use memory::MemoryCoordinator;
pub use rule::Rule;
pub use store::{feature_key, RuleSnapshot, RuleStore, FEATURE_PREFIX};
pub use watcher::Watcher;
