use thiserror::Error;

use crate::coordinator::{CoordinationError, SessionState};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The watched node is missing. Configuration problem, never retried.
    #[error("rollout path ({0}) does not exist")]
    PathNotFound(String),

    #[error("feature not found: {0}")]
    NotFound(String),

    /// Rule value is not `<percentage>|<ids>|<groups>`.
    #[error("invalid value for {key}: {value}")]
    Malformed { key: String, value: String },

    #[error("rollout invalid percentage: {0}")]
    InvalidPercentage(String),

    /// Payload is not a flat JSON object of strings.
    #[error("rollout data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// The watch could not be re-established after a decode failure.
    #[error("could not re-establish watch on {path}: {source}")]
    WatchLost {
        path: String,
        #[source]
        source: CoordinationError,
    },

    #[error("fatal coordination session state: {0:?}")]
    SessionLost(SessionState),

    #[error("rollout watcher already started")]
    AlreadyStarted,

    #[error("rollout watcher is not running")]
    NotStarted,
}

impl Error {
    /// True for both ways a stored rule can be unusable.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Malformed { .. } | Error::InvalidPercentage(_))
    }
}
