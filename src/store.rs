use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use sha1::{Digest, Sha1};
use tracing::warn;

use crate::error::{Error, Result};
use crate::rule::Rule;

/// Prefix every stored feature key carries.
pub const FEATURE_PREFIX: &str = "feature:";

pub fn feature_key(feature: &str) -> String {
    format!("{}{}", FEATURE_PREFIX, feature)
}

/// One complete, immutable set of rules as decoded from the node payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSnapshot {
    rules: HashMap<String, String>,
    digest: String,
}

impl RuleSnapshot {
    /// Decodes a flat JSON object of key -> rule string. Individual rule values
    /// are not validated here; a bad rule only disables its own feature.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let rules: HashMap<String, String> = serde_json::from_slice(data)?;
        let mut hasher = Sha1::new();
        hasher.update(data);
        Ok(Self {
            rules,
            digest: format!("{:x}", hasher.finalize()),
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// SHA-1 of the payload this snapshot was decoded from. Empty for the
    /// initial, never-loaded snapshot.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Raw rule string by full key (including the `feature:` prefix).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.rules.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn feature_active(&self, feature: &str, user_id: i64, groups: &[&str]) -> bool {
        let key = feature_key(feature);
        let Some(value) = self.get(&key) else {
            return false;
        };
        match Rule::parse(value) {
            Some(rule) => rule.is_active(&key, user_id, groups),
            None => {
                warn!(key = %key, value, "invalid rollout rule");
                false
            }
        }
    }

    pub fn raw_percentage(&self, feature: &str) -> Result<f64> {
        let key = feature_key(feature);
        let value = self.get(&key).ok_or_else(|| Error::NotFound(key.clone()))?;
        let rule = Rule::parse(value).ok_or_else(|| Error::Malformed {
            key: key.clone(),
            value: value.to_string(),
        })?;
        rule.percentage()
    }
}

/// Holds the installed snapshot. Readers clone the `Arc` under a read lock and
/// evaluate outside it; the refresh loop swaps the pointer under the write lock.
#[derive(Debug, Default)]
pub struct RuleStore {
    current: RwLock<Arc<RuleSnapshot>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Arc<RuleSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Installs `snapshot` wholesale and returns the previous one.
    pub fn replace(&self, snapshot: RuleSnapshot) -> Arc<RuleSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, snapshot)
    }
}
