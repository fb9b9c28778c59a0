use tracing::warn;

use crate::error::{Error, Result};

/// Group name that matches every caller.
pub const ALL_GROUPS: &str = "all";

/// A borrowed view over `<percentage>|<ids>|<groups>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule<'a> {
    percentage: &'a str,
    ids: &'a str,
    groups: &'a str,
}

impl<'a> Rule<'a> {
    /// Splits a raw value on `|`. Anything other than exactly three segments
    /// is rejected.
    pub fn parse(value: &'a str) -> Option<Rule<'a>> {
        let mut parts = value.split('|');
        let rule = Rule {
            percentage: parts.next()?,
            ids: parts.next()?,
            groups: parts.next()?,
        };
        match parts.next() {
            Some(_) => None,
            None => Some(rule),
        }
    }

    pub fn percentage(&self) -> Result<f64> {
        self.percentage
            .parse::<f64>()
            .map_err(|_| Error::InvalidPercentage(self.percentage.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &'a str> {
        self.ids.split(',')
    }

    pub fn groups(&self) -> impl Iterator<Item = &'a str> {
        self.groups.split(',')
    }

    pub fn has_id(&self, user_id: i64) -> bool {
        let id = user_id.to_string();
        self.ids().any(|candidate| candidate == id)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups().any(|candidate| candidate == group)
    }

    /// Activation decision for one caller. `key` only feeds the log line.
    ///
    /// Precedence: `all` wildcard, then a 100% rollout, then the explicit id
    /// list, then the percentage bucket, then the caller's groups.
    pub fn is_active(&self, key: &str, user_id: i64, groups: &[&str]) -> bool {
        if self.has_group(ALL_GROUPS) {
            return true;
        }

        let percentage = match self.percentage() {
            Ok(p) => p,
            Err(_) => {
                warn!(key, percentage = self.percentage, "rollout invalid percentage");
                return false;
            }
        };
        if percentage as i64 == 100 {
            return true;
        }

        if self.has_id(user_id) {
            return true;
        }

        if in_bucket(user_id, percentage) {
            return true;
        }

        groups.iter().any(|group| self.has_group(group))
    }
}

/// `user_id mod 100 < floor(percentage)`. Raising the percentage only ever adds ids.
pub fn in_bucket(user_id: i64, percentage: f64) -> bool {
    user_id % 100 < percentage.floor() as i64
}
