//! Leader-election lease rows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A named lease ("dispatcher", ...) held by exactly one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub owner: String,
    pub timestamp: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            timestamp: now,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.timestamp < now - ttl
    }
}
