//! Worker records and liveness.
//!
//! Liveness is never stored. It is derived from the raw heartbeat and the two
//! flags each time someone asks, so concurrent readers cannot disagree with a
//! stale cached value.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique process name, `"{prefix}@{host}"`. Also the name of the process's
/// dedicated queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerName(String);

impl WorkerName {
    pub fn new(prefix: &str, host: &str) -> Self {
        Self(format!("{prefix}@{host}"))
    }

    pub fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dedicated queue this process consumes.
    pub fn queue(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('@'))
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Process class, derived from the name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Dispatcher,
    Worker,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Missing,
    Stopped,
}

/// Flag updates applied to a worker row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMark {
    /// Clean shutdown: sets both `gracefully_stopped` and `cleaned_up`.
    GracefullyStopped,
    /// Crash recovery finished for a missing worker.
    CleanedUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: WorkerName,
    pub last_heartbeat: DateTime<Utc>,
    pub gracefully_stopped: bool,
    pub cleaned_up: bool,
}

impl WorkerRecord {
    pub fn new(name: WorkerName, now: DateTime<Utc>) -> Self {
        Self {
            name,
            last_heartbeat: now,
            gracefully_stopped: false,
            cleaned_up: false,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.last_heartbeat >= now - ttl
    }

    pub fn liveness(&self, now: DateTime<Utc>, ttl: Duration) -> Liveness {
        if self.gracefully_stopped {
            Liveness::Stopped
        } else if self.is_fresh(now, ttl) {
            Liveness::Online
        } else {
            Liveness::Missing
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.liveness(now, ttl) == Liveness::Online
    }

    pub fn is_missing(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.liveness(now, ttl) == Liveness::Missing
    }

    /// Missing and not yet cleaned up after.
    pub fn is_dirty(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.is_missing(now, ttl) && !self.cleaned_up
    }

    pub fn apply(&mut self, mark: WorkerMark) {
        match mark {
            WorkerMark::GracefullyStopped => {
                self.gracefully_stopped = true;
                self.cleaned_up = true;
            }
            WorkerMark::CleanedUp => self.cleaned_up = true,
        }
    }
}
