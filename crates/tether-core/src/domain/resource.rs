//! Resources, reservations and created-resource bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::{ReservationId, TaskId, WorkerName};

/// A named logical resource, `"kind:identifier"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Joins kind and identifier so equal identifiers of different kinds never
    /// block each other.
    pub fn new(kind: &str, id: &str) -> Self {
        Self(format!("{kind}:{id}"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sorted and de-duplicated.
    pub fn normalize(keys: impl IntoIterator<Item = ResourceKey>) -> Vec<ResourceKey> {
        keys.into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live claim on one resource by one worker, together with the tasks that
/// rely on it. Deleted exactly when `tasks` becomes empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource: ResourceKey,
    pub worker: WorkerName,
    pub tasks: BTreeSet<TaskId>,
}

/// An object a task was in the middle of building. Cancellation discards the
/// ones that were never finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResource {
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub finalized: bool,
}

impl CreatedResource {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            finalized: false,
        }
    }
}
