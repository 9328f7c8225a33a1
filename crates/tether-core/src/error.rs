use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::{ResourceKey, TaskId, WorkerName};
use crate::ports::{QueueError, StoreError};
use crate::typed::RegistryError;

/// More than one worker holds a resource from the same request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    #[error("resources {resources:?} are held by several workers: {workers:?}")]
    AmbiguousHolders {
        resources: Vec<ResourceKey>,
        workers: Vec<WorkerName>,
    },
}

#[derive(Debug, Error)]
pub enum TetherError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("cannot encode job arguments: {0}")]
    Encode(#[from] serde_json::Error),
}
