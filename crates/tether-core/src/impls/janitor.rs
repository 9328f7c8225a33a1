//! Janitor 実装

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{CreatedResource, TaskId};
use crate::ports::{Janitor, JanitorError};

/// Forgets discarded resources. Used when nothing outside the store needs
/// cleaning up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJanitor;

#[async_trait]
impl Janitor for NoopJanitor {
    async fn discard(&self, task: TaskId, resource: &CreatedResource) -> Result<(), JanitorError> {
        debug!(task_id = %task, kind = %resource.kind, id = %resource.id, "discarding created resource");
        Ok(())
    }
}
