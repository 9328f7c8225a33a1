//! Janitor port - キャンセル時の後片付け
//!
//! タスクが作りかけのまま残したオブジェクト（created resources）を
//! 破棄する外部コラボレータです。

use async_trait::async_trait;

use crate::domain::{CreatedResource, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to discard {kind}:{id}: {reason}")]
pub struct JanitorError {
    pub kind: String,
    pub id: String,
    pub reason: String,
}

#[async_trait]
pub trait Janitor: Send + Sync {
    /// Deletes a half-built object left behind by a canceled task.
    async fn discard(&self, task: TaskId, resource: &CreatedResource) -> Result<(), JanitorError>;
}
