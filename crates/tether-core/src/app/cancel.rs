//! CancellationService - タスクのキャンセル
//!
//! kill シグナルを送り、CANCELED にし、作りかけのオブジェクトを破棄します。
//! 自然な完了と並行に呼ばれても安全で、先に着いた遷移が勝ちます。

use std::sync::Arc;

use tracing::{info, warn};

use super::tasks::TaskManager;
use crate::domain::{TaskId, TaskState, Transition};
use crate::error::TetherError;
use crate::ports::{Janitor, MessageQueue, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// The task had already ended; nothing changed.
    AlreadyFinished(TaskState),
}

#[derive(Clone)]
pub struct CancellationService {
    tasks: TaskManager,
    store: Arc<dyn Store>,
    queue: Arc<dyn MessageQueue>,
    janitor: Arc<dyn Janitor>,
}

impl CancellationService {
    pub fn new(
        tasks: TaskManager,
        store: Arc<dyn Store>,
        queue: Arc<dyn MessageQueue>,
        janitor: Arc<dyn Janitor>,
    ) -> Self {
        Self {
            tasks,
            store,
            queue,
            janitor,
        }
    }

    /// Drops the kill flag of a task nobody will execute again.
    pub async fn forget(&self, id: TaskId) {
        if let Err(e) = self.queue.forget_kill(id).await {
            warn!(task_id = %id, error = %e, "cannot clear kill flag");
        }
    }

    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, TetherError> {
        let Some(task) = self.tasks.get(id).await? else {
            return Err(TetherError::TaskNotFound(id));
        };
        if task.state.is_terminal() {
            info!(task_id = %id, state = %task.state, "task already complete");
            return Ok(CancelOutcome::AlreadyFinished(task.state));
        }

        // kill は届かなくても続行する（状態遷移が正本）
        if let Err(e) = self.queue.kill(id).await {
            warn!(task_id = %id, error = %e, "cannot signal job");
        }

        let from = match self.tasks.set_canceled(id).await? {
            Transition::Applied { from } => from,
            Transition::Ignored { current } => {
                info!(task_id = %id, state = %current, "task completed before it could be canceled");
                return Ok(CancelOutcome::AlreadyFinished(current));
            }
            Transition::Missing => return Err(TetherError::TaskNotFound(id)),
        };
        info!(task_id = %id, from = %from, "task canceled");

        self.discard_created_resources(id).await?;

        // RUNNING だったならワーカーの Release が解放する
        if from == TaskState::Waiting {
            self.tasks.release_reservations(id).await?;
        }
        Ok(CancelOutcome::Canceled)
    }

    async fn discard_created_resources(&self, id: TaskId) -> Result<(), TetherError> {
        for resource in self.store.take_unfinalized_resources(id).await? {
            if let Err(e) = self.janitor.discard(id, &resource).await {
                warn!(task_id = %id, error = %e, "cannot discard created resource");
            }
        }
        Ok(())
    }
}
