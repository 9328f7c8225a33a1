//! JobContext - 実行中タスクの明示的なコンテキスト
//!
//! スレッドローカルの「現在のタスク」の代わりに、ハンドラへ引数として
//! 渡します。子タスクの投入、部分失敗の記録、作成中オブジェクトの登録は
//! すべてここを通します。

use std::sync::Arc;

use tracing::warn;

use super::submit::{Submission, Submitter, TaskHandle};
use super::tasks::TaskManager;
use crate::domain::{CreatedResource, TaskError, TaskId, WorkerName};
use crate::error::TetherError;
use crate::ports::{Store, StoreError};

#[derive(Clone)]
pub struct JobContext {
    task_id: TaskId,
    worker: WorkerName,
    tasks: TaskManager,
    store: Arc<dyn Store>,
    submitter: Submitter,
}

impl JobContext {
    pub fn new(
        task_id: TaskId,
        worker: WorkerName,
        tasks: TaskManager,
        store: Arc<dyn Store>,
        submitter: Submitter,
    ) -> Self {
        Self {
            task_id,
            worker,
            tasks,
            store,
            submitter,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn worker(&self) -> &WorkerName {
        &self.worker
    }

    /// Submits a child task of the current one.
    pub async fn submit(&self, submission: Submission) -> Result<TaskHandle, TetherError> {
        self.submitter
            .submit(submission.parent(self.task_id))
            .await
    }

    /// Records a partial failure without stopping the job.
    pub async fn non_fatal_error(&self, error: TaskError) -> Result<(), StoreError> {
        let transition = self.tasks.append_non_fatal_error(self.task_id, error).await?;
        if !transition.is_applied() {
            warn!(task_id = %self.task_id, ?transition, "non-fatal error dropped");
        }
        Ok(())
    }

    /// Registers an object this job is building. It is kept on completion and
    /// discarded if the task is canceled first.
    pub async fn created_resource(&self, resource: CreatedResource) -> Result<(), StoreError> {
        self.store
            .record_created_resource(self.task_id, resource)
            .await
    }
}
