//! Submitter - 非同期ジョブの受付（enqueue with reservation）
//!
//! タスク行を WAITING で作ってから受付キューに載せます。呼び出し側が
//! ハンドルを受け取った時点で、そのタスクは必ずポーリング可能です。

use std::sync::Arc;

use tracing::{debug, error};

use super::tasks::TaskManager;
use crate::domain::{DispatchRequest, JobArgs, JobName, Message, ResourceKey, TaskError, TaskId};
use crate::error::TetherError;
use crate::ports::MessageQueue;
use crate::typed::Job;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub tags: Vec<String>,
}

/// What to run, on which resources.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: JobName,
    pub resources: Vec<ResourceKey>,
    pub args: JobArgs,
    pub parent: Option<TaskId>,
    pub options: SubmitOptions,
}

impl Submission {
    pub fn new(job: impl Into<JobName>) -> Self {
        Self {
            job: job.into(),
            resources: Vec::new(),
            args: JobArgs::default(),
            parent: None,
            options: SubmitOptions::default(),
        }
    }

    /// Builds a submission whose keyword arguments are the serialized job.
    pub fn for_job<J: Job>(job: &J) -> Result<Self, TetherError> {
        let args = match serde_json::to_value(job)? {
            serde_json::Value::Object(kwargs) => JobArgs {
                args: Vec::new(),
                kwargs,
            },
            other => JobArgs::new().arg(other),
        };
        Ok(Self::new(J::NAME).args(args))
    }

    pub fn resource(mut self, key: ResourceKey) -> Self {
        self.resources.push(key);
        self
    }

    pub fn resources(mut self, keys: impl IntoIterator<Item = ResourceKey>) -> Self {
        self.resources.extend(keys);
        self
    }

    pub fn args(mut self, args: JobArgs) -> Self {
        self.args = args;
        self
    }

    pub fn parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.options.tags.push(tag.into());
        self
    }
}

/// Returned to the caller as soon as the task row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub id: TaskId,
}

#[derive(Clone)]
pub struct Submitter {
    tasks: TaskManager,
    queue: Arc<dyn MessageQueue>,
    intake: String,
}

impl Submitter {
    pub fn new(tasks: TaskManager, queue: Arc<dyn MessageQueue>, intake: impl Into<String>) -> Self {
        Self {
            tasks,
            queue,
            intake: intake.into(),
        }
    }

    pub async fn submit(&self, submission: Submission) -> Result<TaskHandle, TetherError> {
        let Submission {
            job,
            resources,
            args,
            parent,
            options,
        } = submission;

        let task = self.tasks.create(parent, options.tags).await?;
        let request = DispatchRequest {
            task_id: task.id,
            job: job.clone(),
            resources: ResourceKey::normalize(resources),
            args,
        };

        if let Err(e) = self.queue.publish(&self.intake, Message::Dispatch(request)).await {
            error!(task_id = %task.id, job = %job, error = %e, "cannot enqueue task");
            // 誰も拾わないタスクを WAITING のまま残さない
            let reason = TaskError::new("enqueue_failed", e.to_string());
            if let Err(store_err) = self.tasks.set_failed(task.id, reason).await {
                error!(task_id = %task.id, error = %store_err, "cannot mark unqueued task failed");
            }
            return Err(e.into());
        }

        debug!(task_id = %task.id, job = %job, "task submitted");
        Ok(TaskHandle { id: task.id })
    }

    pub async fn submit_job<J: Job>(
        &self,
        job: &J,
        resources: impl IntoIterator<Item = ResourceKey>,
    ) -> Result<TaskHandle, TetherError> {
        self.submit(Submission::for_job(job)?.resources(resources))
            .await
    }
}
