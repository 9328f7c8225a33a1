//! Job names, arguments and the messages carried by the queue.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ResourceKey, TaskId};

/// Lookup key into the handler table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobName(String);

impl JobName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Positional and keyword arguments for a job. Opaque to the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl JobArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: serde_json::Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }
}

/// One submitted task as it travels through the intake queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: TaskId,
    pub job: JobName,
    pub resources: Vec<ResourceKey>,
    pub args: JobArgs,
}

/// The real job, published to the dedicated queue of the assigned worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub task_id: TaskId,
    pub job: JobName,
    pub args: JobArgs,
}

impl From<DispatchRequest> for JobEnvelope {
    fn from(req: DispatchRequest) -> Self {
        Self {
            task_id: req.task_id,
            job: req.job,
            args: req.args,
        }
    }
}

/// Everything the dispatcher ever puts on a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Intake queue: a task waiting for a worker and its resources.
    Dispatch(DispatchRequest),
    /// Worker queue: run the job.
    Run(JobEnvelope),
    /// Worker queue: release the task's reservations. Always follows `Run`.
    Release { task_id: TaskId },
}

impl Message {
    pub fn task_id(&self) -> TaskId {
        match self {
            Message::Dispatch(req) => req.task_id,
            Message::Run(env) => env.task_id,
            Message::Release { task_id } => *task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn message_is_internally_tagged() {
        let task_id = TaskId::from_ulid(Ulid::new());
        let v = serde_json::to_value(Message::Release { task_id }).unwrap();
        assert_eq!(v["type"], "release");
        assert_eq!(Message::Release { task_id }.task_id(), task_id);
    }

    #[test]
    fn envelope_keeps_args_of_request() {
        let req = DispatchRequest {
            task_id: TaskId::from_ulid(Ulid::new()),
            job: JobName::new("sync"),
            resources: vec![ResourceKey::new("repo", "A")],
            args: JobArgs::new().kwarg("mirror", serde_json::json!(true)),
        };
        let env = JobEnvelope::from(req.clone());
        assert_eq!(env.task_id, req.task_id);
        assert_eq!(env.args.kwargs["mirror"], serde_json::json!(true));
    }
}
