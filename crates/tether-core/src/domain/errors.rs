//! Structured errors recorded on tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error stored on a task (fatal error or one entry of the
/// non-fatal list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl TaskError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.description)
    }
}

/// Error returned by a job handler. Becomes the task's fatal error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    pub code: Option<String>,
    pub message: String,
    pub trace: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl From<JobError> for TaskError {
    fn from(err: JobError) -> Self {
        TaskError {
            code: err.code.unwrap_or_else(|| "job_error".to_string()),
            description: err.message,
            traceback: err.trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_converts_with_default_code() {
        let err: TaskError = JobError::new("disk full").with_trace("at sync()").into();
        assert_eq!(err.code, "job_error");
        assert_eq!(err.description, "disk full");
        assert_eq!(err.traceback.as_deref(), Some("at sync()"));
    }

    #[test]
    fn traceback_is_omitted_when_absent() {
        let v = serde_json::to_value(TaskError::new("x", "y")).unwrap();
        assert!(v.get("traceback").is_none());
    }
}
