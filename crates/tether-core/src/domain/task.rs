//! Task record: the durable state of one unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskError, TaskId, TaskState, WorkerName};

/// Result of asking a record to change.
///
/// `Ignored` is not an error: completion and cancellation race, and
/// the loser just observes the state the winner left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: TaskState },
    Ignored { current: TaskState },
    /// No such task in the store.
    Missing,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// Single source of truth for a task.
///
/// `version` is bumped by the store on every successful update and is what
/// compare-and-swap writes are checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub non_fatal_errors: Vec<TaskError>,
    pub error: Option<TaskError>,
    pub result: Option<serde_json::Value>,
    pub parent: Option<TaskId>,
    pub worker: Option<WorkerName>,
    pub tags: Vec<String>,
    pub version: u64,
}

impl TaskRecord {
    pub fn new(id: TaskId, parent: Option<TaskId>, tags: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: TaskState::Waiting,
            created_at: now,
            started_at: None,
            finished_at: None,
            non_fatal_errors: Vec::new(),
            error: None,
            result: None,
            parent,
            worker: None,
            tags,
            version: 0,
        }
    }

    fn move_to(&mut self, next: TaskState) -> Transition {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Transition::Ignored { current: from };
        }
        self.state = next;
        Transition::Applied { from }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Transition {
        let t = self.move_to(TaskState::Running);
        if t.is_applied() {
            self.started_at = Some(now);
        }
        t
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> Transition {
        let t = self.move_to(TaskState::Completed);
        if t.is_applied() {
            self.finished_at = Some(now);
            self.result = Some(result);
        }
        t
    }

    pub fn mark_failed(&mut self, error: TaskError, now: DateTime<Utc>) -> Transition {
        let t = self.move_to(TaskState::Failed);
        if t.is_applied() {
            self.finished_at = Some(now);
            self.error = Some(error);
        }
        t
    }

    pub fn mark_canceled(&mut self, now: DateTime<Utc>) -> Transition {
        let t = self.move_to(TaskState::Canceled);
        if t.is_applied() {
            self.finished_at = Some(now);
        }
        t
    }

    pub fn mark_skipped(&mut self, now: DateTime<Utc>) -> Transition {
        let t = self.move_to(TaskState::Skipped);
        if t.is_applied() {
            self.finished_at = Some(now);
        }
        t
    }

    /// Set once; never cleared or replaced while the task is alive.
    pub fn assign_worker(&mut self, worker: &WorkerName) -> Transition {
        let current = self.state;
        if current.is_terminal() {
            return Transition::Ignored { current };
        }
        match &self.worker {
            Some(existing) if existing != worker => Transition::Ignored { current },
            _ => {
                self.worker = Some(worker.clone());
                Transition::Applied { from: current }
            }
        }
    }

    pub fn push_non_fatal(&mut self, error: TaskError) -> Transition {
        let current = self.state;
        if current.is_terminal() {
            return Transition::Ignored { current };
        }
        self.non_fatal_errors.push(error);
        Transition::Applied { from: current }
    }

    pub fn view(&self, spawned_tasks: Vec<TaskId>) -> TaskView {
        TaskView {
            id: self.id,
            state: self.state,
            error: match self.state {
                TaskState::Failed => self.error.clone(),
                _ => None,
            },
            non_fatal_errors: self.non_fatal_errors.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            result: self.result.clone(),
            parent: self.parent,
            worker: self.worker.clone(),
            tags: self.tags.clone(),
            spawned_tasks,
        }
    }
}

/// What a caller sees when polling a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub state: TaskState,
    pub error: Option<TaskError>,
    pub non_fatal_errors: Vec<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub parent: Option<TaskId>,
    pub worker: Option<WorkerName>,
    pub tags: Vec<String>,
    pub spawned_tasks: Vec<TaskId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        TaskRecord::new(TaskId::from_ulid(Ulid::new()), None, vec![], Utc::now())
    }

    #[test]
    fn happy_path_sets_timestamps() {
        let mut t = record();
        assert!(t.mark_running(Utc::now()).is_applied());
        assert!(t.started_at.is_some());
        assert!(t.mark_completed(serde_json::json!(1), Utc::now()).is_applied());
        assert_eq!(t.state, TaskState::Completed);
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn terminal_state_is_never_left() {
        let mut t = record();
        t.mark_running(Utc::now());
        t.mark_canceled(Utc::now());

        let late = t.mark_completed(serde_json::Value::Null, Utc::now());
        assert_eq!(late, Transition::Ignored { current: TaskState::Canceled });
        assert_eq!(t.state, TaskState::Canceled);
        assert!(t.result.is_none());
    }

    #[test]
    fn completion_requires_running() {
        let mut t = record();
        let r = t.mark_completed(serde_json::Value::Null, Utc::now());
        assert_eq!(r, Transition::Ignored { current: TaskState::Waiting });
    }

    #[test]
    fn worker_is_set_at_most_once() {
        let mut t = record();
        let a = WorkerName::new("worker", "a");
        let b = WorkerName::new("worker", "b");
        assert!(t.assign_worker(&a).is_applied());
        assert!(t.assign_worker(&a).is_applied());
        assert!(!t.assign_worker(&b).is_applied());
        assert_eq!(t.worker, Some(a));
    }

    #[test]
    fn canceled_view_carries_no_error() {
        let mut t = record();
        t.mark_running(Utc::now());
        t.error = Some(TaskError::new("stale", "left over"));
        t.mark_canceled(Utc::now());
        assert!(t.view(vec![]).error.is_none());
    }

    #[test]
    fn failed_view_carries_error() {
        let mut t = record();
        t.mark_failed(TaskError::new("boom", "exploded"), Utc::now());
        let view = t.view(vec![]);
        assert_eq!(view.state, TaskState::Failed);
        assert_eq!(view.error.unwrap().code, "boom");
    }
}
