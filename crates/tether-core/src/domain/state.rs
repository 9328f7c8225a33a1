//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task.
///
/// Transitions:
/// - Waiting -> Running -> {Completed, Failed, Canceled}
/// - Waiting -> Skipped (a prerequisite was absent)
/// - Waiting -> Canceled (canceled before dispatch)
/// - Waiting -> Failed (could not be handed to a worker at all)
///
/// Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Running,
    Completed,
    Failed,
    Canceled,
    Skipped,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Waiting,
        TaskState::Running,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Canceled,
        TaskState::Skipped,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Skipped
        )
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Waiting, Running)
                | (Waiting, Skipped)
                | (Waiting, Canceled)
                | (Waiting, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
            TaskState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Waiting, TaskState::Running, true)]
    #[case(TaskState::Waiting, TaskState::Skipped, true)]
    #[case(TaskState::Waiting, TaskState::Canceled, true)]
    #[case(TaskState::Waiting, TaskState::Completed, false)]
    #[case(TaskState::Running, TaskState::Completed, true)]
    #[case(TaskState::Running, TaskState::Failed, true)]
    #[case(TaskState::Running, TaskState::Canceled, true)]
    #[case(TaskState::Running, TaskState::Waiting, false)]
    #[case(TaskState::Running, TaskState::Skipped, false)]
    fn transitions(#[case] from: TaskState, #[case] to: TaskState, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn terminal_states_are_dead_ends() {
        for from in TaskState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn serializes_lowercase() {
        let s = serde_json::to_string(&TaskState::Canceled).unwrap();
        assert_eq!(s, "\"canceled\"");
    }
}
