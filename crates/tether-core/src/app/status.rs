//! Status - クラスタのスナップショット
//!
//! タスクの状態別件数、役割ごとの online / missing プロセス、生きている予約、
//! 現在のリーダーをまとめて返します。

use serde::Serialize;

use super::workers::WorkerRegistry;
use crate::domain::{ProcessRole, Reservation, TaskState, WorkerName};
use crate::ports::{Store, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub waiting: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub skipped: usize,
}

impl TaskCounts {
    fn add(&mut self, state: TaskState) {
        let slot = match state {
            TaskState::Waiting => &mut self.waiting,
            TaskState::Running => &mut self.running,
            TaskState::Completed => &mut self.completed,
            TaskState::Failed => &mut self.failed,
            TaskState::Canceled => &mut self.canceled,
            TaskState::Skipped => &mut self.skipped,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.waiting + self.running + self.completed + self.failed + self.canceled + self.skipped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub tasks: TaskCounts,
    pub online_workers: Vec<WorkerName>,
    pub online_dispatchers: Vec<WorkerName>,
    pub missing: Vec<WorkerName>,
    pub reservations: Vec<Reservation>,
    pub leader: Option<String>,
}

pub async fn snapshot(
    store: &dyn Store,
    workers: &WorkerRegistry,
    lease: &str,
) -> Result<ClusterStatus, StoreError> {
    let mut tasks = TaskCounts::default();
    for task in store.list_tasks().await? {
        tasks.add(task.state);
    }
    Ok(ClusterStatus {
        tasks,
        online_workers: workers.online_with_role(ProcessRole::Worker).await?,
        online_dispatchers: workers.online_with_role(ProcessRole::Dispatcher).await?,
        missing: workers
            .missing_workers()
            .await?
            .into_iter()
            .map(|w| w.name)
            .collect(),
        reservations: store.list_reservations().await?,
        leader: store.get_lock(lease).await?.map(|l| l.owner),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_every_state() {
        let mut counts = TaskCounts::default();
        for state in TaskState::ALL {
            counts.add(state);
        }
        counts.add(TaskState::Completed);
        assert_eq!(counts.total(), 7);
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.skipped, 1);
    }
}
