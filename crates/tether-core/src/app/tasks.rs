//! TaskManager - タスクレコードの状態遷移
//!
//! 遷移はすべて「読む → レコード上で遷移 → version 付きで書く」を
//! compare-and-swap が通るまで繰り返します。終端状態からの遷移は
//! エラーではなく警告付きの no-op です（完了とキャンセルは競合しうる）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{ResourceKey, TaskError, TaskId, TaskRecord, TaskView, Transition, WorkerName};
use crate::ports::{Clock, IdGenerator, Store, StoreError};

#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, clock, ids }
    }

    /// Creates a WAITING task. The row is durable when this returns.
    pub async fn create(
        &self,
        parent: Option<TaskId>,
        tags: Vec<String>,
    ) -> Result<TaskRecord, StoreError> {
        let task = TaskRecord::new(self.ids.generate_task_id(), parent, tags, self.clock.now());
        self.store.insert_task(task.clone()).await?;
        debug!(task_id = %task.id, parent = ?task.parent, "task created");
        Ok(task)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.store.get_task(id).await
    }

    pub async fn view(&self, id: TaskId) -> Result<Option<TaskView>, StoreError> {
        let Some(task) = self.store.get_task(id).await? else {
            return Ok(None);
        };
        let spawned = self.store.child_tasks(id).await?;
        Ok(Some(task.view(spawned)))
    }

    pub async fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.store.list_tasks().await
    }

    pub async fn assigned_to(&self, worker: &WorkerName) -> Result<Vec<TaskRecord>, StoreError> {
        self.store.tasks_assigned_to(worker).await
    }

    pub async fn set_running(&self, id: TaskId) -> Result<Transition, StoreError> {
        self.modify(id, "set_running", |t, now| t.mark_running(now))
            .await
    }

    pub async fn set_completed(&self, id: TaskId, result: Value) -> Result<Transition, StoreError> {
        self.modify(id, "set_completed", move |t, now| {
            t.mark_completed(result.clone(), now)
        })
        .await
    }

    pub async fn set_failed(&self, id: TaskId, error: TaskError) -> Result<Transition, StoreError> {
        self.modify(id, "set_failed", move |t, now| t.mark_failed(error.clone(), now))
            .await
    }

    pub async fn set_canceled(&self, id: TaskId) -> Result<Transition, StoreError> {
        self.modify(id, "set_canceled", |t, now| t.mark_canceled(now))
            .await
    }

    /// WAITING → SKIPPED, for work whose prerequisite is gone.
    pub async fn set_skipped(&self, id: TaskId) -> Result<Transition, StoreError> {
        self.modify(id, "set_skipped", |t, now| t.mark_skipped(now))
            .await
    }

    pub async fn assign_worker(
        &self,
        id: TaskId,
        worker: &WorkerName,
    ) -> Result<Transition, StoreError> {
        self.modify(id, "assign_worker", |t, _| t.assign_worker(worker))
            .await
    }

    pub async fn append_non_fatal_error(
        &self,
        id: TaskId,
        error: TaskError,
    ) -> Result<Transition, StoreError> {
        self.modify(id, "append_non_fatal_error", move |t, _| {
            t.push_non_fatal(error.clone())
        })
        .await
    }

    /// Drops this task's links to its reservations; reservations left with no
    /// task are deleted in the same step.
    pub async fn release_reservations(&self, id: TaskId) -> Result<Vec<ResourceKey>, StoreError> {
        let freed = self.store.release_task_reservations(id).await?;
        if !freed.is_empty() {
            debug!(task_id = %id, freed = ?freed, "reservations released");
        }
        Ok(freed)
    }

    /// Hard delete. The store refuses while the task still holds reservations.
    pub async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.store.delete_task(id).await
    }

    async fn modify<F>(&self, id: TaskId, op: &'static str, f: F) -> Result<Transition, StoreError>
    where
        F: Fn(&mut TaskRecord, DateTime<Utc>) -> Transition + Send + Sync,
    {
        loop {
            let Some(mut task) = self.store.get_task(id).await? else {
                warn!(task_id = %id, op, "task not found");
                return Ok(Transition::Missing);
            };
            let transition = f(&mut task, self.clock.now());
            match transition {
                Transition::Applied { .. } => match self.store.update_task(&task).await {
                    Ok(_) => return Ok(transition),
                    // 他の書き込みに負けた: 読み直して再判定
                    Err(StoreError::Conflict(_)) => continue,
                    Err(e) => return Err(e),
                },
                Transition::Ignored { current } => {
                    warn!(task_id = %id, op, state = %current, "ignoring transition");
                    return Ok(transition);
                }
                Transition::Missing => return Ok(transition),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskState;
    use crate::impls::InMemoryStore;
    use crate::ports::{SystemClock, UlidGenerator};
    use serde_json::json;

    fn manager() -> (TaskManager, Arc<InMemoryStore>) {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
        let store = Arc::new(InMemoryStore::new(ids.clone()));
        (
            TaskManager::new(store.clone(), Arc::new(SystemClock), ids),
            store,
        )
    }

    #[tokio::test]
    async fn created_task_is_visible_immediately() {
        let (tasks, _) = manager();
        let task = tasks.create(None, vec!["sync".into()]).await.unwrap();

        let view = tasks.view(task.id).await.unwrap().unwrap();
        assert_eq!(view.state, TaskState::Waiting);
        assert_eq!(view.tags, vec!["sync".to_string()]);
        assert!(view.started_at.is_none());
    }

    #[tokio::test]
    async fn completion_after_cancel_is_a_no_op() {
        let (tasks, _) = manager();
        let id = tasks.create(None, vec![]).await.unwrap().id;
        tasks.set_running(id).await.unwrap();
        assert!(tasks.set_canceled(id).await.unwrap().is_applied());

        let late = tasks.set_completed(id, json!("done")).await.unwrap();
        assert_eq!(
            late,
            Transition::Ignored {
                current: TaskState::Canceled
            }
        );
        let view = tasks.view(id).await.unwrap().unwrap();
        assert_eq!(view.state, TaskState::Canceled);
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn set_running_twice_warns_and_keeps_state() {
        let (tasks, _) = manager();
        let id = tasks.create(None, vec![]).await.unwrap().id;
        assert!(tasks.set_running(id).await.unwrap().is_applied());
        assert!(!tasks.set_running(id).await.unwrap().is_applied());
        assert_eq!(tasks.get(id).await.unwrap().unwrap().state, TaskState::Running);
    }

    #[tokio::test]
    async fn unknown_task_is_missing_not_an_error() {
        let (tasks, _) = manager();
        let ghost = TaskId::from_ulid(ulid::Ulid::new());
        assert_eq!(tasks.set_running(ghost).await.unwrap(), Transition::Missing);
    }

    #[tokio::test]
    async fn non_fatal_errors_accumulate_without_state_change() {
        let (tasks, _) = manager();
        let id = tasks.create(None, vec![]).await.unwrap().id;
        tasks.set_running(id).await.unwrap();
        tasks
            .append_non_fatal_error(id, TaskError::new("item", "one item failed"))
            .await
            .unwrap();
        tasks
            .append_non_fatal_error(id, TaskError::new("item", "another item failed"))
            .await
            .unwrap();

        let view = tasks.view(id).await.unwrap().unwrap();
        assert_eq!(view.state, TaskState::Running);
        assert_eq!(view.non_fatal_errors.len(), 2);
    }

    #[tokio::test]
    async fn view_lists_spawned_tasks() {
        let (tasks, _) = manager();
        let parent = tasks.create(None, vec![]).await.unwrap().id;
        let child = tasks.create(Some(parent), vec![]).await.unwrap().id;

        let view = tasks.view(parent).await.unwrap().unwrap();
        assert_eq!(view.spawned_tasks, vec![child]);
        assert_eq!(tasks.view(child).await.unwrap().unwrap().parent, Some(parent));
    }

    #[tokio::test]
    async fn skipped_only_from_waiting() {
        let (tasks, _) = manager();
        let id = tasks.create(None, vec![]).await.unwrap().id;
        assert!(tasks.set_skipped(id).await.unwrap().is_applied());

        let other = tasks.create(None, vec![]).await.unwrap().id;
        tasks.set_running(other).await.unwrap();
        assert!(!tasks.set_skipped(other).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn concurrent_writers_all_land() {
        let (tasks, _) = manager();
        let id = tasks.create(None, vec![]).await.unwrap().id;
        tasks.set_running(id).await.unwrap();

        let mut joins = Vec::new();
        for i in 0..8 {
            let tasks = tasks.clone();
            joins.push(tokio::spawn(async move {
                tasks
                    .append_non_fatal_error(id, TaskError::new("n", format!("{i}")))
                    .await
                    .unwrap()
            }));
        }
        for j in joins {
            assert!(j.await.unwrap().is_applied());
        }
        let view = tasks.view(id).await.unwrap().unwrap();
        assert_eq!(view.non_fatal_errors.len(), 8);
    }
}
