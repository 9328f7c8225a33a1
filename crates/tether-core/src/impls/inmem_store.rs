//! InMemoryStore - 開発・テスト用の正本
//!
//! # 実装詳細
//! - すべての状態を 1 つの `tokio::sync::Mutex` の中に置く
//! - 1 操作 = 1 クリティカルセクション（= 1 トランザクション）
//! - `set_available(false)` でストア障害を再現できる

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    CreatedResource, LockRecord, Reservation, ResourceKey, TaskId, TaskRecord, TaskState,
    WorkerMark, WorkerName, WorkerRecord,
};
use crate::ports::store::MAINTENANCE_FENCE;
use crate::ports::{IdGenerator, Store, StoreError};

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, TaskRecord>,
    workers: HashMap<WorkerName, WorkerRecord>,
    /// resource ごとに高々 1 行（一意制約）
    reservations: BTreeMap<ResourceKey, Reservation>,
    locks: HashMap<String, LockRecord>,
    created: HashMap<TaskId, Vec<CreatedResource>>,
}

impl StoreState {
    fn task_has_reservations(&self, task: TaskId) -> bool {
        self.reservations.values().any(|r| r.tasks.contains(&task))
    }
}

pub struct InMemoryStore {
    state: Mutex<StoreState>,
    available: AtomicBool,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryStore {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            available: AtomicBool::new(true),
            ids,
        }
    }

    /// Simulates an outage: every call fails with `Unavailable` until switched
    /// back on.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::DuplicateKey(task.id.to_string()));
        }
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &TaskRecord) -> Result<TaskRecord, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let stored = state
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::NotFound(task.id.to_string()))?;
        if stored.version != task.version {
            return Err(StoreError::Conflict(format!(
                "{} at version {}, write based on {}",
                task.id, stored.version, task.version
            )));
        }
        let mut next = task.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if state.task_has_reservations(id) {
            return Err(StoreError::Protected(format!("{id} still holds reservations")));
        }
        state.tasks.remove(&id);
        state.created.remove(&id);
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut tasks: Vec<_> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn tasks_assigned_to(&self, worker: &WorkerName) -> Result<Vec<TaskRecord>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.worker.as_ref() == Some(worker))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn child_tasks(&self, parent: TaskId) -> Result<Vec<TaskId>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut children: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.parent == Some(parent))
            .map(|t| t.id)
            .collect();
        children.sort();
        Ok(children)
    }

    async fn record_heartbeat(
        &self,
        name: &WorkerName,
        at: DateTime<Utc>,
    ) -> Result<Option<WorkerRecord>, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let previous = state.workers.get(name).cloned();
        state
            .workers
            .insert(name.clone(), WorkerRecord::new(name.clone(), at));
        Ok(previous)
    }

    async fn get_worker(&self, name: &WorkerName) -> Result<Option<WorkerRecord>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.workers.get(name).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut workers: Vec<_> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    async fn mark_worker(&self, name: &WorkerName, mark: WorkerMark) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        worker.apply(mark);
        Ok(())
    }

    async fn lock_resources(
        &self,
        worker: &WorkerName,
        task: TaskId,
        resources: &[ResourceKey],
        alive_since: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;

        if state.locks.contains_key(MAINTENANCE_FENCE) {
            return Err(StoreError::Conflict("maintenance is fenced off".into()));
        }

        match state.tasks.get(&task) {
            None => return Err(StoreError::NotFound(task.to_string())),
            Some(t) if t.state != TaskState::Waiting => {
                return Err(StoreError::Conflict(format!("{task} is already {}", t.state)));
            }
            Some(t) => {
                if let Some(assigned) = t.worker.as_ref().filter(|w| *w != worker) {
                    return Err(StoreError::Conflict(format!("{task} is assigned to {assigned}")));
                }
            }
        }

        match state.workers.get(worker) {
            Some(w) if !w.gracefully_stopped && !w.cleaned_up && w.last_heartbeat >= alive_since => {}
            _ => return Err(StoreError::Conflict(format!("{worker} is not alive"))),
        }

        // 先に全件検査してから書く（all or nothing）
        for resource in resources {
            if let Some(existing) = state.reservations.get(resource)
                && &existing.worker != worker
            {
                return Err(StoreError::Conflict(format!(
                    "{resource} is held by {}",
                    existing.worker
                )));
            }
        }

        let mut locked = Vec::with_capacity(resources.len());
        for resource in resources {
            let id = self.ids.generate_reservation_id();
            let reservation = state
                .reservations
                .entry(resource.clone())
                .or_insert_with(|| Reservation {
                    id,
                    resource: resource.clone(),
                    worker: worker.clone(),
                    tasks: Default::default(),
                });
            reservation.tasks.insert(task);
            locked.push(reservation.clone());
        }
        if let Some(t) = state.tasks.get_mut(&task) {
            t.worker = Some(worker.clone());
            t.version += 1;
        }
        Ok(locked)
    }

    async fn release_task_reservations(
        &self,
        task: TaskId,
    ) -> Result<Vec<ResourceKey>, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let mut freed = Vec::new();
        state.reservations.retain(|resource, reservation| {
            if reservation.tasks.remove(&task) && reservation.tasks.is_empty() {
                freed.push(resource.clone());
                return false;
            }
            true
        });
        Ok(freed)
    }

    async fn release_worker_reservations(
        &self,
        worker: &WorkerName,
    ) -> Result<Vec<ResourceKey>, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let mut freed = Vec::new();
        state.reservations.retain(|resource, reservation| {
            if &reservation.worker == worker {
                freed.push(resource.clone());
                return false;
            }
            true
        });
        Ok(freed)
    }

    async fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .await
            .reservations
            .values()
            .cloned()
            .collect())
    }

    async fn insert_lock(&self, lock: LockRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.locks.contains_key(&lock.name) {
            return Err(StoreError::DuplicateKey(lock.name));
        }
        state.locks.insert(lock.name.clone(), lock);
        Ok(())
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.locks.get(name).cloned())
    }

    async fn touch_lock(
        &self,
        name: &str,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.locks.get_mut(name) {
            Some(lock) if lock.owner == owner => {
                lock.timestamp = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_lock(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.locks.get(name).is_some_and(|l| l.owner == owner) {
            state.locks.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_stale_lock(
        &self,
        name: &str,
        older_than: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.locks.get(name).is_some_and(|l| l.timestamp < older_than) {
            state.locks.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    async fn record_created_resource(
        &self,
        task: TaskId,
        resource: CreatedResource,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&task) {
            return Err(StoreError::NotFound(task.to_string()));
        }
        state.created.entry(task).or_default().push(resource);
        Ok(())
    }

    async fn finalize_created_resources(&self, task: TaskId) -> Result<usize, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for resource in state.created.get_mut(&task).into_iter().flatten() {
            if !resource.finalized {
                resource.finalized = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn take_unfinalized_resources(
        &self,
        task: TaskId,
    ) -> Result<Vec<CreatedResource>, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(all) = state.created.get_mut(&task) else {
            return Ok(Vec::new());
        };
        let (unfinalized, kept): (Vec<_>, Vec<_>) =
            std::mem::take(all).into_iter().partition(|r| !r.finalized);
        *all = kept;
        Ok(unfinalized)
    }
}
