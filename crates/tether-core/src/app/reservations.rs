//! ReservationManager - タスクのリソース一覧を原子的にワーカーへ割り当てる
//!
//! 唯一の排他プリミティブです。ブロッキング待ちではなく
//! 「試す → 失敗したら一定時間待って最初から」のポーリングで進めます。
//! 待っている者どうしの順序（FIFO）は保証しません。
//!
//! メンテナンス中の排他もストア上のロック行（フェンス）で表すので、
//! どのディスパッチャのインスタンスから見ても同じ状態になります。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::tasks::TaskManager;
use super::workers::WorkerRegistry;
use crate::domain::{LockRecord, ResourceKey, TaskId, TaskState, WorkerName};
use crate::error::TetherError;
use crate::ports::store::MAINTENANCE_FENCE;
use crate::ports::{Store, StoreError};

#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn Store>,
    tasks: TaskManager,
    workers: WorkerRegistry,
    backoff: Duration,
}

impl ReservationManager {
    pub fn new(
        store: Arc<dyn Store>,
        tasks: TaskManager,
        workers: WorkerRegistry,
        backoff: Duration,
    ) -> Self {
        Self {
            store,
            tasks,
            workers,
            backoff,
        }
    }

    /// One attempt. `Ok(None)` means "nothing available right now, try later".
    ///
    /// On success the task is already assigned to the returned worker.
    pub async fn try_acquire(
        &self,
        task: TaskId,
        resources: &[ResourceKey],
    ) -> Result<Option<WorkerName>, TetherError> {
        // 1. 既に保持しているワーカーを優先  2. なければ空いているワーカー
        let candidate = match self.workers.worker_with_any_reservation(resources).await? {
            Some(holder) => holder,
            None => match self.workers.get_unreserved_worker().await? {
                Some(free) => free,
                None => return Ok(None),
            },
        };

        let alive_since = self.workers.alive_since();
        match self
            .store
            .lock_resources(&candidate, task, resources, alive_since)
            .await
        {
            Ok(_) => Ok(Some(candidate)),
            // 割り込まれた、保持者が死んでいる、フェンス中: 次の試行でやり直す
            Err(StoreError::Conflict(reason)) => {
                debug!(task_id = %task, worker = %candidate, reason = %reason, "reservation attempt lost");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retries until the resources are locked on some worker.
    ///
    /// A task that already has a worker while still waiting was reserved by
    /// an earlier delivery of the same request; that worker is returned
    /// as is. Returns `None` when the task stopped waiting (canceled,
    /// deleted, already running). Store and queue errors are retried, never
    /// surfaced.
    pub async fn acquire(&self, task: TaskId, resources: &[ResourceKey]) -> Option<WorkerName> {
        let mut attempts: u64 = 0;
        loop {
            match self.tasks.get(task).await {
                Ok(None) => {
                    warn!(task_id = %task, "task vanished while waiting for resources");
                    return None;
                }
                Ok(Some(t)) if t.state != TaskState::Waiting => {
                    debug!(task_id = %task, state = %t.state, "task no longer waiting for resources");
                    return None;
                }
                Ok(Some(t)) => match t.worker {
                    Some(worker) => {
                        info!(task_id = %task, worker = %worker, "resources already reserved");
                        return Some(worker);
                    }
                    None => match self.try_acquire(task, resources).await {
                        Ok(Some(worker)) => {
                            info!(task_id = %task, worker = %worker, resources = ?resources, attempts, "resources reserved");
                            return Some(worker);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(task_id = %task, error = %e, "reservation attempt failed"),
                    },
                },
                Err(e) => warn!(task_id = %task, error = %e, "cannot read task while reserving"),
            }
            attempts += 1;
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// `None` when the store cannot tell.
    async fn still_waiting(&self, task: TaskId) -> Option<bool> {
        match self.tasks.get(task).await {
            Ok(t) => Some(t.is_some_and(|t| t.state == TaskState::Waiting)),
            Err(e) => {
                warn!(task_id = %task, error = %e, "cannot read task");
                None
            }
        }
    }

    /// Inserts the maintenance fence under `owner`, retrying while someone
    /// else holds it. From then on no reservation can be created anywhere.
    ///
    /// Returns `false`, without a fence, once `task` stops waiting.
    pub async fn raise_fence(&self, owner: &str, task: TaskId) -> bool {
        loop {
            match self.still_waiting(task).await {
                Some(false) => return false,
                Some(true) => {
                    let fence = LockRecord::new(MAINTENANCE_FENCE, owner, self.workers.now());
                    match self.store.insert_lock(fence).await {
                        Ok(()) => {
                            info!(task_id = %task, owner, "maintenance fence raised");
                            return true;
                        }
                        Err(StoreError::DuplicateKey(_)) => {
                            debug!(task_id = %task, "maintenance fence held elsewhere")
                        }
                        Err(e) => warn!(task_id = %task, error = %e, "cannot raise maintenance fence"),
                    }
                }
                None => {}
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Waits until no reservation is live. `false` once `task` stops waiting.
    pub async fn wait_drained(&self, task: TaskId) -> bool {
        loop {
            if self.still_waiting(task).await == Some(false) {
                return false;
            }
            match self.store.list_reservations().await {
                Ok(live) if live.is_empty() => return true,
                Ok(live) => debug!(live = live.len(), "waiting for reservations to drain"),
                Err(e) => warn!(error = %e, "cannot list reservations"),
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Deletes the fence if `owner` still holds it, retrying through store
    /// outages.
    pub async fn lower_fence(&self, owner: &str) {
        loop {
            match self.store.delete_lock(MAINTENANCE_FENCE, owner).await {
                Ok(true) => {
                    info!(owner, "maintenance fence lowered");
                    return;
                }
                Ok(false) => {
                    warn!(owner, "maintenance fence was already gone");
                    return;
                }
                Err(e) => warn!(owner, error = %e, "cannot lower maintenance fence, retrying"),
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Removes a fence left behind by a process that died holding it.
    pub async fn clear_fence_of(&self, owner: &WorkerName) -> Result<bool, StoreError> {
        let cleared = self
            .store
            .delete_lock(MAINTENANCE_FENCE, owner.as_str())
            .await?;
        if cleared {
            warn!(owner = %owner, "removed maintenance fence of missing process");
        }
        Ok(cleared)
    }

    pub async fn release(&self, task: TaskId) -> Result<Vec<ResourceKey>, StoreError> {
        self.tasks.release_reservations(task).await
    }

    pub async fn release_worker(&self, worker: &WorkerName) -> Result<Vec<ResourceKey>, StoreError> {
        let freed = self.store.release_worker_reservations(worker).await?;
        if !freed.is_empty() {
            info!(worker = %worker, freed = ?freed, "released reservations of worker");
        }
        Ok(freed)
    }
}
