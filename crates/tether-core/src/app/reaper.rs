//! HeartbeatReaper - 消えたワーカーの回収
//!
//! どのプロセスでも動く（リーダー限定ではない）定期スキャンです。
//! heartbeat が TTL を過ぎたワーカーの未完了タスクを CANCELED にし、
//! 予約と、残っていればメンテナンスのフェンスを解放してから
//! cleaned_up を立てます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::cancel::{CancelOutcome, CancellationService};
use super::reservations::ReservationManager;
use super::tasks::TaskManager;
use super::workers::WorkerRegistry;
use crate::domain::{ProcessRole, ResourceKey, TaskId, WorkerMark, WorkerName};
use crate::ports::{Store, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub reaped: Vec<WorkerName>,
    pub canceled: Vec<TaskId>,
    pub released: Vec<ResourceKey>,
    pub fences_cleared: usize,
}

#[derive(Clone)]
pub struct HeartbeatReaper {
    workers: WorkerRegistry,
    tasks: TaskManager,
    reservations: ReservationManager,
    cancellation: CancellationService,
    store: Arc<dyn Store>,
}

impl HeartbeatReaper {
    pub fn new(
        workers: WorkerRegistry,
        tasks: TaskManager,
        reservations: ReservationManager,
        cancellation: CancellationService,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            workers,
            tasks,
            reservations,
            cancellation,
            store,
        }
    }

    pub async fn tick(&self) -> Result<ReapReport, StoreError> {
        let mut report = ReapReport::default();

        for worker in self.workers.dirty_workers().await? {
            let name = worker.name;
            error!(worker = %name, last_heartbeat = %worker.last_heartbeat, "worker has gone missing, cleaning up");

            for task in self.tasks.assigned_to(&name).await? {
                if task.state.is_terminal() {
                    continue;
                }
                match self.cancellation.cancel(task.id).await {
                    Ok(CancelOutcome::Canceled) => {
                        self.cancellation.forget(task.id).await;
                        report.canceled.push(task.id);
                    }
                    Ok(CancelOutcome::AlreadyFinished(_)) => {}
                    Err(e) => warn!(task_id = %task.id, worker = %name, error = %e, "cannot cancel task of missing worker"),
                }
            }

            report
                .released
                .extend(self.reservations.release_worker(&name).await?);
            if self.reservations.clear_fence_of(&name).await? {
                report.fences_cleared += 1;
            }
            self.store.mark_worker(&name, WorkerMark::CleanedUp).await?;
            report.reaped.push(name);
        }

        self.check_capacity().await?;
        Ok(report)
    }

    async fn check_capacity(&self) -> Result<(), StoreError> {
        if self
            .workers
            .online_with_role(ProcessRole::Dispatcher)
            .await?
            .is_empty()
        {
            error!("no dispatcher is online; submitted tasks will not be dispatched");
        }
        if self
            .workers
            .online_with_role(ProcessRole::Worker)
            .await?
            .is_empty()
        {
            error!("no worker is online; dispatched tasks will not run");
        }
        Ok(())
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(report) if !report.reaped.is_empty() => {
                    debug!(reaped = ?report.reaped, canceled = report.canceled.len(), "reaper tick")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "reaper tick failed"),
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
