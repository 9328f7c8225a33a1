//! WorkerProcess - ワーカー側のプロトコル
//!
//! 専用キュー（ワーカー名と同名）を消費し、`Run` でジョブを実行し、
//! `Release` で予約を解放します。実行中も heartbeat を送り続け、
//! kill シグナルを受けたらジョブを中断します。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::cancel::{CancelOutcome, CancellationService};
use super::context::JobContext;
use super::handle::{AbortOnDrop, ProcessHandle};
use super::reservations::ReservationManager;
use super::submit::Submitter;
use super::tasks::TaskManager;
use super::workers::WorkerRegistry;
use crate::config::TaskingConfig;
use crate::domain::{JobEnvelope, JobError, Message, TaskError, TaskId, TaskState, WorkerMark, WorkerName};
use crate::ports::{MessageQueue, Store};
use crate::typed::HandlerRegistry;

enum JobExit {
    Finished(Result<Result<Value, JobError>, tokio::task::JoinError>),
    Killed,
    Shutdown,
}

#[derive(Clone)]
pub struct WorkerProcess {
    name: WorkerName,
    config: Arc<TaskingConfig>,
    store: Arc<dyn Store>,
    queue: Arc<dyn MessageQueue>,
    registry: Arc<HandlerRegistry>,
    tasks: TaskManager,
    workers: WorkerRegistry,
    reservations: ReservationManager,
    cancellation: CancellationService,
    submitter: Submitter,
}

impl WorkerProcess {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: WorkerName,
        config: Arc<TaskingConfig>,
        store: Arc<dyn Store>,
        queue: Arc<dyn MessageQueue>,
        registry: Arc<HandlerRegistry>,
        tasks: TaskManager,
        workers: WorkerRegistry,
        reservations: ReservationManager,
        cancellation: CancellationService,
        submitter: Submitter,
    ) -> Self {
        Self {
            name,
            config,
            store,
            queue,
            registry,
            tasks,
            workers,
            reservations,
            cancellation,
            submitter,
        }
    }

    pub fn name(&self) -> &WorkerName {
        &self.name
    }

    pub fn spawn(self) -> ProcessHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = self.name.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        ProcessHandle::new(name, shutdown_tx, join)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut kills = self.queue.subscribe_kills();
        let poll = self.config.heartbeat_interval();

        info!(worker = %self.name, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                _ = heartbeat.tick() => self.heartbeat().await,
                message = self.queue.consume(self.name.queue(), self.name.as_str(), poll) => match message {
                    Ok(Some(delivery)) => {
                        match delivery.message {
                            Message::Run(envelope) => {
                                self.execute(envelope, &mut heartbeat, &mut kills, &mut shutdown).await
                            }
                            Message::Release { task_id } => self.release(task_id).await,
                            other => {
                                warn!(worker = %self.name, task_id = %other.task_id(), "unexpected message on worker queue")
                            }
                        }
                        if let Err(e) = self.queue.ack(delivery.tag).await {
                            warn!(worker = %self.name, error = %e, "cannot ack message");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(worker = %self.name, error = %e, "cannot consume worker queue");
                        tokio::time::sleep(self.config.acquire_backoff()).await;
                    }
                },
            }
        }
        self.stop_gracefully().await;
    }

    async fn heartbeat(&self) {
        if let Err(e) = self.workers.record_heartbeat(&self.name).await {
            warn!(worker = %self.name, error = %e, "heartbeat failed");
        }
    }

    async fn execute(
        &self,
        envelope: JobEnvelope,
        heartbeat: &mut Interval,
        kills: &mut broadcast::Receiver<TaskId>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let JobEnvelope { task_id, job, args } = envelope;

        match self.tasks.set_running(task_id).await {
            Ok(t) if t.is_applied() => {}
            Ok(t) => {
                debug!(task_id = %task_id, transition = ?t, "task no longer waiting, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "cannot mark task running");
                return;
            }
        }

        // set_running より前に出た kill は broadcast では届かない
        if self.queue.is_killed(task_id).await.unwrap_or(false) {
            info!(task_id = %task_id, "task was killed before it started");
            self.finish_canceled(task_id).await;
            return;
        }

        let Some(handler) = self.registry.get(job.as_str()) else {
            error!(task_id = %task_id, job = %job, "no handler registered for job");
            let reason = TaskError::new("unknown_job", format!("no handler registered for {job}"));
            self.record(task_id, self.tasks.set_failed(task_id, reason).await);
            return;
        };

        info!(task_id = %task_id, job = %job, worker = %self.name, "task started");
        let ctx = JobContext::new(
            task_id,
            self.name.clone(),
            self.tasks.clone(),
            self.store.clone(),
            self.submitter.clone(),
        );
        let mut running = AbortOnDrop(tokio::spawn(async move { handler.handle_dyn(ctx, args).await }));
        let mut kills_open = true;

        let exit = loop {
            tokio::select! {
                joined = &mut running.0 => break JobExit::Finished(joined),
                _ = heartbeat.tick() => self.heartbeat().await,
                killed = kills.recv(), if kills_open => match killed {
                    Ok(id) if id == task_id => break JobExit::Killed,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.queue.is_killed(task_id).await.unwrap_or(false) {
                            break JobExit::Killed;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => kills_open = false,
                },
                _ = shutdown.changed() => break JobExit::Shutdown,
            }
        };
        drop(running);

        match exit {
            JobExit::Finished(Ok(Ok(result))) => {
                let transition = self.tasks.set_completed(task_id, result).await;
                if matches!(&transition, Ok(t) if t.is_applied()) {
                    info!(task_id = %task_id, "task completed");
                    if let Err(e) = self.store.finalize_created_resources(task_id).await {
                        warn!(task_id = %task_id, error = %e, "cannot finalize created resources");
                    }
                }
                self.record(task_id, transition);
            }
            JobExit::Finished(Ok(Err(job_error))) => {
                error!(task_id = %task_id, error = %job_error, "task failed");
                self.record(task_id, self.tasks.set_failed(task_id, job_error.into()).await);
            }
            JobExit::Finished(Err(join_error)) => {
                error!(task_id = %task_id, error = %join_error, "task panicked");
                let reason = TaskError::new("panic", join_error.to_string());
                self.record(task_id, self.tasks.set_failed(task_id, reason).await);
            }
            JobExit::Killed => {
                info!(task_id = %task_id, "task killed");
                self.finish_canceled(task_id).await;
            }
            JobExit::Shutdown => {
                info!(task_id = %task_id, "worker stopping, canceling current task");
                self.finish_canceled(task_id).await;
            }
        }
    }

    /// The kill normally comes with a cancellation that already set the
    /// state. Make sure it is terminal either way.
    async fn finish_canceled(&self, task_id: TaskId) {
        if let Err(e) = self.cancellation.cancel(task_id).await {
            warn!(task_id = %task_id, error = %e, "cannot cancel task");
        }
    }

    fn record<T, E: std::fmt::Display>(&self, task_id: TaskId, result: Result<T, E>) {
        if let Err(e) = result {
            error!(task_id = %task_id, error = %e, "cannot record task outcome");
        }
    }

    async fn release(&self, task_id: TaskId) {
        // Run を処理したのに RUNNING のまま: ジョブが何も報告せずに消えた
        match self.tasks.get(task_id).await {
            Ok(Some(task)) if task.state == TaskState::Running => {
                let reason = TaskError::new(
                    "exited_immediately",
                    "task process exited immediately before reporting a result",
                );
                error!(task_id = %task_id, worker = %self.name, "task exited immediately");
                self.record(task_id, self.tasks.set_failed(task_id, reason).await);
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "cannot read task before release"),
        }
        if let Err(e) = self.reservations.release(task_id).await {
            error!(task_id = %task_id, error = %e, "cannot release reservations");
        }
        // このタスクが再び実行されることはない
        if let Err(e) = self.queue.forget_kill(task_id).await {
            warn!(task_id = %task_id, error = %e, "cannot clear kill flag");
        }
    }

    async fn stop_gracefully(&self) {
        info!(worker = %self.name, "worker shutting down");
        match self.tasks.assigned_to(&self.name).await {
            Ok(tasks) => {
                for task in tasks.into_iter().filter(|t| !t.state.is_terminal()) {
                    match self.cancellation.cancel(task.id).await {
                        Ok(CancelOutcome::Canceled) => {
                            info!(task_id = %task.id, "canceled task of stopping worker")
                        }
                        Ok(CancelOutcome::AlreadyFinished(_)) => {}
                        Err(e) => warn!(task_id = %task.id, error = %e, "cannot cancel task"),
                    }
                }
            }
            Err(e) => warn!(worker = %self.name, error = %e, "cannot list tasks of stopping worker"),
        }
        if let Err(e) = self.reservations.release_worker(&self.name).await {
            warn!(worker = %self.name, error = %e, "cannot release reservations of stopping worker");
        }
        if let Err(e) = self
            .store
            .mark_worker(&self.name, WorkerMark::GracefullyStopped)
            .await
        {
            warn!(worker = %self.name, error = %e, "cannot mark worker stopped");
        }
        info!(worker = %self.name, "worker stopped");
    }
}
