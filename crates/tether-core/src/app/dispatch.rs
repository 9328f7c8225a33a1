//! DispatchLoop - 受付キューを消費してワーカーへ割り当てる
//!
//! リーダーのインスタンスだけが割り当てを行い、他は hot spare として
//! リースの失効を待ちます。1 リクエスト = 1 並行ユニット（JoinSet）で処理し、
//! 予約待ちのタスクが他のタスクを塞がないようにします（head-of-line blocking 回避）。
//!
//! 受付キューのメッセージはユニットが終わるまで ack しません。リーダーに
//! なったインスタンスは、前のリーダーが ack せずに残した配送を取り戻します。
//! 同じリクエストが二度届いても、二度目は既存の割り当てをなぞるだけです。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::context::JobContext;
use super::handle::{AbortOnDrop, ProcessHandle};
use super::leader::{LeaderElection, LeaderStatus};
use super::reservations::ReservationManager;
use super::submit::Submitter;
use super::tasks::TaskManager;
use super::workers::WorkerRegistry;
use crate::config::TaskingConfig;
use crate::domain::{
    DispatchRequest, JobEnvelope, Message, ResourceKey, TaskError, TaskId, WorkerMark, WorkerName,
};
use crate::ports::{DeliveryTag, MessageQueue, Store};
use crate::typed::HandlerRegistry;

/// A dispatch unit still running, with the delivery to hand back if it has to
/// be abandoned before the task was committed to a worker.
struct InFlight {
    task_id: TaskId,
    tag: DeliveryTag,
    committed: Arc<AtomicBool>,
    abort: AbortHandle,
}

struct DispatchState {
    units: JoinSet<()>,
    in_flight: HashMap<tokio::task::Id, InFlight>,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            units: JoinSet::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Forgets units that have finished.
    fn reap(&mut self) {
        while let Some(joined) = self.units.try_join_next_with_id() {
            let id = match joined {
                Ok((id, ())) => id,
                Err(e) => {
                    if e.is_panic() {
                        error!(error = %e, "dispatch unit panicked");
                    }
                    e.id()
                }
            };
            self.in_flight.remove(&id);
        }
    }
}

#[derive(Clone)]
pub struct DispatchLoop {
    name: WorkerName,
    /// Consumer identity on the intake queue, unique per incarnation.
    consumer: String,
    config: Arc<TaskingConfig>,
    store: Arc<dyn Store>,
    queue: Arc<dyn MessageQueue>,
    registry: Arc<HandlerRegistry>,
    election: Arc<LeaderElection>,
    tasks: TaskManager,
    workers: WorkerRegistry,
    reservations: ReservationManager,
    submitter: Submitter,
}

impl DispatchLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: WorkerName,
        config: Arc<TaskingConfig>,
        store: Arc<dyn Store>,
        queue: Arc<dyn MessageQueue>,
        registry: Arc<HandlerRegistry>,
        election: Arc<LeaderElection>,
        tasks: TaskManager,
        workers: WorkerRegistry,
        reservations: ReservationManager,
        submitter: Submitter,
    ) -> Self {
        let consumer = format!("{name}#{}", Ulid::new());
        Self {
            name,
            consumer,
            config,
            store,
            queue,
            registry,
            election,
            tasks,
            workers,
            reservations,
            submitter,
        }
    }

    pub fn election(&self) -> &Arc<LeaderElection> {
        &self.election
    }

    pub fn spawn(self) -> ProcessHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = self.name.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        ProcessHandle::new(name, shutdown_tx, join)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.heartbeat_interval();
        // JoinSet は drop 時に全ユニットを abort する（crash 時も孤児を残さない）
        let mut state = DispatchState::new();
        let mut leading = false;

        info!(dispatcher = %self.name, "dispatcher started");
        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.workers.record_heartbeat(&self.name).await {
                warn!(dispatcher = %self.name, error = %e, "heartbeat failed");
            }
            state.reap();

            match self.election.tick().await {
                LeaderStatus::Leader => {
                    if !leading {
                        leading = self.recover_intake().await;
                    }
                    let deadline = Instant::now() + interval;
                    loop {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        let delivery = tokio::select! {
                            _ = shutdown.changed() => break 'outer,
                            delivery = self.queue.consume(&self.config.intake_queue, &self.consumer, remaining) => delivery,
                        };
                        match delivery {
                            Ok(Some(delivery)) => match delivery.message {
                                Message::Dispatch(request) => {
                                    self.start_unit(&mut state, request, delivery.tag)
                                }
                                other => {
                                    warn!(task_id = %other.task_id(), "unexpected message on intake queue");
                                    self.ack(delivery.tag).await;
                                }
                            },
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "cannot consume intake queue");
                                tokio::select! {
                                    _ = shutdown.changed() => break 'outer,
                                    _ = tokio::time::sleep_until(deadline) => break,
                                }
                            }
                        }
                    }
                }
                LeaderStatus::Spare => {
                    leading = false;
                    // リースを失ったなら、まだ確定していない割り当ては新リーダーへ返す
                    self.hand_back(&mut state).await;
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }

        self.stop_gracefully(state).await;
    }

    /// Requeues intake deliveries some earlier consumer never acked. `false`
    /// when the queue could not be reached, so the next tick tries again.
    async fn recover_intake(&self) -> bool {
        match self
            .queue
            .recover(&self.config.intake_queue, &self.consumer)
            .await
        {
            Ok(0) => true,
            Ok(recovered) => {
                warn!(dispatcher = %self.name, recovered, "requeued dispatch requests left unacked by a previous leader");
                true
            }
            Err(e) => {
                warn!(dispatcher = %self.name, error = %e, "cannot recover intake queue");
                false
            }
        }
    }

    fn start_unit(&self, state: &mut DispatchState, request: DispatchRequest, tag: DeliveryTag) {
        debug!(task_id = %request.task_id, job = %request.job, "dispatch request received");
        let task_id = request.task_id;
        let committed = Arc::new(AtomicBool::new(false));
        let unit = self.clone();
        let flag = committed.clone();
        let abort = state.units.spawn(async move {
            if request.job.as_str() == unit.config.maintenance_job {
                unit.run_maintenance(request, flag).await
            } else {
                unit.dispatch(request, flag).await
            }
            unit.ack(tag).await;
        });
        state.in_flight.insert(
            abort.id(),
            InFlight {
                task_id,
                tag,
                committed,
                abort,
            },
        );
    }

    async fn ack(&self, tag: DeliveryTag) {
        if let Err(e) = self.queue.ack(tag).await {
            warn!(dispatcher = %self.name, error = %e, "cannot ack dispatch request");
        }
    }

    /// Reserve, then publish `Run` followed by `Release` to the chosen
    /// worker's queue. The reservation also assigns the worker.
    async fn dispatch(&self, request: DispatchRequest, committed: Arc<AtomicBool>) {
        let task_id = request.task_id;
        let resources = ResourceKey::normalize(request.resources.iter().cloned());

        let Some(worker) = self.reservations.acquire(task_id, &resources).await else {
            self.settle_ended(task_id).await;
            return;
        };
        committed.store(true, Ordering::SeqCst);

        let envelope = JobEnvelope::from(request);
        if let Err(e) = self.queue.publish(worker.queue(), Message::Run(envelope)).await {
            error!(task_id = %task_id, worker = %worker, error = %e, "cannot publish job");
            let reason = TaskError::new("dispatch_failed", e.to_string());
            if let Err(e) = self.tasks.set_failed(task_id, reason).await {
                error!(task_id = %task_id, error = %e, "cannot mark task failed");
            }
            self.release(task_id).await;
            return;
        }
        info!(task_id = %task_id, worker = %worker, "task dispatched");

        // Release は Run の後ろに必ず積む
        self.publish_release(task_id, &worker).await;
    }

    async fn publish_release(&self, task_id: TaskId, worker: &WorkerName) {
        loop {
            match self
                .queue
                .publish(worker.queue(), Message::Release { task_id })
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    warn!(task_id = %task_id, worker = %worker, error = %e, "cannot publish release, retrying");
                    tokio::time::sleep(self.config.acquire_backoff()).await;
                }
            }
        }
    }

    /// The task stopped waiting before this delivery could place it. If an
    /// earlier delivery already handed it to a worker, repeat the `Release`
    /// in case that unit died before publishing it; a second one is a no-op
    /// on the worker. Otherwise nobody will ever run it.
    async fn settle_ended(&self, task_id: TaskId) {
        match self.tasks.get(task_id).await {
            Ok(Some(task)) => match task.worker {
                Some(worker) => {
                    debug!(task_id = %task_id, worker = %worker, state = %task.state, "repeating release for a task placed earlier");
                    self.publish_release(task_id, &worker).await;
                }
                None => self.forget_kill(task_id).await,
            },
            Ok(None) => self.forget_kill(task_id).await,
            Err(e) => warn!(task_id = %task_id, error = %e, "cannot read ended task"),
        }
    }

    async fn forget_kill(&self, task_id: TaskId) {
        if let Err(e) = self.queue.forget_kill(task_id).await {
            warn!(task_id = %task_id, error = %e, "cannot clear kill flag");
        }
    }

    /// Runs the global cleanup job here behind the store-wide maintenance
    /// fence, once every reservation has drained.
    async fn run_maintenance(&self, request: DispatchRequest, committed: Arc<AtomicBool>) {
        let task_id = request.task_id;
        let owner = self.name.as_str();
        if !self.reservations.raise_fence(owner, task_id).await {
            debug!(task_id = %task_id, "maintenance task ended before it started");
            self.forget_kill(task_id).await;
            return;
        }
        committed.store(true, Ordering::SeqCst);

        self.maintain(request).await;

        self.reservations.lower_fence(owner).await;
        self.forget_kill(task_id).await;
    }

    async fn maintain(&self, request: DispatchRequest) {
        let task_id = request.task_id;

        // この dispatcher が落ちたら reaper がタスクを CANCELED にする
        match self.tasks.assign_worker(task_id, &self.name).await {
            Ok(t) if t.is_applied() => {}
            Ok(t) => {
                debug!(task_id = %task_id, transition = ?t, "maintenance task taken elsewhere");
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "cannot assign maintenance task");
                return;
            }
        }
        if !self.reservations.wait_drained(task_id).await {
            return;
        }

        match self.tasks.set_running(task_id).await {
            Ok(t) if t.is_applied() => {}
            Ok(_) => return,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "cannot start maintenance task");
                return;
            }
        }
        info!(task_id = %task_id, "maintenance started with no live reservation");

        let Some(handler) = self.registry.get(request.job.as_str()) else {
            let reason = TaskError::new(
                "unknown_job",
                format!("no handler registered for {}", request.job),
            );
            if let Err(e) = self.tasks.set_failed(task_id, reason).await {
                error!(task_id = %task_id, error = %e, "cannot mark task failed");
            }
            return;
        };

        let ctx = JobContext::new(
            task_id,
            self.name.clone(),
            self.tasks.clone(),
            self.store.clone(),
            self.submitter.clone(),
        );
        let args = request.args;
        let mut running = AbortOnDrop(tokio::spawn(async move { handler.handle_dyn(ctx, args).await }));
        let outcome = match (&mut running.0).await {
            Ok(Ok(result)) => self.tasks.set_completed(task_id, result).await,
            Ok(Err(job_error)) => {
                error!(task_id = %task_id, error = %job_error, "maintenance failed");
                self.tasks.set_failed(task_id, job_error.into()).await
            }
            Err(join_error) => {
                error!(task_id = %task_id, error = %join_error, "maintenance panicked");
                self.tasks
                    .set_failed(task_id, TaskError::new("panic", join_error.to_string()))
                    .await
            }
        };
        match outcome {
            Ok(_) => info!(task_id = %task_id, "maintenance finished"),
            Err(e) => error!(task_id = %task_id, error = %e, "cannot record maintenance outcome"),
        }
    }

    async fn release(&self, task_id: TaskId) {
        if let Err(e) = self.reservations.release(task_id).await {
            error!(task_id = %task_id, error = %e, "cannot release reservations");
        }
    }

    /// Aborts every unit that has not committed its task to a worker and puts
    /// its delivery back at the head of the intake queue. Committed units
    /// finish and ack on their own.
    async fn hand_back(&self, state: &mut DispatchState) {
        state.reap();
        let abandoned: Vec<tokio::task::Id> = state
            .in_flight
            .iter()
            .filter(|(_, unit)| !unit.committed.load(Ordering::SeqCst))
            .map(|(id, _)| *id)
            .collect();

        for id in abandoned {
            let Some(unit) = state.in_flight.remove(&id) else {
                continue;
            };
            unit.abort.abort();
            match self.queue.reject(unit.tag).await {
                Ok(()) => debug!(task_id = %unit.task_id, "dispatch request handed back"),
                // 未 ack のまま残るので、次のリーダーが recover で拾う
                Err(e) => error!(task_id = %unit.task_id, error = %e, "cannot hand back dispatch request"),
            }
        }
    }

    async fn stop_gracefully(&self, mut state: DispatchState) {
        info!(dispatcher = %self.name, "dispatcher shutting down");
        self.hand_back(&mut state).await;
        // 確定済みのユニットは publish が終わるまで待つ
        while state.units.join_next().await.is_some() {}

        self.election.resign().await;
        if let Err(e) = self
            .store
            .mark_worker(&self.name, WorkerMark::GracefullyStopped)
            .await
        {
            warn!(dispatcher = %self.name, error = %e, "cannot mark dispatcher stopped");
        }
        info!(dispatcher = %self.name, "dispatcher stopped");
    }
}
