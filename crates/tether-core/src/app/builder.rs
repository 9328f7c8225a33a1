//! AppBuilder - 起動時のワイヤリング
//!
//! プロセス全体で共有するもの（ハンドラ表・ストア・キュー・時計・設定）を
//! 一度だけ組み立てて `Tasking` に閉じ込めます。グローバルな登録簿は持ちません。
//!
//! # Fail-fast
//! - `expect_jobs()` で期待するジョブ名を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」と設定値を検査

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::cancel::{CancelOutcome, CancellationService};
use super::context::JobContext;
use super::dispatch::DispatchLoop;
use super::handle::ProcessHandle;
use super::leader::LeaderElection;
use super::reaper::HeartbeatReaper;
use super::reservations::ReservationManager;
use super::status::{self, ClusterStatus};
use super::submit::{Submission, Submitter, TaskHandle};
use super::tasks::TaskManager;
use super::worker_loop::WorkerProcess;
use super::workers::WorkerRegistry;
use crate::config::{ConfigError, TaskingConfig};
use crate::domain::{JobArgs, JobError, ResourceKey, TaskId, TaskView, WorkerName};
use crate::error::TetherError;
use crate::impls::{InMemoryMessageQueue, InMemoryStore, NoopJanitor};
use crate::ports::{Clock, IdGenerator, Janitor, MessageQueue, Store, SystemClock, UlidGenerator};
use crate::typed::{Handler, HandlerRegistry, Job, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing jobs: {0:?}. These jobs were expected but have no handler.")]
    MissingJobs(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct AppBuilder {
    registry: HandlerRegistry,
    expected_jobs: Option<Vec<String>>,
    config: TaskingConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    store: Option<Arc<dyn Store>>,
    queue: Option<Arc<dyn MessageQueue>>,
    janitor: Option<Arc<dyn Janitor>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_jobs: None,
            config: TaskingConfig::default(),
            clock: None,
            ids: None,
            store: None,
            queue: None,
            janitor: None,
        }
    }

    pub fn register<J: Job, H: Handler<J> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<J, H>(handler)?;
        Ok(self)
    }

    pub fn register_fn<F, Fut>(mut self, name: &str, f: F) -> Result<Self, RegistryError>
    where
        F: Fn(JobContext, JobArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.registry.register_fn(name, f)?;
        Ok(self)
    }

    pub fn expect_jobs(mut self, names: &[&str]) -> Self {
        self.expected_jobs = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn config(mut self, config: TaskingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn janitor(mut self, janitor: Arc<dyn Janitor>) -> Self {
        self.janitor = Some(janitor);
        self
    }

    /// Validates, then fills every unset port with its in-memory default.
    pub fn build(self) -> Result<Tasking, BuildError> {
        self.config.validate()?;
        if let Some(expected) = &self.expected_jobs {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobs(missing));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new(ids.clone())));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryMessageQueue::new()));
        let janitor = self.janitor.unwrap_or_else(|| Arc::new(NoopJanitor));
        let config = Arc::new(self.config);

        let tasks = TaskManager::new(store.clone(), clock.clone(), ids.clone());
        let workers = WorkerRegistry::new(store.clone(), clock.clone(), config.clone());
        let submitter = Submitter::new(tasks.clone(), queue.clone(), config.intake_queue.clone());
        let cancellation =
            CancellationService::new(tasks.clone(), store.clone(), queue.clone(), janitor);

        Ok(Tasking {
            config,
            clock,
            store,
            queue,
            registry: Arc::new(self.registry),
            tasks,
            workers,
            submitter,
            cancellation,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one process needs, built once and passed around explicitly.
#[derive(Clone)]
pub struct Tasking {
    config: Arc<TaskingConfig>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    queue: Arc<dyn MessageQueue>,
    registry: Arc<HandlerRegistry>,
    tasks: TaskManager,
    workers: WorkerRegistry,
    submitter: Submitter,
    cancellation: CancellationService,
}

impl Tasking {
    pub fn config(&self) -> &TaskingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn registered_jobs(&self) -> Vec<String> {
        self.registry.registered_jobs()
    }

    pub async fn submit(&self, submission: Submission) -> Result<TaskHandle, TetherError> {
        self.submitter.submit(submission).await
    }

    pub async fn submit_job<J: Job>(
        &self,
        job: &J,
        resources: impl IntoIterator<Item = ResourceKey>,
    ) -> Result<TaskHandle, TetherError> {
        self.submitter.submit_job(job, resources).await
    }

    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, TetherError> {
        self.cancellation.cancel(id).await
    }

    pub async fn poll(&self, id: TaskId) -> Result<Option<TaskView>, TetherError> {
        Ok(self.tasks.view(id).await?)
    }

    pub async fn delete(&self, id: TaskId) -> Result<(), TetherError> {
        Ok(self.tasks.delete(id).await?)
    }

    pub async fn status(&self) -> Result<ClusterStatus, TetherError> {
        Ok(status::snapshot(self.store.as_ref(), &self.workers, &self.config.dispatcher_lease).await?)
    }

    fn reservation_manager(&self) -> ReservationManager {
        ReservationManager::new(
            self.store.clone(),
            self.tasks.clone(),
            self.workers.clone(),
            self.config.acquire_backoff(),
        )
    }

    pub fn worker_name(&self, host: &str) -> WorkerName {
        WorkerName::new(&self.config.worker_prefix, host)
    }

    pub fn dispatcher_name(&self, host: &str) -> WorkerName {
        WorkerName::new(&self.config.dispatcher_prefix, host)
    }

    pub fn worker(&self, host: &str) -> WorkerProcess {
        WorkerProcess::new(
            self.worker_name(host),
            self.config.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.registry.clone(),
            self.tasks.clone(),
            self.workers.clone(),
            self.reservation_manager(),
            self.cancellation.clone(),
            self.submitter.clone(),
        )
    }

    pub fn spawn_worker(&self, host: &str) -> ProcessHandle {
        self.worker(host).spawn()
    }

    /// A dispatcher with its own lease identity. Reservations and the
    /// maintenance fence live in the shared store, so every instance sees
    /// the same exclusion.
    pub fn dispatcher(&self, host: &str) -> DispatchLoop {
        let name = self.dispatcher_name(host);
        let election = Arc::new(LeaderElection::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.dispatcher_lease.clone(),
            name.to_string(),
            self.config.worker_ttl_chrono(),
        ));
        DispatchLoop::new(
            name,
            self.config.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.registry.clone(),
            election,
            self.tasks.clone(),
            self.workers.clone(),
            self.reservation_manager(),
            self.submitter.clone(),
        )
    }

    pub fn spawn_dispatcher(&self, host: &str) -> ProcessHandle {
        self.dispatcher(host).spawn()
    }

    pub fn reaper(&self) -> HeartbeatReaper {
        HeartbeatReaper::new(
            self.workers.clone(),
            self.tasks.clone(),
            self.reservation_manager(),
            self.cancellation.clone(),
            self.store.clone(),
        )
    }

    pub fn spawn_reaper(&self) -> ProcessHandle {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let interval = self.config.reaper_interval();
        let join = tokio::spawn(self.reaper().run(interval, shutdown_rx));
        ProcessHandle::new(WorkerName::from_raw("reaper"), shutdown_tx, join)
    }
}
