use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether_core::app::ProcessHandle;
use tether_core::domain::{JobError, ResourceKey, TaskId, TaskState};
use tether_core::typed::{Handler, Job};
use tether_core::{AppBuilder, JobContext, Submission, Tasking, TaskingConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether", version, about = "Resource-reserving task dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs an in-process cluster against the in-memory store and prints its final status.
    Demo(DemoArgs),
    /// Loads a config file, validates it and prints the effective values.
    CheckConfig { path: PathBuf },
}

#[derive(clap::Args)]
struct DemoArgs {
    #[arg(long, default_value_t = 2)]
    dispatchers: usize,
    #[arg(long, default_value_t = 3)]
    workers: usize,
    /// Distinct repositories the sync tasks contend for.
    #[arg(long, default_value_t = 3)]
    repositories: usize,
    #[arg(long, default_value_t = 9)]
    tasks: usize,
    /// Crash the leader after submitting to show a spare taking over.
    #[arg(long)]
    crash_leader: bool,
    /// Queue a maintenance run behind the sync tasks.
    #[arg(long)]
    maintenance: bool,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncRepository {
    repository: String,
    work_ms: u64,
}

impl Job for SyncRepository {
    const NAME: &'static str = "content.repository.sync.v1";
}

struct SyncHandler;

#[async_trait]
impl Handler<SyncRepository> for SyncHandler {
    async fn handle(&self, ctx: JobContext, job: SyncRepository) -> Result<Value, JobError> {
        info!(task_id = %ctx.task_id(), worker = %ctx.worker(), repository = %job.repository, "syncing");
        tokio::time::sleep(Duration::from_millis(job.work_ms)).await;
        Ok(json!({ "repository": job.repository, "units_added": job.work_ms / 10 }))
    }
}

/// デモ用のタイミング（既定値は本番向けで遅すぎる）
fn demo_config() -> TaskingConfig {
    TaskingConfig {
        worker_ttl_ms: 1_500,
        heartbeat_interval_ms: 200,
        reaper_interval_ms: 300,
        acquire_backoff_ms: 20,
        ..TaskingConfig::default()
    }
}

fn build(config: TaskingConfig) -> anyhow::Result<Tasking> {
    let maintenance = config.maintenance_job.clone();
    let app = AppBuilder::new()
        .config(config)
        .register::<SyncRepository, _>(SyncHandler)?
        .register_fn(&maintenance, |ctx, _args| async move {
            info!(task_id = %ctx.task_id(), "maintenance running alone");
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, JobError>(json!({ "orphans_removed": 0 }))
        })?
        .expect_jobs(&[SyncRepository::NAME, maintenance.as_str()])
        .build()?;
    Ok(app)
}

async fn wait_until_settled(app: &Tasking, ids: &[TaskId], timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut pending = 0;
        for id in ids {
            let view = app.poll(*id).await?.with_context(|| format!("task {id} vanished"))?;
            if !view.state.is_terminal() {
                pending += 1;
            }
        }
        if pending == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("{pending} task(s) still unfinished after {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn demo(args: DemoArgs) -> anyhow::Result<()> {
    if args.dispatchers == 0 || args.workers == 0 || args.repositories == 0 {
        bail!("need at least one dispatcher, worker and repository");
    }
    let config = match &args.config {
        Some(path) => TaskingConfig::load(path)?,
        None => demo_config(),
    };
    let maintenance = config.maintenance_job.clone();
    let app = build(config)?;

    // (A) プロセスを起動（先頭のディスパッチャがリーダーになる）
    let mut dispatchers: Vec<ProcessHandle> = (0..args.dispatchers)
        .map(|i| app.spawn_dispatcher(&format!("host-{i}")))
        .collect();
    let workers: Vec<ProcessHandle> = (0..args.workers)
        .map(|i| app.spawn_worker(&format!("host-{i}")))
        .collect();
    let reaper = app.spawn_reaper();

    // (B) リポジトリごとに直列化される同期タスクを投入
    let mut ids = Vec::with_capacity(args.tasks + 1);
    for n in 0..args.tasks {
        let repository = format!("repo-{}", n % args.repositories);
        let job = SyncRepository {
            repository: repository.clone(),
            work_ms: 150,
        };
        let handle = app
            .submit_job(&job, [ResourceKey::new("repository", &repository)])
            .await?;
        ids.push(handle.id);
    }
    if args.maintenance {
        ids.push(app.submit(Submission::new(maintenance.as_str())).await?.id);
    }
    info!(submitted = ids.len(), "tasks submitted");

    // (C) リーダーを落としてフェイルオーバーを見せる
    if args.crash_leader {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let leader = app.status().await?.leader;
        match dispatchers.iter().position(|d| Some(d.name().to_string()) == leader) {
            Some(pos) => {
                let handle = dispatchers.remove(pos);
                warn!(dispatcher = %handle.name(), "crashing leader");
                handle.crash().await;
            }
            None => warn!("no leader to crash"),
        }
    }

    let settled = tokio::select! {
        r = wait_until_settled(&app, &ids, Duration::from_secs(args.timeout_secs)) => r,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, shutting down");
            Ok(())
        }
    };

    let status = app.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    for id in &ids {
        if let Some(view) = app.poll(*id).await?
            && view.state == TaskState::Failed
        {
            warn!(task_id = %id, error = ?view.error, "task failed");
        }
    }

    // (D) 後片付け
    for handle in workers.into_iter().chain(dispatchers) {
        handle.shutdown().await;
    }
    reaper.shutdown().await;
    settled
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = TaskingConfig::load(&path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Demo(args) => demo(args).await,
        Command::CheckConfig { path } => check_config(path),
    }
}
