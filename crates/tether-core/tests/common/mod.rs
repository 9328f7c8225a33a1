#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tether_core::domain::{JobError, TaskId, TaskState, TaskView};
use tether_core::ports::Store;
use tether_core::{AppBuilder, Tasking, TaskingConfig};

pub const SLEEP_JOB: &str = "test.sleep";
pub const FAIL_JOB: &str = "test.fail";

/// Short intervals so crash detection happens within a test's patience.
pub fn fast_config() -> TaskingConfig {
    TaskingConfig {
        worker_ttl_ms: 400,
        heartbeat_interval_ms: 40,
        reaper_interval_ms: 50,
        acquire_backoff_ms: 10,
        ..TaskingConfig::default()
    }
}

/// Tracks how many sleep jobs run at once.
#[derive(Default)]
pub struct Gauge {
    active: AtomicUsize,
    max: AtomicUsize,
    finished: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Builder with the sleep and fail jobs registered.
pub fn builder(gauge: Arc<Gauge>) -> AppBuilder {
    AppBuilder::new()
        .config(fast_config())
        .register_fn(SLEEP_JOB, move |_ctx, args| {
            let gauge = gauge.clone();
            async move {
                let ms = args.kwargs.get("ms").and_then(Value::as_u64).unwrap_or(50);
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(ms)).await;
                gauge.exit();
                Ok::<_, JobError>(json!({ "slept_ms": ms }))
            }
        })
        .unwrap()
        .register_fn(FAIL_JOB, |_ctx, _args| async {
            Err::<Value, _>(JobError::new("boom").with_code("test_failure"))
        })
        .unwrap()
}

pub fn app() -> (Tasking, Arc<Gauge>) {
    let gauge = Arc::new(Gauge::default());
    (builder(gauge.clone()).build().unwrap(), gauge)
}

pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(app: &Tasking, id: TaskId, state: TaskState) -> TaskView {
    let reached = eventually(Duration::from_secs(5), || async {
        app.poll(id).await.unwrap().map(|v| v.state) == Some(state)
    })
    .await;
    let view = app.poll(id).await.unwrap().unwrap();
    assert!(reached, "task {id} stuck in {} waiting for {state}", view.state);
    view
}

pub async fn live_reservations(app: &Tasking) -> usize {
    app.store().list_reservations().await.unwrap().len()
}

/// Collects formatted log output so tests can assert on operator-facing lines.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Routes every event on the current thread here until the guard drops.
    /// Pair with a current-thread runtime so spawned loops log here too.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let logs = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines_with(&self, needle: &str) -> Vec<String> {
        let raw = self.0.lock().unwrap().clone();
        String::from_utf8_lossy(&raw)
            .lines()
            .filter(|l| l.contains(needle))
            .map(str::to_string)
            .collect()
    }

    pub fn has(&self, needle: &str, owner: &str) -> bool {
        self.lines_with(needle).iter().any(|l| l.contains(owner))
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
