//! ProcessHandle - バックグラウンドで動くループの操作ハンドル
//!
//! - `shutdown()` は停止を要求し、後片付けが終わるまで待つ
//! - `crash()` は後片付けなしで即座に止める（プロセス異常終了の再現）

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::WorkerName;

/// Aborts the spawned job when dropped, so a crashed or canceled loop never
/// leaves an orphan job running.
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct ProcessHandle {
    name: WorkerName,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ProcessHandle {
    pub(crate) fn new(name: WorkerName, shutdown_tx: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown_tx,
            join,
        }
    }

    pub fn name(&self) -> &WorkerName {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn request_shutdown(&self) {
        // 受信側が既に終わっていても構わない
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }

    /// Stops the loop without any cleanup: no lease release, no final
    /// heartbeat flags, in-flight work dropped.
    pub async fn crash(self) {
        self.join.abort();
        let _ = self.join.await;
    }
}
