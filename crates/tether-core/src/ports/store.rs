//! Store port - 永続ストア（正本 / source of truth）
//!
//! Store は以下を管理します：
//! - タスク（状態・エラー・割り当てワーカー）
//! - ワーカー（heartbeat と 2 つのフラグのみ。生存状態は保存しない）
//! - 予約（resource × worker と、それに依存するタスク集合）
//! - リース（リーダー選出用のロック行）
//! - created resources（キャンセル時に破棄する作りかけのオブジェクト）
//!
//! # 設計原則
//! - 予約とリースの作成は「挿入、重複なら失敗」の原子操作
//! - タスク更新は `version` による compare-and-swap
//! - 予約の解放は複数行の削除を 1 トランザクションで行う
//! - read-then-write の隙間を呼び出し側に作らせない

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    CreatedResource, LockRecord, Reservation, ResourceKey, TaskId, TaskRecord, WorkerMark,
    WorkerName, WorkerRecord,
};

/// Lock row raised by the dispatcher running the maintenance job. While it
/// exists [`Store::lock_resources`] refuses every request.
pub const MAINTENANCE_FENCE: &str = "maintenance";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// An atomic insert found an existing row.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// A compare-and-swap or reservation attempt lost to a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The row is still referenced and cannot be deleted.
    #[error("protected: {0}")]
    Protected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable")]
    Unavailable,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── tasks ──────────────────────────────────────────────────────────────

    /// Fails with `DuplicateKey` if the id already exists.
    async fn insert_task(&self, task: TaskRecord) -> Result<(), StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Writes `task` if the stored version still equals `task.version`, and
    /// returns the stored row with its bumped version. A stale version yields
    /// `Conflict`.
    async fn update_task(&self, task: &TaskRecord) -> Result<TaskRecord, StoreError>;

    /// Rejected with `Protected` while the task still relies on a reservation.
    async fn delete_task(&self, id: TaskId) -> Result<(), StoreError>;

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError>;

    async fn tasks_assigned_to(&self, worker: &WorkerName) -> Result<Vec<TaskRecord>, StoreError>;

    async fn child_tasks(&self, parent: TaskId) -> Result<Vec<TaskId>, StoreError>;

    // ── workers ────────────────────────────────────────────────────────────

    /// Upserts the heartbeat and clears both flags. Returns the row as it was
    /// before the write, or `None` on first sight.
    async fn record_heartbeat(
        &self,
        name: &WorkerName,
        at: DateTime<Utc>,
    ) -> Result<Option<WorkerRecord>, StoreError>;

    async fn get_worker(&self, name: &WorkerName) -> Result<Option<WorkerRecord>, StoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    async fn mark_worker(&self, name: &WorkerName, mark: WorkerMark) -> Result<(), StoreError>;

    // ── reservations ───────────────────────────────────────────────────────

    /// Creates or attaches a reservation for every resource against `worker`,
    /// links `task` to each of them and records `worker` on the task, all or
    /// nothing.
    ///
    /// Fails with `NotFound` if the task is gone, and with `Conflict` if:
    /// - the task is not WAITING or is assigned to another worker
    /// - `worker` has no heartbeat since `alive_since`, or is stopped or
    ///   cleaned up
    /// - any resource is held by a different worker
    /// - the [`MAINTENANCE_FENCE`] row exists
    async fn lock_resources(
        &self,
        worker: &WorkerName,
        task: TaskId,
        resources: &[ResourceKey],
        alive_since: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Unlinks the task from every reservation and deletes the ones left
    /// empty. Returns the freed resources.
    async fn release_task_reservations(&self, task: TaskId)
    -> Result<Vec<ResourceKey>, StoreError>;

    /// Deletes every reservation owned by `worker`, whatever tasks rely on it.
    async fn release_worker_reservations(
        &self,
        worker: &WorkerName,
    ) -> Result<Vec<ResourceKey>, StoreError>;

    async fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError>;

    // ── leases ─────────────────────────────────────────────────────────────

    /// Atomic create; `DuplicateKey` if a row with this name exists.
    async fn insert_lock(&self, lock: LockRecord) -> Result<(), StoreError>;

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, StoreError>;

    /// Renews the timestamp if `owner` still holds the row. `false` when the
    /// row is gone or held by someone else.
    async fn touch_lock(
        &self,
        name: &str,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Deletes the row only if `owner` holds it.
    async fn delete_lock(&self, name: &str, owner: &str) -> Result<bool, StoreError>;

    /// Deletes the row only if its timestamp is older than `older_than`.
    async fn delete_stale_lock(
        &self,
        name: &str,
        older_than: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // ── created resources ──────────────────────────────────────────────────

    async fn record_created_resource(
        &self,
        task: TaskId,
        resource: CreatedResource,
    ) -> Result<(), StoreError>;

    /// Marks every created resource of the task as finalized. Returns how many
    /// changed.
    async fn finalize_created_resources(&self, task: TaskId) -> Result<usize, StoreError>;

    /// Removes and returns the task's unfinalized created resources.
    async fn take_unfinalized_resources(
        &self,
        task: TaskId,
    ) -> Result<Vec<CreatedResource>, StoreError>;
}
