//! MessageQueue port - 配送キュー
//!
//! 名前付きキューへの publish / consume（at-least-once）と、
//! 実行中ジョブを止めるための kill プリミティブを提供します。
//!
//! # キュー
//! - 受付キュー（intake）: `Message::Dispatch` のみ
//! - ワーカー専用キュー（ワーカー名と同じ名前）: `Message::Run` / `Message::Release`
//!
//! # 確認応答
//! consume したメッセージは ack するまで「未確認」として残ります。
//! 消費者が ack せずに消えた場合は `recover` で先頭に戻せます。

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::domain::{Message, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable")]
    Unavailable,
}

/// Identifies one delivery until it is acked or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub message: Message,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, queue: &str, message: Message) -> Result<(), QueueError>;

    /// Waits up to `wait` for a message. `Ok(None)` on timeout.
    ///
    /// The message stays unacked under `consumer` until [`ack`](Self::ack)
    /// or [`reject`](Self::reject) is called with its tag.
    async fn consume(
        &self,
        queue: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Forgets a delivery for good. Unknown tags are ignored.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Puts an unacked delivery back at the head of its queue. Unknown tags
    /// are ignored.
    async fn reject(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Requeues every unacked delivery of `queue` not held by `keep`, oldest
    /// first, and returns how many were requeued.
    async fn recover(&self, queue: &str, keep: &str) -> Result<usize, QueueError>;

    /// Asks whoever is executing `task` to stop.
    async fn kill(&self, task: TaskId) -> Result<(), QueueError>;

    async fn is_killed(&self, task: TaskId) -> Result<bool, QueueError>;

    /// Drops the kill flag of a task nobody will execute any more.
    async fn forget_kill(&self, task: TaskId) -> Result<(), QueueError>;

    /// Kill signals issued after the call.
    fn subscribe_kills(&self) -> broadcast::Receiver<TaskId>;

    /// Ready messages only; unacked deliveries are not counted.
    async fn depth(&self, queue: &str) -> Result<usize, QueueError>;
}
