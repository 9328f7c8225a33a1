//! InMemoryMessageQueue - 開発用の配送キュー
//!
//! # 実装詳細
//! - HashMap<String, VecDeque<Message>> でキュー名ごとに管理
//! - tokio の Mutex + Notify で待機（spawn_blocking は不要）
//! - consume したメッセージは tag ごとに unacked へ移し、ack で消す
//! - kill は「kill 済み集合」と broadcast の両方に記録する

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;

use crate::domain::{Message, TaskId};
use crate::ports::{Delivery, DeliveryTag, MessageQueue, QueueError};

const KILL_CHANNEL_CAPACITY: usize = 256;

struct Unacked {
    queue: String,
    consumer: String,
    message: Message,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<Message>>,
    /// tag 順 = 配送順
    unacked: BTreeMap<DeliveryTag, Unacked>,
    next_tag: u64,
    killed: HashSet<TaskId>,
}

impl QueueState {
    fn push_front(&mut self, queue: String, message: Message) {
        self.queues.entry(queue).or_default().push_front(message);
    }
}

pub struct InMemoryMessageQueue {
    state: Mutex<QueueState>,
    /// publish 時の通知用
    notify: Notify,
    kills: broadcast::Sender<TaskId>,
    available: AtomicBool,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        let (kills, _) = broadcast::channel(KILL_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            kills,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable)
        }
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, queue: &str, message: Message) -> Result<(), QueueError> {
        self.check()?;
        {
            let mut state = self.state.lock().await;
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(message);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            self.check()?;

            // 取りこぼし防止: キューを見る前に通知の受け口を作っておく
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(message) = state.queues.get_mut(queue).and_then(|q| q.pop_front()) {
                    state.next_tag += 1;
                    let tag = DeliveryTag(state.next_tag);
                    state.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue.to_string(),
                            consumer: consumer.to_string(),
                            message: message.clone(),
                        },
                    );
                    return Ok(Some(Delivery { tag, message }));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.check()?;
        self.state.lock().await.unacked.remove(&tag);
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.check()?;
        {
            let mut state = self.state.lock().await;
            let Some(entry) = state.unacked.remove(&tag) else {
                return Ok(());
            };
            state.push_front(entry.queue, entry.message);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recover(&self, queue: &str, keep: &str) -> Result<usize, QueueError> {
        self.check()?;
        let count = {
            let mut state = self.state.lock().await;
            let tags: Vec<DeliveryTag> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.queue == queue && u.consumer != keep)
                .map(|(tag, _)| *tag)
                .collect();
            // 新しい順に先頭へ積むと、結果は古い順に並ぶ
            for tag in tags.iter().rev() {
                if let Some(entry) = state.unacked.remove(tag) {
                    state.push_front(entry.queue, entry.message);
                }
            }
            tags.len()
        };
        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    async fn kill(&self, task: TaskId) -> Result<(), QueueError> {
        self.check()?;
        self.state.lock().await.killed.insert(task);
        // 受信者がいなくても構わない
        let _ = self.kills.send(task);
        Ok(())
    }

    async fn is_killed(&self, task: TaskId) -> Result<bool, QueueError> {
        self.check()?;
        Ok(self.state.lock().await.killed.contains(&task))
    }

    async fn forget_kill(&self, task: TaskId) -> Result<(), QueueError> {
        self.check()?;
        self.state.lock().await.killed.remove(&task);
        Ok(())
    }

    fn subscribe_kills(&self) -> broadcast::Receiver<TaskId> {
        self.kills.subscribe()
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ulid::Ulid;

    fn release() -> Message {
        Message::Release {
            task_id: TaskId::from_ulid(Ulid::new()),
        }
    }

    const WAIT: Duration = Duration::from_millis(10);

    async fn take(queue: &InMemoryMessageQueue, name: &str, consumer: &str) -> Option<Message> {
        let delivery = queue.consume(name, consumer, WAIT).await.unwrap()?;
        queue.ack(delivery.tag).await.unwrap();
        Some(delivery.message)
    }

    #[tokio::test]
    async fn messages_come_out_in_publish_order() {
        let queue = InMemoryMessageQueue::new();
        let first = release();
        let second = release();
        queue.publish("w", first.clone()).await.unwrap();
        queue.publish("w", second.clone()).await.unwrap();

        assert_eq!(queue.depth("w").await.unwrap(), 2);
        assert_eq!(take(&queue, "w", "c").await, Some(first));
        assert_eq!(take(&queue, "w", "c").await, Some(second));
        assert_eq!(take(&queue, "w", "c").await, None);
    }

    #[tokio::test]
    async fn queues_are_isolated_by_name() {
        let queue = InMemoryMessageQueue::new();
        queue.publish("a", release()).await.unwrap();
        assert_eq!(take(&queue, "b", "c").await, None);
        assert_eq!(queue.depth("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn waiting_consumer_is_woken_by_publish() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.consume("w", "c", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let message = release();
        queue.publish("w", message.clone()).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message, message);
    }

    #[tokio::test]
    async fn acked_delivery_is_gone_for_good() {
        let queue = InMemoryMessageQueue::new();
        queue.publish("w", release()).await.unwrap();
        let delivery = queue.consume("w", "old", WAIT).await.unwrap().unwrap();
        queue.ack(delivery.tag).await.unwrap();

        assert_eq!(queue.recover("w", "new").await.unwrap(), 0);
        assert_eq!(queue.depth("w").await.unwrap(), 0);
        // 二度目の ack は無視される
        queue.ack(delivery.tag).await.unwrap();
    }

    #[tokio::test]
    async fn deliveries_of_a_vanished_consumer_are_recovered_in_order() {
        let queue = InMemoryMessageQueue::new();
        let (first, second, later) = (release(), release(), release());
        queue.publish("intake", first.clone()).await.unwrap();
        queue.publish("intake", second.clone()).await.unwrap();
        queue.consume("intake", "old", WAIT).await.unwrap().unwrap();
        queue.consume("intake", "old", WAIT).await.unwrap().unwrap();
        queue.publish("intake", later.clone()).await.unwrap();
        let mine = queue.consume("intake", "new", WAIT).await.unwrap().unwrap();
        assert_eq!(mine.message, later);

        // "new" 自身の配送は戻さない
        assert_eq!(queue.recover("intake", "new").await.unwrap(), 2);
        assert_eq!(take(&queue, "intake", "new").await, Some(first));
        assert_eq!(take(&queue, "intake", "new").await, Some(second));
        assert_eq!(take(&queue, "intake", "new").await, None);
    }

    #[tokio::test]
    async fn recover_leaves_other_queues_alone() {
        let queue = InMemoryMessageQueue::new();
        queue.publish("worker@a", release()).await.unwrap();
        queue.consume("worker@a", "worker@a", WAIT).await.unwrap().unwrap();

        assert_eq!(queue.recover("intake", "new").await.unwrap(), 0);
        assert_eq!(queue.depth("worker@a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_delivery_goes_back_to_the_head() {
        let queue = InMemoryMessageQueue::new();
        let (first, second) = (release(), release());
        queue.publish("w", first.clone()).await.unwrap();
        queue.publish("w", second.clone()).await.unwrap();

        let delivery = queue.consume("w", "c", WAIT).await.unwrap().unwrap();
        queue.reject(delivery.tag).await.unwrap();
        assert_eq!(take(&queue, "w", "c").await, Some(first));
        assert_eq!(take(&queue, "w", "c").await, Some(second));
    }

    #[tokio::test]
    async fn kill_is_recorded_and_broadcast() {
        let queue = InMemoryMessageQueue::new();
        let mut kills = queue.subscribe_kills();
        let id = TaskId::from_ulid(Ulid::new());

        assert!(!queue.is_killed(id).await.unwrap());
        queue.kill(id).await.unwrap();
        assert!(queue.is_killed(id).await.unwrap());
        assert_eq!(kills.recv().await.unwrap(), id);
    }

    #[tokio::test]
    async fn forgotten_kill_is_no_longer_reported() {
        let queue = InMemoryMessageQueue::new();
        let id = TaskId::from_ulid(Ulid::new());
        queue.kill(id).await.unwrap();
        queue.forget_kill(id).await.unwrap();
        assert!(!queue.is_killed(id).await.unwrap());
        assert!(queue.state.lock().await.killed.is_empty());
    }

    #[tokio::test]
    async fn unavailable_queue_rejects_publish() {
        let queue = InMemoryMessageQueue::new();
        queue.set_available(false);
        assert_eq!(
            queue.publish("w", release()).await,
            Err(QueueError::Unavailable)
        );
    }
}
