//! LeaderElection - ロック行によるリース方式のリーダー選出
//!
//! 毎 tick:
//! - リーダーなら自分の行の timestamp を更新（できなければ降格）
//! - それ以外は期限切れの行を消してから原子的に挿入を試みる
//!
//! 挿入に勝った 1 インスタンスだけがリーダーになり、残りは hot spare です。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Duration;
use tracing::{debug, error, info, warn};

use crate::domain::LockRecord;
use crate::ports::{Clock, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderStatus {
    Leader,
    Spare,
}

pub struct LeaderElection {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    lease: String,
    owner: String,
    ttl: Duration,
    leader: AtomicBool,
    /// 一度でも spare だったか（昇格時に failover として記録する）
    was_spare: AtomicBool,
    failed_over: AtomicBool,
}

impl LeaderElection {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        lease: impl Into<String>,
        owner: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            lease: lease.into(),
            owner: owner.into(),
            ttl,
            leader: AtomicBool::new(false),
            was_spare: AtomicBool::new(false),
            failed_over: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Whether this instance took over from another leader at some point.
    pub fn failed_over(&self) -> bool {
        self.failed_over.load(Ordering::SeqCst)
    }

    pub async fn tick(&self) -> LeaderStatus {
        let now = self.clock.now();

        if self.is_leader() {
            match self.store.touch_lock(&self.lease, &self.owner, now).await {
                Ok(true) => return LeaderStatus::Leader,
                Ok(false) => {
                    warn!(lease = %self.lease, owner = %self.owner, "lease lost");
                    self.leader.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    error!(lease = %self.lease, owner = %self.owner, error = %e, "cannot renew lease, stepping down");
                    self.leader.store(false, Ordering::SeqCst);
                    return LeaderStatus::Spare;
                }
            }
        }

        // クラッシュしたリーダーの行を回収
        match self.store.delete_stale_lock(&self.lease, now - self.ttl).await {
            Ok(true) => info!(lease = %self.lease, "removed expired lease"),
            Ok(false) => {}
            Err(e) => {
                debug!(lease = %self.lease, error = %e, "cannot purge expired lease");
                return LeaderStatus::Spare;
            }
        }

        match self
            .store
            .insert_lock(LockRecord::new(&self.lease, &self.owner, now))
            .await
        {
            Ok(()) => self.lead(),
            Err(StoreError::DuplicateKey(_)) => match self.store.get_lock(&self.lease).await {
                // 自分の行が残っていた（降格直後など）: 取り戻す
                Ok(Some(lock)) if lock.owner == self.owner => {
                    match self.store.touch_lock(&self.lease, &self.owner, now).await {
                        Ok(true) => self.lead(),
                        _ => self.spare(),
                    }
                }
                _ => self.spare(),
            },
            Err(e) => {
                debug!(lease = %self.lease, error = %e, "cannot insert lease");
                LeaderStatus::Spare
            }
        }
    }

    fn lead(&self) -> LeaderStatus {
        self.leader.store(true, Ordering::SeqCst);
        if self.was_spare.load(Ordering::SeqCst) {
            self.failed_over.store(true, Ordering::SeqCst);
            info!(lease = %self.lease, owner = %self.owner, "failover");
        } else {
            info!(lease = %self.lease, owner = %self.owner, "acquired lease");
        }
        LeaderStatus::Leader
    }

    /// Someone else holds a live lease.
    fn spare(&self) -> LeaderStatus {
        if !self.was_spare.swap(true, Ordering::SeqCst) {
            info!(lease = %self.lease, owner = %self.owner, "hot spare detected");
        }
        LeaderStatus::Spare
    }

    /// Gives the lease up so a spare can take over on its next tick.
    pub async fn resign(&self) {
        if !self.leader.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.store.delete_lock(&self.lease, &self.owner).await {
            Ok(_) => info!(lease = %self.lease, owner = %self.owner, "lease released"),
            Err(e) => warn!(lease = %self.lease, error = %e, "cannot release lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStore;
    use crate::ports::{FixedClock, IdGenerator, SystemClock, UlidGenerator};
    use chrono::{TimeZone, Utc};

    fn store() -> Arc<InMemoryStore> {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
        Arc::new(InMemoryStore::new(ids))
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn election(store: &Arc<InMemoryStore>, clock: &Arc<FixedClock>, owner: &str) -> LeaderElection {
        LeaderElection::new(
            store.clone(),
            clock.clone(),
            "dispatcher",
            owner,
            Duration::seconds(30),
        )
    }

    #[tokio::test]
    async fn first_inserter_leads_and_the_other_spares() {
        let (store, clock) = (store(), clock());
        let a = election(&store, &clock, "a");
        let b = election(&store, &clock, "b");

        assert_eq!(a.tick().await, LeaderStatus::Leader);
        assert_eq!(b.tick().await, LeaderStatus::Spare);
        assert_eq!(a.tick().await, LeaderStatus::Leader);
        assert_eq!(b.tick().await, LeaderStatus::Spare);
        assert!(!a.failed_over());
    }

    #[tokio::test]
    async fn spare_takes_over_after_ttl() {
        let (store, clock) = (store(), clock());
        let a = election(&store, &clock, "a");
        let b = election(&store, &clock, "b");
        a.tick().await;
        b.tick().await;

        // a stops ticking (crash)
        clock.advance(Duration::seconds(31));
        assert_eq!(b.tick().await, LeaderStatus::Leader);
        assert!(b.failed_over());

        // a wakes up and finds its lease gone
        assert_eq!(a.tick().await, LeaderStatus::Spare);
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn store_outage_demotes_the_leader() {
        let (store, clock) = (store(), clock());
        let a = election(&store, &clock, "a");
        assert_eq!(a.tick().await, LeaderStatus::Leader);

        store.set_available(false);
        assert_eq!(a.tick().await, LeaderStatus::Spare);
        assert!(!a.is_leader());

        // 行はまだ自分のもの: 復旧後に取り戻せる
        store.set_available(true);
        assert_eq!(a.tick().await, LeaderStatus::Leader);
    }

    #[tokio::test]
    async fn resign_hands_over_immediately() {
        let (store, clock) = (store(), clock());
        let a = election(&store, &clock, "a");
        let b = election(&store, &clock, "b");
        a.tick().await;
        b.tick().await;

        a.resign().await;
        assert!(!a.is_leader());
        assert_eq!(b.tick().await, LeaderStatus::Leader);
    }
}
