//! WorkerRegistry - heartbeat と生存判定
//!
//! 保存するのは heartbeat 時刻と 2 つのフラグだけで、online / missing /
//! dirty は問い合わせのたびに TTL から導出します。

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::config::TaskingConfig;
use crate::domain::{ProcessRole, ResourceKey, WorkerName, WorkerRecord};
use crate::error::{ReservationError, TetherError};
use crate::ports::{Clock, Store, StoreError};

#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: Arc<TaskingConfig>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: Arc<TaskingConfig>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Oldest heartbeat that still counts as online.
    pub fn alive_since(&self) -> DateTime<Utc> {
        self.clock.now() - self.config.worker_ttl_chrono()
    }

    pub fn role_of(&self, name: &WorkerName) -> ProcessRole {
        if name.has_prefix(&self.config.dispatcher_prefix) {
            ProcessRole::Dispatcher
        } else if name.has_prefix(&self.config.worker_prefix) {
            ProcessRole::Worker
        } else {
            ProcessRole::Other
        }
    }

    /// Idempotent upsert. Logs when a process shows up for the first time or
    /// comes back after being offline.
    pub async fn record_heartbeat(&self, name: &WorkerName) -> Result<(), StoreError> {
        let now = self.clock.now();
        let ttl = self.config.worker_ttl_chrono();
        match self.store.record_heartbeat(name, now).await? {
            None => info!(worker = %name, role = ?self.role_of(name), "worker online"),
            Some(previous) if !previous.is_online(now, ttl) => {
                info!(worker = %name, liveness = ?previous.liveness(now, ttl), "worker recovered")
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn filtered(
        &self,
        keep: impl Fn(&WorkerRecord) -> bool,
    ) -> Result<Vec<WorkerRecord>, StoreError> {
        Ok(self
            .store
            .list_workers()
            .await?
            .into_iter()
            .filter(|w| keep(w))
            .collect())
    }

    pub async fn online_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let (now, ttl) = (self.clock.now(), self.config.worker_ttl_chrono());
        self.filtered(|w| w.is_online(now, ttl)).await
    }

    pub async fn missing_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let (now, ttl) = (self.clock.now(), self.config.worker_ttl_chrono());
        self.filtered(|w| w.is_missing(now, ttl)).await
    }

    /// Missing and not yet cleaned up.
    pub async fn dirty_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let (now, ttl) = (self.clock.now(), self.config.worker_ttl_chrono());
        self.filtered(|w| w.is_dirty(now, ttl)).await
    }

    pub async fn online_with_role(&self, role: ProcessRole) -> Result<Vec<WorkerName>, StoreError> {
        Ok(self
            .online_workers()
            .await?
            .into_iter()
            .map(|w| w.name)
            .filter(|name| self.role_of(name) == role)
            .collect())
    }

    /// A random online ordinary worker holding no reservation at all.
    pub async fn get_unreserved_worker(&self) -> Result<Option<WorkerName>, StoreError> {
        let busy: BTreeSet<WorkerName> = self
            .store
            .list_reservations()
            .await?
            .into_iter()
            .map(|r| r.worker)
            .collect();
        let free: Vec<WorkerName> = self
            .online_with_role(ProcessRole::Worker)
            .await?
            .into_iter()
            .filter(|name| !busy.contains(name))
            .collect();
        Ok(free.choose(&mut rand::thread_rng()).cloned())
    }

    /// The one worker already holding any of `resources`.
    ///
    /// Holding resources from one request on two different workers would
    /// split the task, so that case is an error rather than a pick.
    pub async fn worker_with_any_reservation(
        &self,
        resources: &[ResourceKey],
    ) -> Result<Option<WorkerName>, TetherError> {
        let wanted: BTreeSet<&ResourceKey> = resources.iter().collect();
        let holders: BTreeSet<WorkerName> = self
            .store
            .list_reservations()
            .await?
            .into_iter()
            .filter(|r| wanted.contains(&r.resource))
            .map(|r| r.worker)
            .collect();

        if holders.len() > 1 {
            let workers: Vec<WorkerName> = holders.into_iter().collect();
            warn!(resources = ?resources, workers = ?workers, "resources held by several workers");
            return Err(ReservationError::AmbiguousHolders {
                resources: resources.to_vec(),
                workers,
            }
            .into());
        }
        Ok(holders.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskRecord, WorkerMark};
    use crate::impls::InMemoryStore;
    use crate::ports::{FixedClock, IdGenerator, UlidGenerator};
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<FixedClock>,
        ids: Arc<dyn IdGenerator>,
        registry: WorkerRegistry,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let store = Arc::new(InMemoryStore::new(ids.clone()));
        let config = Arc::new(TaskingConfig {
            worker_ttl_ms: 1_000,
            heartbeat_interval_ms: 100,
            ..TaskingConfig::default()
        });
        let registry = WorkerRegistry::new(store.clone(), clock.clone(), config);
        Fixture {
            store,
            clock,
            ids,
            registry,
        }
    }

    impl Fixture {
        /// Heartbeats `worker` so the store accepts it, then locks one resource.
        async fn lock(&self, worker: &WorkerName, resource: &str) -> TaskId {
            self.registry.record_heartbeat(worker).await.unwrap();
            let id = self.ids.generate_task_id();
            self.store
                .insert_task(TaskRecord::new(id, None, vec![], self.clock.now()))
                .await
                .unwrap();
            let resources = [ResourceKey::from_raw(resource)];
            self.store
                .lock_resources(worker, id, &resources, self.registry.alive_since())
                .await
                .unwrap();
            id
        }
    }

    #[tokio::test]
    async fn liveness_follows_the_ttl_window() {
        let f = fixture();
        let a = WorkerName::new("worker", "a");
        let b = WorkerName::new("worker", "b");
        f.registry.record_heartbeat(&a).await.unwrap();
        f.clock.advance(Duration::milliseconds(800));
        f.registry.record_heartbeat(&b).await.unwrap();
        f.clock.advance(Duration::milliseconds(400));

        let online: Vec<_> = f.registry.online_workers().await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].name, b);

        let dirty = f.registry.dirty_workers().await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].name, a);

        f.store.mark_worker(&a, WorkerMark::CleanedUp).await.unwrap();
        assert!(f.registry.dirty_workers().await.unwrap().is_empty());
        assert_eq!(f.registry.missing_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gracefully_stopped_worker_is_neither_online_nor_missing() {
        let f = fixture();
        let a = WorkerName::new("worker", "a");
        f.registry.record_heartbeat(&a).await.unwrap();
        f.store
            .mark_worker(&a, WorkerMark::GracefullyStopped)
            .await
            .unwrap();

        assert!(f.registry.online_workers().await.unwrap().is_empty());
        f.clock.advance(Duration::seconds(5));
        assert!(f.registry.missing_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreserved_worker_skips_busy_and_dispatchers() {
        let f = fixture();
        let busy = WorkerName::new("worker", "busy");
        let free = WorkerName::new("worker", "free");
        let dispatcher = WorkerName::new("dispatcher", "d");
        for name in [&busy, &free, &dispatcher] {
            f.registry.record_heartbeat(name).await.unwrap();
        }
        f.lock(&busy, "repo:A").await;

        for _ in 0..10 {
            assert_eq!(f.registry.get_unreserved_worker().await.unwrap(), Some(free.clone()));
        }
    }

    #[tokio::test]
    async fn holder_lookup_prefers_existing_owner() {
        let f = fixture();
        let a = WorkerName::new("worker", "a");
        f.lock(&a, "repo:A").await;

        let holder = f
            .registry
            .worker_with_any_reservation(&[
                ResourceKey::from_raw("repo:A"),
                ResourceKey::from_raw("repo:B"),
            ])
            .await
            .unwrap();
        assert_eq!(holder, Some(a));
    }

    #[tokio::test]
    async fn split_holders_are_ambiguous() {
        let f = fixture();
        f.lock(&WorkerName::new("worker", "a"), "repo:A").await;
        f.lock(&WorkerName::new("worker", "b"), "repo:B").await;

        let err = f
            .registry
            .worker_with_any_reservation(&[
                ResourceKey::from_raw("repo:A"),
                ResourceKey::from_raw("repo:B"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TetherError::Reservation(ReservationError::AmbiguousHolders { .. })
        ));
    }

    #[test]
    fn roles_come_from_prefixes() {
        let f = fixture();
        assert_eq!(
            f.registry.role_of(&WorkerName::new("worker", "h")),
            ProcessRole::Worker
        );
        assert_eq!(
            f.registry.role_of(&WorkerName::new("dispatcher", "h")),
            ProcessRole::Dispatcher
        );
        assert_eq!(
            f.registry.role_of(&WorkerName::from_raw("celery@h")),
            ProcessRole::Other
        );
    }
}
