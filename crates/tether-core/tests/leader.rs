//! リース選出をクロックずれ込みで検証する（FixedClock で決定的に）

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tether_core::app::{LeaderElection, LeaderStatus};
use tether_core::impls::InMemoryStore;
use tether_core::ports::{Clock, FixedClock, IdGenerator, Store, UlidGenerator};

const LEASE: &str = "dispatcher-lease";

fn election(store: &Arc<InMemoryStore>, clock: &Arc<FixedClock>, owner: &str) -> LeaderElection {
    LeaderElection::new(
        store.clone(),
        clock.clone(),
        LEASE.to_string(),
        owner.to_string(),
        Duration::seconds(30),
    )
}

fn fixture() -> (Arc<InMemoryStore>, Arc<FixedClock>, Arc<FixedClock>) {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let a = Arc::new(FixedClock::new(start));
    // b の時計は 10 秒進んでいる
    let b = Arc::new(FixedClock::new(start + Duration::seconds(10)));
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(a.clone()));
    (Arc::new(InMemoryStore::new(ids)), a, b)
}

#[tokio::test]
async fn skew_below_ttl_keeps_one_leader() {
    let (store, clock_a, clock_b) = fixture();
    let a = election(&store, &clock_a, "dispatcher@a");
    let b = election(&store, &clock_b, "dispatcher@b");

    assert_eq!(a.tick().await, LeaderStatus::Leader);
    for _ in 0..5 {
        assert_eq!(b.tick().await, LeaderStatus::Spare);
        clock_a.advance(Duration::seconds(5));
        clock_b.advance(Duration::seconds(5));
        assert_eq!(a.tick().await, LeaderStatus::Leader);
    }
    assert!(!b.is_leader());
    assert!(!b.failed_over());
}

#[tokio::test]
async fn silent_leader_is_replaced_and_steps_down() {
    let (store, clock_a, clock_b) = fixture();
    let a = election(&store, &clock_a, "dispatcher@a");
    let b = election(&store, &clock_b, "dispatcher@b");

    assert_eq!(a.tick().await, LeaderStatus::Leader);
    assert_eq!(b.tick().await, LeaderStatus::Spare);

    // a が止まっている間に b の時計だけが進む
    clock_b.advance(Duration::seconds(25));
    assert_eq!(b.tick().await, LeaderStatus::Leader);
    assert!(b.failed_over());

    let lock = store.get_lock(LEASE).await.unwrap().unwrap();
    assert_eq!(lock.owner, "dispatcher@b");

    // 戻ってきた a はリースを失っていることに気づく
    clock_a.advance(Duration::seconds(1));
    assert_eq!(a.tick().await, LeaderStatus::Spare);
    assert!(!a.is_leader());
    assert!(b.is_leader());
}

#[tokio::test]
async fn lease_is_renewed_by_the_holder() {
    let (store, clock_a, _) = fixture();
    let a = election(&store, &clock_a, "dispatcher@a");

    assert_eq!(a.tick().await, LeaderStatus::Leader);
    let first = store.get_lock(LEASE).await.unwrap().unwrap().timestamp;
    clock_a.advance(Duration::seconds(3));
    assert_eq!(a.tick().await, LeaderStatus::Leader);
    let renewed = store.get_lock(LEASE).await.unwrap().unwrap().timestamp;
    assert_eq!(renewed - first, Duration::seconds(3));
    assert_eq!(renewed, clock_a.now());
}
