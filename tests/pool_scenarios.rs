//! The six numbered scenarios of the pool engine's testable properties,
//! against [`common::MockFactory`].

mod common;

use std::time::{Duration, Instant};

use connpool::alert::AlertSink;
use connpool::{Error, Pool};

use common::{base_config, MockFactory};

#[tokio::test]
async fn growth_under_load() {
    let mut config = base_config("growth");
    config.min_connections = 2;
    config.max_connections = 4;
    let pool = Pool::builder(config, MockFactory::default()).build().await.unwrap();

    let c1 = pool.borrow().await.unwrap();
    let c2 = pool.borrow().await.unwrap();
    let c3 = pool.borrow().await.unwrap();

    let status = pool.status(false);
    assert_eq!(status.busy, 3);
    assert_eq!(status.free, 0);

    c2.close().await;
    let status = pool.status(false);
    assert_eq!((status.busy, status.free), (2, 1));

    c3.close().await;
    let status = pool.status(false);
    assert_eq!((status.busy, status.free), (1, 2));

    c1.close().await;
    let status = pool.status(false);
    assert_eq!((status.busy, status.free), (0, 3));
}

#[tokio::test]
async fn timing_statistics() {
    let config = base_config("timing");
    let pool = Pool::builder(config, MockFactory::default()).build().await.unwrap();

    let _ = pool.statistics(true);

    let a = pool.borrow().await.unwrap();
    let b = pool.borrow().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    b.close().await;

    let stats = pool.statistics(false);
    assert_eq!(stats.count, 2);
    assert!(stats.total_micros >= 190_000, "total_micros={}", stats.total_micros);
    assert!(stats.hwm_micros >= 90_000, "hwm_micros={}", stats.hwm_micros);
    assert!(stats.avg_micros >= 90_000, "avg_micros={}", stats.avg_micros);
}

#[tokio::test]
async fn saturation_and_timeout() {
    let mut config = base_config("saturation");
    config.min_connections = 1;
    config.max_connections = 1;
    config.wait_timeout_millis = 50;
    let pool = Pool::builder(config, MockFactory::default()).build().await.unwrap();

    let held = pool.borrow().await.unwrap();

    let start = Instant::now();
    let result = pool.borrow().await;
    let elapsed = start.elapsed();

    match result {
        Err(Error::PoolTimeout { .. }) => {}
        Err(other) => panic!("expected PoolTimeout, got {other:?}"),
        Ok(_) => panic!("expected PoolTimeout, got a session"),
    }
    assert!(elapsed >= Duration::from_millis(50), "elapsed={elapsed:?}");
    assert!(elapsed <= Duration::from_millis(100), "elapsed={elapsed:?}");

    let status = pool.status(false);
    assert_eq!(status.wait_count, 1);

    held.close().await;
}

#[tokio::test]
async fn force_close_return_regrows_for_a_stranded_waiter() {
    let mut config = base_config("stranded-waiter");
    config.min_connections = 0;
    config.max_connections = 1;
    config.wait_timeout_millis = 2_000;
    let pool = Pool::builder(config, MockFactory::default()).build().await.unwrap();

    let mut a = pool.borrow().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.borrow().await });

    wait_until(|| pool.status(false).waiting == 1, Duration::from_secs(1)).await;
    assert_eq!(pool.status(false).waiting, 1);

    a.mark_broken();
    a.close().await;

    let second = tokio::time::timeout(Duration::from_millis(500), waiter)
        .await
        .expect("waiter should be served promptly instead of stalling on its own wait timeout")
        .expect("waiter task panicked")
        .expect("stranded waiter should be served via regrow, not PoolTimeout");

    assert_eq!(pool.status(false).busy, 1);
    second.close().await;
}

#[derive(Default)]
struct CountingAlertSink {
    downs: std::sync::atomic::AtomicUsize,
    ups: std::sync::atomic::AtomicUsize,
}

impl AlertSink for CountingAlertSink {
    fn on_down(&self, _pool_name: &str) {
        self.downs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn on_up(&self, _pool_name: &str) {
        self.ups.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !condition() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn backend_outage_and_recovery() {
    let mut config = base_config("outage");
    config.heartbeat_freq_secs = 1; // the smallest cadence the config allows
    let factory = MockFactory::default();
    let alert = std::sync::Arc::new(CountingAlertSink::default());
    let pool = Pool::builder(config, factory.clone())
        .alert_sink(alert.clone())
        .build()
        .await
        .unwrap();

    assert!(pool.is_up());

    factory.set_failing(true);
    wait_until(|| !pool.is_up(), Duration::from_secs(3)).await;
    assert!(!pool.is_up());
    assert_eq!(alert.downs.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Stay down through a second tick; the alert must not fire twice.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(alert.downs.load(std::sync::atomic::Ordering::SeqCst), 1);

    factory.set_failing(false);
    wait_until(|| pool.is_up(), Duration::from_secs(3)).await;
    assert!(pool.is_up());
    assert_eq!(alert.ups.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn leak_reclamation() {
    let mut config = base_config("leak");
    config.leak_time_minutes = 0;
    let pool = Pool::builder(config, MockFactory::default()).build().await.unwrap();

    let leaked = pool.borrow().await.unwrap();
    assert_eq!(pool.status(false).busy, 1);

    pool.reset().await;

    assert_eq!(pool.status(false).busy, 0);

    // The orphaned handle's own close/drop must not double-count or panic.
    leaked.close().await;
    assert_eq!(pool.status(false).busy, 0);
}

#[tokio::test]
async fn statement_cache_context_isolation() {
    let config = base_config("stmt-cache");
    let pool = Pool::builder(config, MockFactory::default()).build().await.unwrap();

    let mut session = pool.borrow().await.unwrap();

    assert!(session.cached_statement("select 1", "public").is_none());
    session.cache_statement("select 1", "public", Box::new(1u32));
    let first = *session
        .cached_statement("select 1", "public")
        .unwrap()
        .downcast_ref::<u32>()
        .unwrap();
    assert_eq!(first, 1);

    assert!(session.cached_statement("select 1", "other_schema").is_none());
    session.cache_statement("select 1", "other_schema", Box::new(2u32));
    let second = *session
        .cached_statement("select 1", "other_schema")
        .unwrap()
        .downcast_ref::<u32>()
        .unwrap();
    assert_eq!(second, 2);

    // Original context's entry is untouched by the other context's insert.
    let first_again = *session
        .cached_statement("select 1", "public")
        .unwrap()
        .downcast_ref::<u32>()
        .unwrap();
    assert_eq!(first_again, 1);

    session.close().await;
}
