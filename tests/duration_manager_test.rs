mod common;

use alias_pool::plugin::{CheckMode, DurationManager};
use alias_pool::{Error, Pool};
use common::{settings, TestManager};
use std::time::Duration;

async fn open(m: &TestManager, mode: CheckMode) -> Pool<DurationManager<TestManager>> {
    Pool::open("default", settings(1, 5, 0), DurationManager::new(m.clone(), mode))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_skip_interval_basic() {
    let m = TestManager::new();
    let pool = open(&m, CheckMode::SkipInterval(Duration::from_millis(200))).await;

    // freshly opened counts as verified
    pool.get().await.unwrap().release().await;
    assert_eq!(m.checks(), 0);

    tokio::time::sleep(Duration::from_millis(250)).await;
    pool.get().await.unwrap().release().await;
    assert_eq!(m.checks(), 1, "probe runs once the window has passed");

    pool.get().await.unwrap().release().await;
    assert_eq!(m.checks(), 1, "a passing probe restarts the window");
}

#[tokio::test]
async fn test_skip_interval_rapid_releases() {
    let m = TestManager::new();
    let pool = open(&m, CheckMode::SkipInterval(Duration::from_millis(200))).await;
    for _ in 0..10 {
        pool.get().await.unwrap().release().await;
    }
    assert_eq!(m.checks(), 0);
    assert_eq!(pool.state().idle, 1);
}

#[tokio::test]
async fn test_skip_interval_defers_failures() {
    let m = TestManager::new();
    let pool = open(&m, CheckMode::SkipInterval(Duration::from_millis(100))).await;
    m.set_fail_check(true);

    // within the window a failing server goes unnoticed
    let conn = pool.get().await.unwrap();
    let first = conn.id;
    conn.release().await;
    assert_eq!(pool.state().idle, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let conn = pool.get().await.unwrap();
    assert_eq!(conn.id, first);
    conn.release().await;
    assert_eq!(m.checks(), 1);
    assert_eq!(pool.state().retired, 1);
    assert_eq!(pool.state().size, 0);
}

#[tokio::test]
async fn test_max_lifetime_retires_old_connections() {
    let m = TestManager::new();
    let pool = open(&m, CheckMode::MaxLifetime(Duration::from_millis(100))).await;

    let conn = pool.get().await.unwrap();
    let first = conn.id;
    conn.release().await;
    assert_eq!(m.checks(), 1);
    assert_eq!(pool.state().idle, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.get().await.unwrap().release().await;
    assert_eq!(m.checks(), 1, "an expired connection is not probed");
    assert_eq!(m.closes(), 1);
    assert_eq!(pool.state().retired, 1);

    let conn = pool.get().await.unwrap();
    assert_ne!(conn.id, first);
    assert_eq!(m.connects(), 2);
}

#[tokio::test]
async fn test_no_limit_probes_every_release() {
    let m = TestManager::new();
    let pool = open(&m, CheckMode::NoLimit).await;
    for _ in 0..3 {
        pool.get().await.unwrap().release().await;
    }
    assert_eq!(m.checks(), 3);
}

#[tokio::test]
async fn test_fatal_classification_passes_through() {
    let m = TestManager::new();
    let pool = open(&m, CheckMode::NoLimit).await;
    let _held = pool.get().await.unwrap();
    m.set_deny(true);
    assert!(matches!(pool.get().await.unwrap_err(), Error::Fatal { .. }));
    m.set_deny(false);
    m.set_refuse(true);
    assert!(matches!(pool.get().await.unwrap_err(), Error::Transient { .. }));
}
