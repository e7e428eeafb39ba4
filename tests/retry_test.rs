use alias_pool::{Error, RetryPolicy};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn transient() -> Error {
    Error::Transient {
        alias: "default".to_string(),
        source: Box::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
    }
}

#[tokio::test]
async fn test_exhausts_after_max_attempts() {
    let policy = RetryPolicy::new()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_millis(100))
        .with_jitter(0.25);
    let calls = &AtomicU32::new(0);
    let start = Instant::now();
    let err = policy
        .run(move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(transient())
        })
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // two sleeps: 100ms and 200ms, jitter only ever adds
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300 + 75 + 500), "{:?}", elapsed);
    match err {
        Error::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, Error::Transient { .. }));
        }
        other => panic!("unexpected {other}"),
    }
}

#[tokio::test]
async fn test_fatal_is_not_retried() {
    let policy = RetryPolicy::new().with_max_attempts(5);
    let calls = &AtomicU32::new(0);
    let err = policy
        .run(move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Fatal {
                alias: "default".to_string(),
                source: Box::new(io::Error::from(io::ErrorKind::PermissionDenied)),
            })
        })
        .await
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, Error::Fatal { .. }));
}

#[tokio::test]
async fn test_timeout_retry_is_opt_in() {
    let calls = &AtomicU32::new(0);
    let op = move |_: u32| async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(Error::Timeout(Duration::from_millis(1)))
    };

    let err = RetryPolicy::new().run(op).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let err = RetryPolicy::new()
        .with_max_attempts(2)
        .with_base_delay(Duration::from_millis(1))
        .with_retry_on_timeout(true)
        .run(op)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_recovers_after_transient_failures() {
    let policy = RetryPolicy::new().with_base_delay(Duration::from_millis(1));
    let v = policy
        .run(|attempt| async move {
            if attempt < 2 {
                Err(transient())
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
    assert_eq!(v, 2);
}

#[test]
fn test_single_attempt_policy() {
    let p = RetryPolicy::none();
    assert_eq!(p.max_attempts, 1);
    assert_eq!(RetryPolicy::new().with_max_attempts(0).max_attempts, 1);
}
