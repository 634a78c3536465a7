//! Distributed lock property tests.
//!
//! Uses the in-memory store (same atomic primitives as the MongoDB store)
//! with tokio's paused time so lease windows elapse instantly. Concurrent
//! `with_lock` callers simulate separate server processes: nothing below the
//! store is shared between them.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rally_service::errors::RallyError;
use rally_service::lock::{DistributedLock, DEFAULT_PREEMPT_TIMEOUT};
use rally_service::store::CoordStore;
use rally_test_utils::{fixtures, MemoryCoordStore};

fn lock_service(store: &Arc<MemoryCoordStore>) -> DistributedLock {
    let store: Arc<dyn CoordStore> = Arc::clone(store) as Arc<dyn CoordStore>;
    DistributedLock::new(store, DEFAULT_PREEMPT_TIMEOUT)
}

#[tokio::test(start_paused = true)]
async fn test_critical_sections_never_overlap() {
    let store = Arc::new(MemoryCoordStore::new());
    let in_section = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock = lock_service(&store);
        let in_section = Arc::clone(&in_section);
        let overlapped = Arc::clone(&overlapped);
        let completed = Arc::clone(&completed);

        handles.push(tokio::spawn(async move {
            lock.with_lock("drive:hunt1", |_handle| async {
                if in_section.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_section.store(false, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RallyError>(())
            })
            .await
            .unwrap();
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(
        !overlapped.load(Ordering::SeqCst),
        "Critical sections for the same name must never overlap"
    );
    assert_eq!(completed.load(Ordering::SeqCst), 8);
    assert!(
        store.get_lock("drive:hunt1").is_none(),
        "Lock document must be gone after all sections exit"
    );
}

#[tokio::test(start_paused = true)]
async fn test_contender_wakes_on_release() {
    let store = Arc::new(MemoryCoordStore::new());
    let lock = lock_service(&store);

    let holder_store = Arc::clone(&store);
    let holder = tokio::spawn(async move {
        let lock = lock_service(&holder_store);
        lock.with_lock("api-key", |_| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, RallyError>(())
        })
        .await
        .unwrap();
    });

    // Give the holder a head start so the contender actually contends.
    tokio::time::sleep(Duration::from_millis(1)).await;

    let value = lock
        .with_lock("api-key", |_| async { Ok::<_, RallyError>(42) })
        .await
        .unwrap();

    assert_eq!(value, 42);
    holder.await.unwrap();
    assert!(store.get_lock("api-key").is_none());
}

#[tokio::test]
async fn test_stale_holder_is_preempted() {
    let store = Arc::new(MemoryCoordStore::new());
    // A holder whose lease started well past the 10s window, never renewed.
    let stale = store.seed_lock("drive:hunt1", fixtures::seconds_ago(30), None);

    let lock = lock_service(&store);
    let acquired_id = lock
        .with_lock("drive:hunt1", |handle| {
            let store = Arc::clone(&store);
            async move {
                assert_eq!(handle.name(), "drive:hunt1");
                let ours = store.get_lock("drive:hunt1").unwrap();
                Ok::<_, RallyError>(ours.id)
            }
        })
        .await
        .unwrap();

    assert!(
        store.get_lock("drive:hunt1").is_none(),
        "Both the stale document and ours must be gone"
    );
    // The stale document was deleted, not reused.
    assert_ne!(stale.id, acquired_id);
}

#[tokio::test(start_paused = true)]
async fn test_contenders_serialize_after_preemption() {
    let store = Arc::new(MemoryCoordStore::new());
    store.seed_lock("drive:hunt1", fixtures::seconds_ago(30), None);

    let in_section = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let lock = lock_service(&store);
        let in_section = Arc::clone(&in_section);
        let overlapped = Arc::clone(&overlapped);
        let completed = Arc::clone(&completed);

        handles.push(tokio::spawn(async move {
            lock.with_lock("drive:hunt1", |_| async {
                if in_section.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.store(false, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RallyError>(())
            })
            .await
            .unwrap();
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(!overlapped.load(Ordering::SeqCst));
    assert_eq!(completed.load(Ordering::SeqCst), 4);
    assert!(store.get_lock("drive:hunt1").is_none());
}

#[tokio::test]
async fn test_renew_extends_lease() {
    let store = Arc::new(MemoryCoordStore::new());
    let lock = lock_service(&store);

    lock.with_lock("drive:hunt1", |handle| {
        let store = Arc::clone(&store);
        async move {
            let before = store.get_lock("drive:hunt1").unwrap();
            assert!(before.renewed_at.is_none());

            handle.renew().await?;

            let after = store.get_lock("drive:hunt1").unwrap();
            assert!(after.renewed_at.is_some(), "renew must bump renewedAt");

            // A preemption matching the pre-renewal lease state must miss.
            let preempted = store.preempt_lock(&after.id, before.renewed_at).await?;
            assert!(
                !preempted,
                "Preemption matching a stale renewedAt must not delete a renewed lease"
            );
            Ok::<_, RallyError>(())
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_renew_after_preemption_fails_hard() {
    let store = Arc::new(MemoryCoordStore::new());
    let lock = lock_service(&store);

    let result = lock
        .with_lock("drive:hunt1", |handle| {
            let store = Arc::clone(&store);
            async move {
                // Another process preempts us mid-section.
                let current = store.get_lock("drive:hunt1").unwrap();
                let stolen = store.preempt_lock(&current.id, current.renewed_at).await?;
                assert!(stolen);

                handle.renew().await?;
                Ok::<_, RallyError>(())
            }
        })
        .await;

    assert!(
        matches!(result, Err(RallyError::LockLost(ref name)) if name == "drive:hunt1"),
        "renew on a preempted lock must throw LockLost, got {result:?}"
    );
}

#[tokio::test]
async fn test_lock_released_when_critical_section_errors() {
    let store = Arc::new(MemoryCoordStore::new());
    let lock = lock_service(&store);

    let result: Result<(), RallyError> = lock
        .with_lock("drive:hunt1", |_| async {
            Err(RallyError::Internal("boom".to_string()))
        })
        .await;

    assert!(result.is_err());
    assert!(
        store.get_lock("drive:hunt1").is_none(),
        "Lock must be released on the error path"
    );
}

#[tokio::test(start_paused = true)]
async fn test_lock_released_when_task_aborted() {
    let store = Arc::new(MemoryCoordStore::new());
    let lock = lock_service(&store);

    let task = tokio::spawn(async move {
        lock.with_lock("drive:hunt1", |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, RallyError>(())
        })
        .await
    });

    // Let the task acquire and park inside the critical section.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(store.get_lock("drive:hunt1").is_some());

    task.abort();
    let _ = task.await;

    // The drop guard schedules the release on the runtime.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(
        store.get_lock("drive:hunt1").is_none(),
        "Abandoned lock must be released by the drop guard"
    );
}

#[tokio::test]
async fn test_with_lock_returns_critical_section_result() {
    let store = Arc::new(MemoryCoordStore::new());
    let lock = lock_service(&store);

    let value = lock
        .with_lock("drive:hunt1", |_| async { Ok::<_, RallyError>("created") })
        .await
        .unwrap();

    assert_eq!(value, "created");
}

#[tokio::test]
async fn test_locks_with_different_names_are_independent() {
    let store = Arc::new(MemoryCoordStore::new());
    let lock = lock_service(&store);

    lock.with_lock("drive:hunt1", |_| {
        let lock = lock_service(&store);
        async move {
            // A different name must not contend with the held one.
            lock.with_lock("api-key:hunt1", |_| async { Ok::<_, RallyError>(()) })
                .await
        }
    })
    .await
    .unwrap();
}
