use autoqa::config::LockConfig;
use autoqa::lock_manager::{AcquireOutcome, AcquireRequest, LockManager, LockStatus, OwnerKind};
use autoqa::{EventBus, EventPriority, MemoryStore, Store};
use std::sync::Arc;
use std::time::Duration;

fn manager() -> (Arc<LockManager>, Arc<MemoryStore>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(store.clone(), Default::default()));
    let manager = Arc::new(LockManager::new(
        store.clone(),
        bus,
        LockConfig::default(),
    ));
    (manager, store)
}

fn request(owner: &str, priority: EventPriority) -> AcquireRequest {
    AcquireRequest::new("device1", "device", owner, OwnerKind::AgentInstance)
        .with_priority(priority)
        .with_lease(Duration::from_secs(60))
}

#[tokio::test]
async fn waiters_are_served_in_priority_order() {
    let (manager, _store) = manager();

    assert_eq!(
        manager.acquire(request("A", EventPriority::Normal)).await.unwrap(),
        AcquireOutcome::Acquired
    );
    assert_eq!(
        manager.acquire(request("B", EventPriority::Low)).await.unwrap(),
        AcquireOutcome::Queued { position: 1 }
    );
    // Critical outranks the earlier low-priority waiter.
    assert_eq!(
        manager.acquire(request("C", EventPriority::Critical)).await.unwrap(),
        AcquireOutcome::Queued { position: 1 }
    );

    manager.release("device1", "A").await.unwrap();
    match manager.status("device1").await.unwrap() {
        LockStatus::Held { owner_id, waiters, .. } => {
            assert_eq!(owner_id, "C");
            assert_eq!(waiters, 1);
        }
        other => panic!("expected C to hold the lock, got {:?}", other),
    }

    manager.release("device1", "C").await.unwrap();
    match manager.status("device1").await.unwrap() {
        LockStatus::Held { owner_id, waiters, .. } => {
            assert_eq!(owner_id, "B");
            assert_eq!(waiters, 0);
        }
        other => panic!("expected B to hold the lock, got {:?}", other),
    }

    manager.release("device1", "B").await.unwrap();
    assert_eq!(
        manager.status("device1").await.unwrap(),
        LockStatus::Available
    );
}

#[tokio::test]
async fn release_by_non_owner_is_a_conflict_and_leaves_the_lock() {
    let (manager, _store) = manager();
    manager.acquire(request("A", EventPriority::Normal)).await.unwrap();

    let err = manager.release("device1", "intruder").await.unwrap_err();
    assert_eq!(err.kind(), "conflict");

    match manager.status("device1").await.unwrap() {
        LockStatus::Held { owner_id, .. } => assert_eq!(owner_id, "A"),
        other => panic!("lock should be untouched, got {:?}", other),
    }
}

#[tokio::test]
async fn release_of_unheld_resource_is_not_found() {
    let (manager, _store) = manager();
    let err = manager.release("device1", "A").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn reacquire_by_owner_extends_the_lease() {
    let (manager, store) = manager();
    manager.acquire(request("A", EventPriority::Normal)).await.unwrap();
    let first = store.get_lock("device1").await.unwrap().unwrap().expires_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        manager.acquire(request("A", EventPriority::Normal)).await.unwrap(),
        AcquireOutcome::Acquired
    );
    let second = store.get_lock("device1").await.unwrap().unwrap().expires_at;
    assert!(second > first);
}

#[tokio::test]
async fn acquire_on_expired_lock_succeeds_as_if_unowned() {
    let (manager, _store) = manager();
    let short = AcquireRequest::new("device1", "device", "A", OwnerKind::AgentInstance)
        .with_lease(Duration::from_millis(10));
    assert_eq!(manager.acquire(short).await.unwrap(), AcquireOutcome::Acquired);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        manager.acquire(request("B", EventPriority::Normal)).await.unwrap(),
        AcquireOutcome::Acquired
    );
    match manager.status("device1").await.unwrap() {
        LockStatus::Held { owner_id, .. } => assert_eq!(owner_id, "B"),
        other => panic!("expected B to hold the lock, got {:?}", other),
    }
}

#[tokio::test]
async fn sweeper_reaps_expired_locks_and_promotes_waiters() {
    let (manager, _store) = manager();
    let short = AcquireRequest::new("device1", "device", "A", OwnerKind::AgentInstance)
        .with_lease(Duration::from_millis(10));
    manager.acquire(short).await.unwrap();
    manager.acquire(request("B", EventPriority::Normal)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reaped = manager.sweep_expired().await.unwrap();
    assert_eq!(reaped, 1);

    match manager.status("device1").await.unwrap() {
        LockStatus::Held { owner_id, .. } => assert_eq!(owner_id, "B"),
        other => panic!("expected B promoted by the sweeper, got {:?}", other),
    }
}

#[tokio::test]
async fn blocking_acquire_times_out_and_deletes_the_waiter() {
    let (manager, store) = manager();
    manager.acquire(request("A", EventPriority::Normal)).await.unwrap();

    let blocked = request("B", EventPriority::Normal).with_wait(Duration::from_millis(80));
    assert_eq!(
        manager.acquire_and_wait(blocked).await.unwrap(),
        AcquireOutcome::TimedOut
    );
    assert!(store.waiters_for("device1").await.unwrap().is_empty());
}

#[tokio::test]
async fn blocking_acquire_is_promoted_on_release() {
    let (manager, _store) = manager();
    manager.acquire(request("A", EventPriority::Normal)).await.unwrap();

    let waiter_manager = Arc::clone(&manager);
    let waiter = tokio::spawn(async move {
        let blocked = request("B", EventPriority::High).with_wait(Duration::from_secs(2));
        waiter_manager.acquire_and_wait(blocked).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.release("device1", "A").await.unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), AcquireOutcome::Acquired);
    match manager.status("device1").await.unwrap() {
        LockStatus::Held { owner_id, .. } => assert_eq!(owner_id, "B"),
        other => panic!("expected B to hold the lock, got {:?}", other),
    }
}

#[tokio::test]
async fn release_owned_clears_every_lock_of_an_owner() {
    let (manager, _store) = manager();
    for resource in &["device1", "device2", "device3"] {
        let req = AcquireRequest::new(*resource, "device", "inst-1", OwnerKind::AgentInstance);
        manager.acquire(req).await.unwrap();
    }
    let other = AcquireRequest::new("device4", "device", "inst-2", OwnerKind::AgentInstance);
    manager.acquire(other).await.unwrap();

    assert_eq!(manager.release_owned("inst-1").await.unwrap(), 3);
    assert_eq!(manager.status("device1").await.unwrap(), LockStatus::Available);
    assert_eq!(manager.status("device2").await.unwrap(), LockStatus::Available);
    assert_eq!(manager.status("device3").await.unwrap(), LockStatus::Available);
    match manager.status("device4").await.unwrap() {
        LockStatus::Held { owner_id, .. } => assert_eq!(owner_id, "inst-2"),
        other => panic!("inst-2's lock should survive, got {:?}", other),
    }
}
