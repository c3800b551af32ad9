use anyhow::Result;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use synod::registry::{KvRegistry, ServerRegistry};
use synod::server::Role;
use synod::store::MemStore;
use synod::watcher::RegistryWatcher;
use synod_tests::*;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

fn fixture() -> (
    Arc<MemStore>,
    KvRegistry<MemStore>,
    Arc<RecordingListener>,
    RegistryWatcher<MemStore>,
) {
    let store = Arc::new(MemStore::new());
    let registry = KvRegistry::new(store.clone(), layout());
    let listener = Arc::new(RecordingListener::default());
    let watcher = RegistryWatcher::new(store.clone(), layout(), listener.clone());
    (store, registry, listener, watcher)
}

#[serial]
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delivers_adds_and_removes_in_order() -> Result<()> {
    let (_store, registry, listener, watcher) = fixture();
    watcher.start();
    assert!(watcher.is_watching());
    settle().await;

    let r1 = record(1, "10.0.0.1", Role::Participant);
    registry.register(&r1).await?;
    assert!(wait_until(EVENT_TIMEOUT, || listener.added_ids() == vec![1]).await);
    assert_eq!(listener.added(), vec![r1.clone()]);

    let r2 = record(2, "10.0.0.2", Role::Observer);
    registry.register(&r2).await?;
    assert!(wait_until(EVENT_TIMEOUT, || listener.added_ids() == vec![1, 2]).await);

    registry.deregister(&r1).await?;
    assert!(wait_until(EVENT_TIMEOUT, || listener.removed() == vec![1]).await);

    watcher.stop();
    Ok(())
}

#[serial]
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn survives_a_wait_transport_error() -> Result<()> {
    let (store, registry, listener, watcher) = fixture();
    watcher.start();
    settle().await;

    registry.register(&record(1, "10.0.0.1", Role::Participant)).await?;
    assert!(wait_until(EVENT_TIMEOUT, || listener.added_ids() == vec![1]).await);

    // The next reissued wait fails; the loop must restart from a fresh
    // cursor instead of dying.
    store.fail_next_waits(1);
    tokio::time::sleep(Duration::from_millis(500)).await;

    registry.register(&record(2, "10.0.0.2", Role::Observer)).await?;
    assert!(wait_until(EVENT_TIMEOUT, || listener.added_ids().contains(&2)).await);
    assert!(watcher.is_watching());

    watcher.stop();
    Ok(())
}

#[serial]
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stop_halts_delivery() -> Result<()> {
    let (_store, registry, listener, watcher) = fixture();
    watcher.start();
    settle().await;

    registry.register(&record(1, "10.0.0.1", Role::Participant)).await?;
    assert!(wait_until(EVENT_TIMEOUT, || listener.added_ids() == vec![1]).await);

    watcher.stop();
    assert!(!watcher.is_watching());

    registry.register(&record(2, "10.0.0.2", Role::Observer)).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(listener.added_ids(), vec![1]);
    Ok(())
}

#[serial]
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn corrupt_entry_is_skipped_not_fatal() -> Result<()> {
    use synod::store::{KvStore, WriteGuard};

    let (store, registry, listener, watcher) = fixture();
    watcher.start();
    settle().await;

    store
        .put(&layout().server_key(1), "not json", WriteGuard::none())
        .await?;
    registry.register(&record(2, "10.0.0.2", Role::Observer)).await?;

    // The undecodable entry is logged and skipped; later events still flow.
    assert!(wait_until(EVENT_TIMEOUT, || listener.added_ids() == vec![2]).await);
    watcher.stop();
    Ok(())
}
