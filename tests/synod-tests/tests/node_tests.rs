use anyhow::Result;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use synod::node::{NodeConfig, NodeRegistration, StartupBarrier};
use synod::registry::{KvRegistry, ServerRegistry};
use synod::server::Role;
use synod::store::MemStore;
use synod::{Error, HostAddress};
use synod_tests::*;

fn node_config(host: &str) -> NodeConfig {
    NodeConfig {
        address: host.parse().unwrap(),
        role: Role::Observer,
        peer_port: 2888,
        election_port: 3888,
        client_port: 2181,
    }
}

#[test_log::test(tokio::test)]
async fn a_known_address_reuses_its_id() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let registration = NodeRegistration::new(store, layout());
    let address: HostAddress = "10.0.0.1".parse()?;

    let first = registration.acquire_id(&address).await?;
    // A restart at the same address must keep the old identity, never
    // allocate a new one.
    let second = registration.acquire_id(&address).await?;
    assert_eq!(first, second);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn distinct_addresses_get_distinct_ids() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let registration = NodeRegistration::new(store, layout());

    let a = registration.acquire_id(&"10.0.0.1".parse()?).await?;
    let b = registration.acquire_id(&"10.0.0.2".parse()?).await?;
    assert_ne!(a, b);
    Ok(())
}

#[serial]
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn concurrent_claims_never_share_an_id() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let registration = Arc::new(NodeRegistration::new(store, layout()));

    let (ra, rb) = tokio::join!(
        {
            let registration = registration.clone();
            async move { registration.acquire_id(&"10.0.0.1".parse().unwrap()).await }
        },
        {
            let registration = registration.clone();
            async move { registration.acquire_id(&"10.0.0.2".parse().unwrap()).await }
        }
    );

    // A loser of the claim race fails deterministically; it never walks
    // away holding the same id as the winner.
    let ids: Vec<_> = [&ra, &rb].iter().filter_map(|r| r.as_ref().ok()).copied().collect();
    assert!(!ids.is_empty());
    assert_eq!(
        ids.len(),
        ids.iter().collect::<std::collections::HashSet<_>>().len()
    );
    for r in [&ra, &rb] {
        if let Err(err) = r {
            assert!(matches!(err, Error::AlreadyRegistered(_)));
        }
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn registration_failure_propagates() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let registration = NodeRegistration::new(store.clone(), layout());

    let config = node_config("10.0.0.1");
    let id = registration.acquire_id(&config.address).await?;
    let record = config.record(id)?;
    registration.register(&record).await?;

    // A second node racing for the same id must fail its startup outright.
    let rival = KvRegistry::new(store, layout());
    let err = rival.register(&record).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyRegistered(_)));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unregister_then_reregister() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let registration = NodeRegistration::new(store, layout());

    let config = node_config("10.0.0.1");
    let id = registration.acquire_id(&config.address).await?;
    let record = config.record(id)?;

    registration.register(&record).await?;
    registration.unregister(&record).await?;
    registration.register(&record).await?;
    Ok(())
}

#[serial]
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn barrier_blocks_until_started() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let registration = NodeRegistration::new(store.clone(), layout());

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move {
            StartupBarrier::new(store, layout())
                .with_poll_delay(Duration::from_millis(50))
                .wait_for_startup()
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());

    registration.mark_started().await?;
    tokio::time::timeout(Duration::from_secs(2), waiter).await???;

    // A waiter arriving after the fact releases immediately.
    let late = StartupBarrier::new(store, layout());
    tokio::time::timeout(Duration::from_secs(1), late.wait_for_startup()).await??;
    Ok(())
}

#[serial]
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn barrier_ignores_other_state_values() -> Result<()> {
    use synod::store::{KvStore, WriteGuard};

    let store = Arc::new(MemStore::new());
    store
        .put(&layout().state_key(), "starting", WriteGuard::none())
        .await?;

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move {
            StartupBarrier::new(store, layout())
                .with_poll_delay(Duration::from_millis(50))
                .wait_for_startup()
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());

    store
        .put(&layout().state_key(), synod::node::STARTED, WriteGuard::none())
        .await?;
    tokio::time::timeout(Duration::from_secs(2), waiter).await???;
    Ok(())
}
