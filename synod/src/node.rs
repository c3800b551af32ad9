use super::*;

use crate::idgen::IdAllocator;
use crate::registry::{KvRegistry, ServerRegistry};
use crate::server::{Role, ServerRecord};
use crate::store::{KvStore, StoreError, WriteGuard};
use tracing::{debug, info};

/// Value of the state key once the ensemble has formed a first quorum.
pub const STARTED: &str = "started";

/// A joining node's local configuration, resolved by the bootstrap
/// collaborator (environment, container runtime) and passed in as plain
/// values. No process-wide state is read here.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub address: HostAddress,
    pub role: Role,
    pub peer_port: u16,
    pub election_port: u16,
    pub client_port: u16,
}

impl NodeConfig {
    /// The record this node publishes once it holds an id.
    pub fn record(&self, id: ServerId) -> Result<ServerRecord, Error> {
        ServerRecord::new(
            id,
            self.address.clone(),
            self.role,
            self.peer_port,
            self.election_port,
            self.client_port,
        )
    }
}

/// A joining node's interactions with the store: identity acquisition,
/// self-registration and the started signal.
pub struct NodeRegistration<S> {
    store: Arc<S>,
    registry: KvRegistry<S>,
    allocator: IdAllocator<S>,
    layout: StoreLayout,
}

impl<S: KvStore> NodeRegistration<S> {
    pub fn new(store: Arc<S>, layout: StoreLayout) -> Self {
        Self {
            registry: KvRegistry::new(store.clone(), layout.clone()),
            allocator: IdAllocator::new(store.clone(), layout.clone()),
            store,
            layout,
        }
    }

    /// Look up the id previously claimed for `address`, if any. A node
    /// restarting at the same address keeps its old identity.
    pub async fn lookup_id(&self, address: &HostAddress) -> Result<Option<ServerId>, Error> {
        let snapshot = self
            .store
            .get_dir(&self.layout.ids_dir(), false)
            .await
            .map_err(Error::StoreUnavailable)?;

        for node in &snapshot.nodes {
            if key_suffix(&node.key) == address.as_str() {
                let id = node.value.parse().map_err(|_| {
                    Error::malformed(
                        format!("identity entry at {}", node.key),
                        format!("'{}' is not an id", node.value),
                    )
                })?;
                info!("found existing id {id} for {address}");
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Obtain this node's id: reuse the identity-index entry for `address`
    /// if present, otherwise mint a fresh id and claim it.
    ///
    /// The claim write requires that the identity index is unchanged since
    /// it was read, so a concurrent claimant working from the same snapshot
    /// loses deterministically (surfaced as [`Error::AlreadyRegistered`])
    /// instead of silently overwriting.
    pub async fn acquire_id(&self, address: &HostAddress) -> Result<ServerId, Error> {
        if let Some(id) = self.lookup_id(address).await? {
            return Ok(id);
        }

        let snapshot = self
            .store
            .get_dir(&self.layout.ids_dir(), false)
            .await
            .map_err(Error::StoreUnavailable)?;
        let id = self.allocator.generate_id().await?;

        info!("claiming id {id} for {address}");
        let guard = WriteGuard::must_not_exist().unchanged_since(snapshot.index);
        match self
            .store
            .put(&self.layout.id_key(address), &id.to_string(), guard)
            .await
        {
            Ok(()) => Ok(id),
            Err(StoreError::KeyExists(_) | StoreError::GuardFailed { .. }) => {
                Err(Error::AlreadyRegistered(id))
            }
            Err(err) => Err(Error::StoreUnavailable(err)),
        }
    }

    /// Publish this node's record. A failure here must abort startup; a
    /// node must never run believing it registered when it did not.
    pub async fn register(&self, server: &ServerRecord) -> Result<(), Error> {
        self.registry.register(server).await
    }

    /// Withdraw this node's record at graceful shutdown. Best-effort; a
    /// crash leaves a stale entry behind.
    pub async fn unregister(&self, server: &ServerRecord) -> Result<(), Error> {
        self.registry.deregister(server).await
    }

    /// Signal that the ensemble has formed a quorum and is serving. One-way:
    /// once set, the state stays started.
    pub async fn mark_started(&self) -> Result<(), Error> {
        info!("marking the ensemble as started");
        self.store
            .put(&self.layout.state_key(), STARTED, WriteGuard::none())
            .await
            .map_err(Error::StoreUnavailable)
    }
}

/// One-shot gate that releases when the startup-state key reads
/// [`STARTED`].
///
/// Downstream consumers (e.g. a scheduler launch) wait on this instead of
/// inferring readiness from registry entries: "the registry has entries"
/// does not imply "the ensemble is serving".
pub struct StartupBarrier<S> {
    store: Arc<S>,
    layout: StoreLayout,
    poll_delay: Duration,
}

impl<S: KvStore> StartupBarrier<S> {
    pub fn new(store: Arc<S>, layout: StoreLayout) -> Self {
        Self {
            store,
            layout,
            poll_delay: Duration::from_secs(5),
        }
    }

    /// Delay between polls while the state key does not exist yet.
    pub fn with_poll_delay(self, poll_delay: Duration) -> Self {
        Self { poll_delay, ..self }
    }

    /// Block until the started value is observed, then return exactly once.
    /// A barrier created after the key is already started returns
    /// immediately. Any other observed value causes a retry: a fixed sleep
    /// while the key is absent, a wait-for-change once it exists.
    pub async fn wait_for_startup(&self) -> Result<(), Error> {
        let key = self.layout.state_key();
        let mut cursor: Option<ChangeIndex> = None;
        loop {
            let observed = match cursor {
                None => match self.store.get(&key).await {
                    Ok(node) => Some((node.value, node.modified_index)),
                    Err(StoreError::KeyNotFound(_)) => None,
                    Err(err) => return Err(Error::StoreUnavailable(err)),
                },
                Some(index) => match self.store.wait_for_change(&key, false, Some(index)).await {
                    Ok(event) => event.value.map(|value| (value, event.index)),
                    Err(err) => return Err(Error::StoreUnavailable(err)),
                },
            };

            match observed {
                Some((value, _)) if value == STARTED => {
                    debug!("ensemble startup observed");
                    return Ok(());
                }
                Some((value, index)) => {
                    debug!("state is '{value}', waiting for a change");
                    cursor = Some(index);
                }
                None => {
                    debug!("state key does not exist yet");
                    tokio::time::sleep(self.poll_delay).await;
                    cursor = None;
                }
            }
        }
    }
}
