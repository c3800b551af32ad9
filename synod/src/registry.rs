use super::*;

use crate::server::ServerRecord;
use crate::store::{KvStore, StoreError, WriteGuard};
use async_trait::async_trait;
use tracing::info;

/// Shared registry of the ensemble members currently known to exist.
///
/// The registry is eventually consistent with the live ensemble: it may
/// briefly diverge, but reconciliation re-synchronizes the ensemble whenever
/// the registry changes. Entries are best-effort liveness only; a crashed
/// node leaves a stale entry behind.
#[async_trait]
pub trait ServerRegistry: Send + Sync + 'static {
    /// Add a server. The server must be ready to accept traffic, as it will
    /// join the quorum some time after registration. Fails with
    /// [`Error::AlreadyRegistered`] if the id is taken.
    async fn register(&self, server: &ServerRecord) -> Result<(), Error>;

    /// Remove a server. The quorum drops it shortly after deregistration.
    /// Fails with [`Error::NotRegistered`] if the id is unknown.
    async fn deregister(&self, server: &ServerRecord) -> Result<(), Error>;

    /// The current full snapshot, unordered. An empty namespace is an empty
    /// list, not an error.
    async fn list_servers(&self) -> Result<Vec<ServerRecord>, Error>;
}

/// [`ServerRegistry`] backed by a watched key-value store.
///
/// Records are stored as JSON under `<layout>/servers/<id>`; every mutation
/// carries a store-level precondition so two racing writers cannot both
/// claim the same id.
pub struct KvRegistry<S> {
    store: Arc<S>,
    layout: StoreLayout,
}

impl<S> KvRegistry<S> {
    pub fn new(store: Arc<S>, layout: StoreLayout) -> Self {
        Self { store, layout }
    }
}

#[async_trait]
impl<S: KvStore> ServerRegistry for KvRegistry<S> {
    async fn register(&self, server: &ServerRecord) -> Result<(), Error> {
        server.validate()?;
        let key = self.layout.server_key(server.id);
        let value = serde_json::to_string(server)
            .map_err(|e| Error::malformed("server record", e))?;

        info!(
            "registering server {} as {}",
            server.id,
            server.connection_spec()
        );
        match self
            .store
            .put(&key, &value, WriteGuard::must_not_exist())
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::KeyExists(_)) => Err(Error::AlreadyRegistered(server.id)),
            Err(err) => Err(Error::StoreUnavailable(err)),
        }
    }

    async fn deregister(&self, server: &ServerRecord) -> Result<(), Error> {
        let key = self.layout.server_key(server.id);
        info!("deregistering server {}", server.id);
        match self.store.delete(&key).await {
            Ok(()) => Ok(()),
            Err(StoreError::KeyNotFound(_)) => Err(Error::NotRegistered(server.id)),
            Err(err) => Err(Error::StoreUnavailable(err)),
        }
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>, Error> {
        let snapshot = self
            .store
            .get_dir(&self.layout.servers_dir(), true)
            .await
            .map_err(Error::StoreUnavailable)?;

        let mut servers = Vec::with_capacity(snapshot.nodes.len());
        for node in snapshot.nodes {
            let server: ServerRecord = serde_json::from_str(&node.value).map_err(|e| {
                Error::malformed(format!("server record at {}", node.key), e)
            })?;
            servers.push(server);
        }
        Ok(servers)
    }
}
