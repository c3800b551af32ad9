use super::*;

use crate::registry::{KvRegistry, ServerRegistry};
use crate::server::{connection_string, ServerRecord};
use crate::store::KvStore;
use crate::watcher::{RegistryListener, RegistryWatcher};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// A membership-reconfiguration request against the live ensemble.
///
/// `from_version: None` means "accept whatever configuration the ensemble
/// currently has". Every call this crate issues is unguarded: at most one
/// controller runs per ensemble, and concurrent changes to *different* ids
/// commute.
#[derive(Debug, Clone, Default)]
pub struct Reconfigure {
    /// Server directives to add.
    pub joining: Vec<String>,
    /// Member ids to remove.
    pub leaving: Vec<ServerId>,
    /// If set, replaces the membership wholesale with exactly these
    /// directives; `joining`/`leaving` are empty in that case.
    pub new_members: Option<Vec<String>>,
    pub from_version: Option<i64>,
}

impl Reconfigure {
    pub fn add(directive: String) -> Self {
        Self {
            joining: vec![directive],
            ..Self::default()
        }
    }

    pub fn remove(id: ServerId) -> Self {
        Self {
            leaving: vec![id],
            ..Self::default()
        }
    }

    pub fn replace(members: Vec<String>) -> Self {
        Self {
            new_members: Some(members),
            ..Self::default()
        }
    }
}

/// One live session against the ensemble's membership API.
#[async_trait]
pub trait Ensemble: Send + Sync + 'static {
    async fn reconfigure(&self, req: Reconfigure) -> Result<()>;
}

/// Opens ensemble sessions from a client connection string.
#[async_trait]
pub trait EnsembleConnector: Send + Sync + 'static {
    type Session: Ensemble;

    async fn connect(&self, connection: &str) -> Result<Self::Session>;
}

/// Applies registry changes to the ensemble, one reconfiguration per event.
///
/// A rejected reconfiguration is logged and not re-driven: the registry
/// remains the durable record and a later full resync repairs any drift.
/// Re-adding a member that is already present is a no-op at the ensemble,
/// which is what makes redelivered adds harmless.
pub struct MembershipSync<E> {
    ensemble: E,
}

impl<E: Ensemble> MembershipSync<E> {
    pub fn new(ensemble: E) -> Self {
        Self { ensemble }
    }
}

#[async_trait]
impl<E: Ensemble> RegistryListener for MembershipSync<E> {
    async fn server_added(&self, server: ServerRecord) {
        let directive = server.server_directive();
        info!("adding '{directive}'");
        if let Err(err) = self.ensemble.reconfigure(Reconfigure::add(directive)).await {
            warn!(
                "failed to add server {} to the ensemble: {err}",
                server.id
            );
        }
    }

    async fn server_removed(&self, id: ServerId) {
        info!("removing server {id}");
        if let Err(err) = self.ensemble.reconfigure(Reconfigure::remove(id)).await {
            warn!("failed to remove server {id} from the ensemble: {err}");
        }
    }
}

/// Bootstraps a reconciliation session from the registry and keeps the
/// ensemble's membership synchronized from then on.
pub struct Reconciler<S, C> {
    store: Arc<S>,
    layout: StoreLayout,
    connector: C,
}

impl<S: KvStore, C: EnsembleConnector> Reconciler<S, C> {
    pub fn new(store: Arc<S>, layout: StoreLayout, connector: C) -> Self {
        Self {
            store,
            layout,
            connector,
        }
    }

    /// Read the registry snapshot, connect to the ensemble it describes,
    /// replace the membership wholesale with the snapshot, then follow the
    /// registry's change stream until [`ReconcilerHandle::stop`].
    ///
    /// Fails with [`Error::NoMembers`] if the registry is empty: there is
    /// nothing to connect to.
    pub async fn start(self) -> Result<ReconcilerHandle<S>> {
        let registry = KvRegistry::new(self.store.clone(), self.layout.clone());
        let snapshot = registry.list_servers().await?;
        if snapshot.is_empty() {
            bail!(Error::NoMembers);
        }

        let connection = connection_string(&snapshot);
        info!("connecting to the ensemble at {connection}");
        let session = self.connector.connect(&connection).await?;

        // First write since session establishment; nothing races at
        // bootstrap, so no version guard.
        let members: Vec<String> = snapshot
            .iter()
            .map(ServerRecord::server_directive)
            .collect();
        debug!("initial membership sync: {members:?}");
        session.reconfigure(Reconfigure::replace(members)).await?;

        let sync = Arc::new(MembershipSync::new(session));
        let watcher = RegistryWatcher::new(self.store, self.layout, sync);
        watcher.start();
        Ok(ReconcilerHandle { watcher })
    }
}

/// Handle to a running reconciliation session.
pub struct ReconcilerHandle<S> {
    watcher: RegistryWatcher<S>,
}

impl<S: KvStore> ReconcilerHandle<S> {
    /// Stop following registry changes. The ensemble session itself belongs
    /// to the connector's caller once reconciliation ends.
    pub fn stop(&self) {
        self.watcher.stop();
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_watching()
    }
}
