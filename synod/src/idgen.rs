use super::*;

use crate::store::{KvStore, StoreError};
use tracing::debug;

/// Allocates globally unique member ids from the store.
///
/// The store mints an atomically named entry in a scratch directory and the
/// id is parsed from the minted name, so no two concurrent callers can
/// receive the same id and ids are never reused, even after the scratch
/// directory is wiped. Ids are monotonic but not sequential.
pub struct IdAllocator<S> {
    store: Arc<S>,
    layout: StoreLayout,
}

impl<S: KvStore> IdAllocator<S> {
    pub fn new(store: Arc<S>, layout: StoreLayout) -> Self {
        Self { store, layout }
    }

    /// Allocate a fresh id.
    ///
    /// Lazily creates the scratch directory on first use, then retries the
    /// append exactly once. Retry policy for a transient
    /// [`Error::StoreUnavailable`] belongs to the caller.
    pub async fn generate_id(&self) -> Result<ServerId, Error> {
        let dir = self.layout.idgen_dir();
        let key = match self.store.create_in_order(&dir, "").await {
            Ok(key) => key,
            Err(StoreError::KeyNotFound(_)) => {
                debug!("creating id scratch directory {dir}");
                match self.store.make_dir(&dir).await {
                    // A concurrent caller may have created it first; the
                    // retried append succeeds against their directory.
                    Ok(()) | Err(StoreError::KeyExists(_)) => {}
                    Err(err) => return Err(Error::StoreUnavailable(err)),
                }
                self.store
                    .create_in_order(&dir, "")
                    .await
                    .map_err(Error::StoreUnavailable)?
            }
            Err(err) => return Err(Error::StoreUnavailable(err)),
        };

        let id = id_from_key(&key)?;
        debug!("allocated id {id} from the store");
        Ok(id)
    }
}
