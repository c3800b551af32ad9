use super::*;

mod mem;
pub use mem::MemStore;

use async_trait::async_trait;
use thiserror::Error;

/// What happened to a key, as reported by the store's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Create,
    Set,
    Update,
    Delete,
    Expire,
}

/// One change observed on the store.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub key: String,
    /// The value after the change. `None` for deletions and directories.
    pub value: Option<String>,
    pub index: ChangeIndex,
}

/// A key-value entry read from the store.
#[derive(Debug, Clone)]
pub struct KvNode {
    pub key: String,
    pub value: String,
    pub modified_index: ChangeIndex,
}

/// A directory listing together with the revision it was taken at.
///
/// `index` is the last change applied under the directory (0 if it has never
/// been written), usable as a [`WriteGuard::unchanged_since`] witness.
#[derive(Debug, Clone)]
pub struct DirSnapshot {
    pub index: ChangeIndex,
    pub nodes: Vec<KvNode>,
}

impl DirSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Preconditions attached to a write.
///
/// Every mutation this crate performs is guarded; plain read-then-write is
/// never race-safe against other nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteGuard {
    /// `Some(false)`: the key must not exist. `Some(true)`: it must.
    pub prev_exist: Option<bool>,
    /// The key's parent directory must not have changed after this revision.
    pub prev_index: Option<ChangeIndex>,
}

impl WriteGuard {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn must_not_exist() -> Self {
        Self {
            prev_exist: Some(false),
            ..Self::default()
        }
    }

    pub fn must_exist() -> Self {
        Self {
            prev_exist: Some(true),
            ..Self::default()
        }
    }

    pub fn unchanged_since(self, index: ChangeIndex) -> Self {
        Self {
            prev_index: Some(index),
            ..self
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key already exists: {0}")]
    KeyExists(String),

    #[error("guard failed for {key}: directory changed after revision {expected} (now {actual})")]
    GuardFailed {
        key: String,
        expected: ChangeIndex,
        actual: ChangeIndex,
    },

    #[error("store unreachable: {0}")]
    Unreachable(String),
}

/// A watched key-value store offering atomic conditional writes and a
/// blocking "notify on next change" primitive.
///
/// Keys form a `/`-separated hierarchy. This crate imposes no timeout on any
/// operation; timeout policy belongs to the store client and surfaces as
/// [`StoreError::Unreachable`].
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<KvNode, StoreError>;

    /// List a directory. An absent directory is an empty snapshot.
    async fn get_dir(&self, dir: &str, recursive: bool) -> Result<DirSnapshot, StoreError>;

    /// Write a key, subject to `guard`.
    async fn put(&self, key: &str, value: &str, guard: WriteGuard) -> Result<(), StoreError>;

    /// Delete a key. Fails with [`StoreError::KeyNotFound`] if absent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Append an atomically named entry under `dir` and return the new key.
    ///
    /// The store assigns the name; names issued by one store are strictly
    /// increasing and never reused. Fails with [`StoreError::KeyNotFound`]
    /// if `dir` does not exist.
    async fn create_in_order(&self, dir: &str, value: &str) -> Result<String, StoreError>;

    /// Create an empty directory. Fails with [`StoreError::KeyExists`] if
    /// the key is already taken.
    async fn make_dir(&self, dir: &str) -> Result<(), StoreError>;

    /// Block until the next change at or under `key` with a sequence number
    /// greater than `after`. `None` means "the next change from now".
    async fn wait_for_change(
        &self,
        key: &str,
        recursive: bool,
        after: Option<ChangeIndex>,
    ) -> Result<ChangeEvent, StoreError>;
}
