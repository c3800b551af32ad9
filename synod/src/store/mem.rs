use super::*;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// In-memory [`KvStore`] with the same conditional-write and watch semantics
/// as a real coordination store.
///
/// Suitable for tests and single-process embedding. Clones share state.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: spin::Mutex<State>,
    notify: Notify,
    /// Number of upcoming `wait_for_change` calls that fail with an
    /// injected transport error. Used to exercise watcher restart paths.
    fail_waits: AtomicUsize,
}

#[derive(Default)]
struct State {
    index: ChangeIndex,
    entries: BTreeMap<String, Entry>,
    dirs: BTreeSet<String>,
    log: Vec<ChangeEvent>,
}

struct Entry {
    value: String,
    modified_index: ChangeIndex,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` waits fail as if the store were unreachable.
    pub fn fail_next_waits(&self, n: usize) {
        self.inner.fail_waits.store(n, Ordering::SeqCst);
    }

    /// Remove a directory and everything under it, as an external operator
    /// wiping a scratch namespace would.
    pub fn drop_dir(&self, dir: &str) {
        let dir = normalize(dir);
        let mut state = self.inner.state.lock();
        state.dirs.remove(&dir);
        let doomed: Vec<String> = state
            .entries
            .keys()
            .filter(|k| under(&dir, k))
            .cloned()
            .collect();
        for key in doomed {
            state.entries.remove(&key);
            state.record(ChangeAction::Delete, key, None);
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    fn find_change(
        &self,
        key: &str,
        recursive: bool,
        after: ChangeIndex,
    ) -> Option<ChangeEvent> {
        let state = self.inner.state.lock();
        state
            .log
            .iter()
            .find(|ev| ev.index > after && watch_matches(key, recursive, &ev.key))
            .cloned()
    }
}

impl State {
    fn record(&mut self, action: ChangeAction, key: String, value: Option<String>) -> ChangeIndex {
        self.index += 1;
        let index = self.index;
        self.log.push(ChangeEvent {
            action,
            key,
            value,
            index,
        });
        index
    }

    /// Revision of the last change at or under `dir`. 0 if never written.
    fn dir_index(&self, dir: &str) -> ChangeIndex {
        self.log
            .iter()
            .rev()
            .find(|ev| ev.key == dir || under(dir, &ev.key))
            .map(|ev| ev.index)
            .unwrap_or(0)
    }
}

fn normalize(key: &str) -> String {
    key.trim_matches('/').to_owned()
}

fn under(dir: &str, key: &str) -> bool {
    key.len() > dir.len() + 1 && key.starts_with(dir) && key.as_bytes()[dir.len()] == b'/'
}

fn parent(key: &str) -> &str {
    key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn watch_matches(watch_key: &str, recursive: bool, changed_key: &str) -> bool {
    if changed_key == watch_key {
        return true;
    }
    if !under(watch_key, changed_key) {
        return false;
    }
    recursive || !changed_key[watch_key.len() + 1..].contains('/')
}

#[async_trait]
impl KvStore for MemStore {
    async fn get(&self, key: &str) -> Result<KvNode, StoreError> {
        let key = normalize(key);
        let state = self.inner.state.lock();
        match state.entries.get(&key) {
            Some(entry) => Ok(KvNode {
                key,
                value: entry.value.clone(),
                modified_index: entry.modified_index,
            }),
            None => Err(StoreError::KeyNotFound(key)),
        }
    }

    async fn get_dir(&self, dir: &str, recursive: bool) -> Result<DirSnapshot, StoreError> {
        let dir = normalize(dir);
        let state = self.inner.state.lock();
        let nodes = state
            .entries
            .iter()
            .filter(|(key, _)| {
                under(&dir, key) && (recursive || !key[dir.len() + 1..].contains('/'))
            })
            .map(|(key, entry)| KvNode {
                key: key.clone(),
                value: entry.value.clone(),
                modified_index: entry.modified_index,
            })
            .collect();
        Ok(DirSnapshot {
            index: state.dir_index(&dir),
            nodes,
        })
    }

    async fn put(&self, key: &str, value: &str, guard: WriteGuard) -> Result<(), StoreError> {
        let key = normalize(key);
        let mut state = self.inner.state.lock();

        let exists = state.entries.contains_key(&key);
        match guard.prev_exist {
            Some(false) if exists => return Err(StoreError::KeyExists(key)),
            Some(true) if !exists => return Err(StoreError::KeyNotFound(key)),
            _ => {}
        }
        if let Some(expected) = guard.prev_index {
            let actual = state.dir_index(parent(&key));
            if actual != expected {
                return Err(StoreError::GuardFailed {
                    key,
                    expected,
                    actual,
                });
            }
        }

        let action = if exists {
            ChangeAction::Set
        } else {
            ChangeAction::Create
        };
        let index = state.record(action, key.clone(), Some(value.to_owned()));
        state.entries.insert(
            key,
            Entry {
                value: value.to_owned(),
                modified_index: index,
            },
        );
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = normalize(key);
        let mut state = self.inner.state.lock();
        if state.entries.remove(&key).is_none() {
            return Err(StoreError::KeyNotFound(key));
        }
        state.record(ChangeAction::Delete, key, None);
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn create_in_order(&self, dir: &str, value: &str) -> Result<String, StoreError> {
        let dir = normalize(dir);
        let mut state = self.inner.state.lock();
        if !state.dirs.contains(&dir) {
            return Err(StoreError::KeyNotFound(dir));
        }
        // The minted name is the revision of the creating write, which makes
        // names strictly increasing even across scratch-directory wipes.
        let name = state.index + 1;
        let key = format!("{dir}/{name}");
        let index = state.record(ChangeAction::Create, key.clone(), Some(value.to_owned()));
        debug_assert_eq!(index, name);
        state.entries.insert(
            key.clone(),
            Entry {
                value: value.to_owned(),
                modified_index: index,
            },
        );
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(key)
    }

    async fn make_dir(&self, dir: &str) -> Result<(), StoreError> {
        let dir = normalize(dir);
        let mut state = self.inner.state.lock();
        if state.dirs.contains(&dir) || state.entries.contains_key(&dir) {
            return Err(StoreError::KeyExists(dir));
        }
        state.dirs.insert(dir.clone());
        state.record(ChangeAction::Create, dir, None);
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn wait_for_change(
        &self,
        key: &str,
        recursive: bool,
        after: Option<ChangeIndex>,
    ) -> Result<ChangeEvent, StoreError> {
        if self
            .inner
            .fail_waits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unreachable("injected wait failure".to_owned()));
        }

        let key = normalize(key);
        let after = match after {
            Some(index) => index,
            None => self.inner.state.lock().index,
        };

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(ev) = self.find_change(&key, recursive, after) {
                return Ok(ev);
            }
            notified.await;
        }
    }
}
