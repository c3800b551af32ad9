use super::*;

use crate::server::ServerRecord;
use crate::store::{ChangeAction, ChangeEvent, KvStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::AbortHandle;
use tracing::{debug, error};

/// Wrapper around an `AbortHandle` that aborts when it is dropped.
pub(crate) struct ThreadHandle(pub AbortHandle);

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Receives registry changes. Exactly one listener is attached per watcher.
///
/// Add-delivery must be idempotent: a watcher restart resumes from a fresh
/// cursor and may redeliver adds for entries that already existed.
#[async_trait]
pub trait RegistryListener: Send + Sync + 'static {
    async fn server_added(&self, server: ServerRecord);

    async fn server_removed(&self, id: ServerId);
}

/// Turns the store's long-poll primitive into a durable stream of add and
/// remove callbacks over the registry namespace.
///
/// The watch runs as one task holding a sequence cursor. A transport error
/// is logged, the cursor resets to "next change from now", and the loop
/// continues; the watcher never dies between `start` and `stop`.
pub struct RegistryWatcher<S> {
    inner: Arc<WatchLoop<S>>,
    task: spin::Mutex<Option<ThreadHandle>>,
}

struct WatchLoop<S> {
    store: Arc<S>,
    layout: StoreLayout,
    listener: Arc<dyn RegistryListener>,
    running: AtomicBool,
}

/// Pause before reissuing the wait after a transport error.
const RESTART_BACKOFF: Duration = Duration::from_millis(250);

impl<S: KvStore> RegistryWatcher<S> {
    pub fn new(store: Arc<S>, layout: StoreLayout, listener: Arc<dyn RegistryListener>) -> Self {
        Self {
            inner: Arc::new(WatchLoop {
                store,
                layout,
                listener,
                running: AtomicBool::new(false),
            }),
            task: spin::Mutex::new(None),
        }
    }

    /// Start watching in the background. A no-op if already watching.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let watch = self.inner.clone();
        let hdl = tokio::spawn(async move { watch.run().await }).abort_handle();
        *self.task.lock() = Some(ThreadHandle(hdl));
    }

    /// Stop watching. Cooperative: an in-flight wait may complete and is
    /// then discarded before dispatch.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Whether the watcher is between `start` and `stop`. Reflects the
    /// latest transition, not the state of any in-flight wait.
    pub fn is_watching(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl<S> Drop for RegistryWatcher<S> {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl<S: KvStore> WatchLoop<S> {
    async fn run(self: Arc<Self>) {
        let dir = self.layout.servers_dir();
        let mut cursor: Option<ChangeIndex> = None;
        while self.running.load(Ordering::SeqCst) {
            match self.store.wait_for_change(&dir, true, cursor).await {
                Ok(event) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    cursor = Some(event.index);
                    self.dispatch(event).await;
                }
                Err(err) => {
                    error!("error watching for registry changes: {err}");
                    // Resume from a fresh cursor; add-redelivery is fine
                    // because consumers are idempotent.
                    cursor = None;
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
            }
        }
    }

    async fn dispatch(&self, event: ChangeEvent) {
        match event.action {
            ChangeAction::Create | ChangeAction::Set | ChangeAction::Update => {
                let Some(value) = event.value.as_deref() else {
                    debug!("ignoring valueless change at {}", event.key);
                    return;
                };
                match serde_json::from_str::<ServerRecord>(value) {
                    Ok(server) => {
                        debug!("server added: {server:?}");
                        self.listener.server_added(server).await;
                    }
                    Err(err) => {
                        error!("unable to decode server record at {}: {err}", event.key);
                    }
                }
            }
            ChangeAction::Delete | ChangeAction::Expire => match id_from_key(&event.key) {
                Ok(id) => {
                    debug!("server removed: {id}");
                    self.listener.server_removed(id).await;
                }
                Err(err) => {
                    error!("ignoring removal with non-numeric key {}: {err}", event.key);
                }
            },
        }
    }
}
