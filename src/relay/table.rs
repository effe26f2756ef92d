use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use crate::relay::state::SessionState;

/// Anything the table can report a lifecycle state for.
pub trait Tracked {
    fn state(&self) -> SessionState;
}

type Slot<S> = Arc<OnceCell<Arc<S>>>;

/// Concurrent map from key to live session with single-flight creation.
///
/// The map lock only covers fetching or inserting a key's slot. Creation runs
/// inside the slot's `OnceCell`, so racing callers for one key wait on the
/// same creation instead of each opening their own socket.
pub struct SessionTable<K, S> {
    slots: Arc<Mutex<HashMap<K, Slot<S>>>>,
}

impl<K, S> Clone for SessionTable<K, S> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K, S> Default for SessionTable<K, S> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, S> SessionTable<K, S>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the live session for `key`, running `create` if there is none.
    ///
    /// A failed creation is returned to the caller. The empty slot is dropped
    /// by the last caller to give up on it, so the next forward retries.
    pub async fn get_or_create<F, Fut, E>(&self, key: &K, create: F) -> Result<Arc<S>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<S>, E>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(
                slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        match slot.get_or_try_init(create).await {
            Ok(session) => Ok(Arc::clone(session)),
            Err(e) => {
                let mut slots = self.slots.lock().await;
                if let Some(current) = slots.get(key) {
                    // map + this caller; nobody else is still waiting on it
                    if Arc::ptr_eq(current, &slot)
                        && !current.initialized()
                        && Arc::strong_count(&slot) == 2
                    {
                        slots.remove(key);
                    }
                }
                Err(e)
            }
        }
    }

    /// Remove `key` if it still maps to `session`. Idempotent; returns whether
    /// anything was removed.
    pub async fn remove(&self, key: &K, session: &Arc<S>) -> bool {
        let mut slots = self.slots.lock().await;
        let holds_session = slots
            .get(key)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if holds_session {
            slots.remove(key);
        }
        holds_session
    }

    pub async fn get(&self, key: &K) -> Option<Arc<S>> {
        let slots = self.slots.lock().await;
        slots.get(key).and_then(|slot| slot.get().cloned())
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.slots.lock().await.contains_key(key)
    }

    /// Number of keys, including those still being created.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every live session.
    pub async fn sessions(&self) -> Vec<Arc<S>> {
        let slots = self.slots.lock().await;
        slots.values().filter_map(|slot| slot.get().cloned()).collect()
    }
}

impl<K, S> SessionTable<K, S>
where
    K: Eq + Hash + Clone,
    S: Tracked,
{
    pub async fn state(&self, key: &K) -> Option<SessionState> {
        let slots = self.slots.lock().await;
        slots.get(key).map(|slot| match slot.get() {
            Some(session) => session.state(),
            None => SessionState::Connecting,
        })
    }
}
